//! Metrics module
//!
//! Process-wide Prometheus counters and the HTTP listener exposing them,
//! together with a liveness endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{Error, Result};

/// Counters of the plugin, registered in a registry of their own.
struct PluginMetrics {
    registry: Registry,
    operations: IntCounterVec,
    publish_rejected: IntCounter,
}

impl PluginMetrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "dothill_csi_operations_total",
                "Total number of CSI calls by operation and result",
            ),
            &["operation", "result"],
        )?;
        registry.register(Box::new(operations.clone()))?;

        let publish_rejected = IntCounter::new(
            "dothill_csi_publish_rejected_total",
            "Publications turned away because another one was in progress",
        )?;
        registry.register(Box::new(publish_rejected.clone()))?;

        Ok(Self {
            registry,
            operations,
            publish_rejected,
        })
    }
}

static METRICS: Lazy<Option<PluginMetrics>> = Lazy::new(|| match PluginMetrics::new() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        error!("Failed to set up metrics: {}", e);
        None
    }
});

/// Count a finished call. `result` is `success` or the error code.
pub fn record_operation(operation: &str, result: &str) {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.operations.with_label_values(&[operation, result]).inc();
    }
}

pub fn record_publish_rejected() {
    if let Some(metrics) = METRICS.as_ref() {
        metrics.publish_rejected.inc();
    }
}

pub fn operation_count(operation: &str, result: &str) -> u64 {
    METRICS
        .as_ref()
        .map(|metrics| metrics.operations.with_label_values(&[operation, result]).get())
        .unwrap_or_default()
}

pub fn publish_rejected_count() -> u64 {
    METRICS
        .as_ref()
        .map(|metrics| metrics.publish_rejected.get())
        .unwrap_or_default()
}

/// Text exposition of the plugin registry.
pub fn render() -> Result<(String, Vec<u8>)> {
    let metrics = METRICS
        .as_ref()
        .ok_or_else(|| Error::Internal("metrics registry unavailable".to_string()))?;

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metrics.registry.gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => match render() {
            Ok((content_type, buffer)) => {
                let mut response = Response::new(Full::new(Bytes::from(buffer)));
                if let Ok(value) = content_type.parse() {
                    response
                        .headers_mut()
                        .insert(hyper::header::CONTENT_TYPE, value);
                }
                response
            }
            Err(e) => {
                error!("{}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
            }
        },
        "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

/// Serve `/metrics` and `/healthz` until `shutdown` is cancelled.
pub async fn run_metrics_server(addr: &str, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?,
        };

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                error!("Metrics server connection error: {}", e);
            }
        });
    }

    info!("Metrics server stopped");
    Ok(())
}
