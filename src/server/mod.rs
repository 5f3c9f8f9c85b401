//! RPC endpoint
//!
//! Serves the CSI calls as JSON over HTTP/1, on a unix socket or a TCP port.
//! The request path names the call (`/csi.v1.Node/NodePublishVolume`), the
//! body carries the request message. Failures come back as
//! `{"code": "...", "message": "..."}` with a matching HTTP status.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::ControllerService;
use crate::error::{Error, Result};
use crate::identity::IdentityService;
use crate::metrics;
use crate::node::NodeService;

/// Request header overriding the server call deadline, in milliseconds.
pub const TIMEOUT_HEADER: &str = "x-csi-timeout-ms";

// =============================================================================
// Endpoint
// =============================================================================

/// Address the RPC server listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Error::Config(format!("empty socket path in endpoint '{}'", s)));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            return addr
                .parse()
                .map(Endpoint::Tcp)
                .map_err(|e| Error::Config(format!("invalid endpoint '{}': {}", s, e)));
        }
        Err(Error::Config(format!(
            "unsupported endpoint '{}', expected unix:// or tcp://",
            s
        )))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Calls logged at info level on entry and exit; every other call logs at
/// debug since the orchestrator polls them.
pub fn is_routine(method: &str) -> bool {
    matches!(method, "NodePublishVolume" | "NodeUnpublishVolume")
}

fn decode<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| Error::invalid_argument(format!("malformed request: {}", e)))
}

fn encode<T: Serialize>(message: T) -> Result<Value> {
    Ok(serde_json::to_value(message)?)
}

/// The services one plugin process exposes.
pub struct Plugin {
    identity: IdentityService,
    controller: Option<Arc<ControllerService>>,
    node: Option<Arc<NodeService>>,
    call_timeout: Duration,
}

impl Plugin {
    pub fn controller(
        identity: IdentityService,
        controller: Arc<ControllerService>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            controller: Some(controller),
            node: None,
            call_timeout,
        }
    }

    pub fn node(identity: IdentityService, node: Arc<NodeService>, call_timeout: Duration) -> Self {
        Self {
            identity,
            controller: None,
            node: Some(node),
            call_timeout,
        }
    }

    /// Run one call under its deadline, with logging and metrics.
    ///
    /// When the deadline expires the caller stops waiting. A publication
    /// keeps running on its own task; other calls are abandoned, external
    /// processes they started running to completion.
    pub async fn call(&self, path: &str, body: &[u8], timeout: Option<Duration>) -> Result<Value> {
        let method = path.rsplit('/').next().unwrap_or(path);
        let routine = is_routine(method);
        let timeout = timeout.unwrap_or(self.call_timeout);
        let started = Instant::now();

        if routine {
            info!(method, "Call started");
        } else {
            debug!(method, "Call started");
        }

        let result = match tokio::time::timeout(timeout, self.dispatch(path, body)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded(timeout)),
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &result {
            Ok(_) => {
                metrics::record_operation(method, "success");
                if routine {
                    info!(method, elapsed_ms, "Call finished");
                } else {
                    debug!(method, elapsed_ms, "Call finished");
                }
            }
            Err(e) => {
                metrics::record_operation(method, &e.code().to_string());
                if matches!(e, Error::NodeBusy) {
                    metrics::record_publish_rejected();
                }
                error!(method, elapsed_ms, code = %e.code(), error = %e, "Call failed");
            }
        }
        result
    }

    fn controller_service(&self, path: &str) -> Result<&ControllerService> {
        self.controller
            .as_deref()
            .ok_or_else(|| Error::Unimplemented(path.to_string()))
    }

    fn node_service(&self, path: &str) -> Result<&Arc<NodeService>> {
        self.node
            .as_ref()
            .ok_or_else(|| Error::Unimplemented(path.to_string()))
    }

    async fn dispatch(&self, path: &str, body: &[u8]) -> Result<Value> {
        let Some((service, method)) = path.trim_start_matches('/').split_once('/') else {
            return Err(Error::Unimplemented(path.to_string()));
        };

        match service {
            "csi.v1.Identity" => match method {
                "GetPluginInfo" => encode(self.identity.get_plugin_info()),
                "Probe" => encode(self.identity.probe()),
                "GetPluginCapabilities" => encode(self.identity.get_plugin_capabilities()),
                _ => Err(Error::Unimplemented(path.to_string())),
            },
            "csi.v1.Controller" => {
                let controller = self.controller_service(path)?;
                match method {
                    "CreateVolume" => encode(controller.create_volume(decode(body)?).await?),
                    "DeleteVolume" => {
                        controller.delete_volume(decode(body)?).await?;
                        encode(crate::csi::Empty {})
                    }
                    "ControllerPublishVolume" => {
                        encode(controller.controller_publish_volume(decode(body)?).await?)
                    }
                    "ControllerUnpublishVolume" => {
                        controller.controller_unpublish_volume(decode(body)?).await?;
                        encode(crate::csi::Empty {})
                    }
                    "ControllerGetCapabilities" => encode(controller.get_capabilities()),
                    _ => Err(Error::Unimplemented(path.to_string())),
                }
            }
            "csi.v1.Node" => {
                let node = self.node_service(path)?;
                match method {
                    "NodePublishVolume" => {
                        node.publish_volume(decode(body)?).await?;
                        encode(crate::csi::Empty {})
                    }
                    "NodeUnpublishVolume" => {
                        node.unpublish_volume(decode(body)?).await?;
                        encode(crate::csi::Empty {})
                    }
                    "NodeGetInfo" => encode(node.get_info().await?),
                    "NodeGetCapabilities" => encode(node.get_capabilities()),
                    "NodeStageVolume" => node.stage_volume().and_then(|_| encode(crate::csi::Empty {})),
                    "NodeUnstageVolume" => node.unstage_volume().and_then(|_| encode(crate::csi::Empty {})),
                    "NodeExpandVolume" => node.expand_volume().and_then(|_| encode(crate::csi::Empty {})),
                    "NodeGetVolumeStats" => {
                        node.get_volume_stats().and_then(|_| encode(crate::csi::Empty {}))
                    }
                    _ => Err(Error::Unimplemented(path.to_string())),
                }
            }
            _ => Err(Error::Unimplemented(path.to_string())),
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("identity", &self.identity)
            .field("controller", &self.controller.is_some())
            .field("node", &self.node.is_some())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

// =============================================================================
// HTTP
// =============================================================================

/// HTTP response carrying an error in the wire format.
pub fn error_response(e: &Error) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(e.code().http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &json!({ "code": e.code(), "message": e.to_string() }))
}

fn json_response(status: StatusCode, value: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn requested_timeout(req: &Request<Incoming>) -> Option<Duration> {
    let value = req.headers().get(TIMEOUT_HEADER)?;
    match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(ms) => Some(Duration::from_millis(ms)),
        None => {
            warn!(header = TIMEOUT_HEADER, "Ignoring malformed call timeout");
            None
        }
    }
}

async fn handle(
    plugin: Arc<Plugin>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let timeout = requested_timeout(&req);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let err = Error::invalid_argument(format!("unreadable request body: {}", e));
            return Ok(error_response(&err));
        }
    };

    let response = match plugin.call(&path, &body, timeout).await {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(e) => error_response(&e),
    };
    Ok(response)
}

fn spawn_connection<S>(stream: S, plugin: Arc<Plugin>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    tokio::spawn(async move {
        let service = service_fn(move |req| handle(Arc::clone(&plugin), req));
        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            error!("RPC connection error: {}", e);
        }
    });
}

async fn bind_unix(path: &Path) -> Result<UnixListener> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            return Err(Error::Internal(format!(
                "Failed to remove stale socket {}: {}",
                path.display(),
                e
            )))
        }
        _ => {}
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    UnixListener::bind(path)
        .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", path.display(), e)))
}

/// Serve RPC calls until `shutdown` is cancelled. Calls in flight at that
/// moment are left to finish on their own.
pub async fn serve(endpoint: Endpoint, plugin: Arc<Plugin>, shutdown: CancellationToken) -> Result<()> {
    info!(endpoint = %endpoint, "RPC server listening");

    match &endpoint {
        Endpoint::Unix(path) => {
            let listener = bind_unix(path).await?;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, _) = accepted?;
                        spawn_connection(stream, Arc::clone(&plugin));
                    }
                }
            }
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!(error = %e, "Could not remove socket");
            }
        }
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", addr, e)))?;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let (stream, _) = accepted?;
                        spawn_connection(stream, Arc::clone(&plugin));
                    }
                }
            }
        }
    }

    info!("RPC server stopped");
    Ok(())
}
