//! Dothill CSI plugin
//!
//! Runs either the controller role (volume provisioning on the array) or the
//! node role (iSCSI attach and mount) behind the CSI RPC endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       dothill-csi                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ RPC endpoint │───▶│  Controller  │───▶│  Array API   │       │
//! │  │  (unix/tcp)  │    │     or       │    │     or       │       │
//! │  │              │    │    Node      │    │ iscsiadm/fs  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dothill_csi::adapters::{
    IscsiConfig, IscsiadmTransport, LoggingEventPublisher, RestArrayClient, SystemCommandRunner,
};
use dothill_csi::domain::ports::{CommandRunner, EventPublisher};
use dothill_csi::error::Result;
use dothill_csi::metrics::run_metrics_server;
use dothill_csi::node::DEFAULT_INITIATOR_NAME_FILE;
use dothill_csi::{
    server, ControllerService, Endpoint, IdentityService, NodeConfig, NodeService, Plugin,
    DEFAULT_PLUGIN_NAME,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Dothill CSI - iSCSI block volumes for Kubernetes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    role: Role,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// CSI endpoint (unix:///path/to/socket or tcp://host:port)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock", global = true)]
    endpoint: String,

    /// Name the plugin registers under
    #[arg(long, env = "PLUGIN_NAME", default_value = DEFAULT_PLUGIN_NAME, global = true)]
    plugin_name: String,

    /// Metrics and health server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9842", global = true)]
    metrics_addr: String,

    /// Deadline of a call unless the caller sets one, in seconds
    #[arg(long, env = "CALL_TIMEOUT_SECONDS", default_value = "120", global = true)]
    call_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Provision volumes on the array
    Controller(ControllerArgs),
    /// Attach and mount volumes on this node
    Node(NodeArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Array API address used when a call carries none
    #[arg(long, env = "API_ADDRESS")]
    api_address: Option<String>,

    /// Timeout of a single array API request, in seconds
    #[arg(long, env = "ARRAY_TIMEOUT_SECONDS", default_value = "30")]
    array_timeout_secs: u64,
}

#[derive(Args, Debug)]
struct NodeArgs {
    /// Kubelet root directory
    #[arg(long, env = "KUBELET_PATH", default_value = "/var/lib/kubelet")]
    kubelet_path: PathBuf,

    /// open-iscsi initiator name file
    #[arg(long, env = "INITIATOR_NAME_FILE", default_value = DEFAULT_INITIATOR_NAME_FILE)]
    initiator_name_file: PathBuf,

    /// How long to wait for a block device after an iSCSI login, in seconds
    #[arg(long, env = "DEVICE_WAIT_TIMEOUT_SECONDS", default_value = "10")]
    device_wait_timeout_secs: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.common);

    let endpoint: Endpoint = cli.common.endpoint.parse()?;
    let call_timeout = Duration::from_secs(cli.common.call_timeout_secs);
    let events: Arc<dyn EventPublisher> = Arc::new(LoggingEventPublisher::info_level());

    info!("Starting Dothill CSI plugin {}", dothill_csi::VERSION);
    info!("  Plugin name: {}", cli.common.plugin_name);
    info!("  Endpoint: {}", endpoint);
    info!("  Call timeout: {:?}", call_timeout);

    let plugin = match cli.role {
        Role::Controller(args) => {
            info!("  Role: controller");
            info!("  Default API address: {:?}", args.api_address);

            let array = RestArrayClient::new(Duration::from_secs(args.array_timeout_secs))?;
            let controller = ControllerService::new(Box::new(array), args.api_address, events);
            Plugin::controller(
                IdentityService::new(&cli.common.plugin_name, true),
                Arc::new(controller),
                call_timeout,
            )
        }
        Role::Node(args) => {
            info!("  Role: node");
            info!("  Kubelet path: {}", args.kubelet_path.display());

            let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
            let transport = IscsiadmTransport::new(
                IscsiConfig {
                    device_wait_timeout: Duration::from_secs(args.device_wait_timeout_secs),
                    ..Default::default()
                },
                Arc::clone(&runner),
            );
            let config = NodeConfig {
                kubelet_path: args.kubelet_path,
                plugin_name: cli.common.plugin_name.clone(),
                initiator_name_file: args.initiator_name_file,
            };
            let node = NodeService::new(config, Arc::new(transport), runner, events);
            Plugin::node(
                IdentityService::new(&cli.common.plugin_name, false),
                Arc::new(node),
                call_timeout,
            )
        }
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    // Start metrics server
    let metrics_addr = cli.common.metrics_addr.clone();
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    server::serve(endpoint, Arc::new(plugin), shutdown).await?;

    info!("Plugin shutdown complete");
    Ok(())
}

// =============================================================================
// Shutdown
// =============================================================================

async fn wait_for_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = terminate.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            error!("Cannot listen for SIGTERM: {}", e);
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT");
            }
        }
    }

    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &CommonArgs) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
