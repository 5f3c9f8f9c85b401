//! Dothill CSI - iSCSI block volumes for Kubernetes
//!
//! A Container Storage Interface plugin for Dothill-based storage arrays
//! (HPE MSA, Seagate and the like). The same binary runs in two roles:
//!
//! - **controller**: provisions volumes on the array through its management
//!   API and maps them to node initiators
//! - **node**: logs into the iSCSI targets, formats blank devices and mounts
//!   them where the kubelet asks
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────── RPC endpoint (server) ───────────────┐
//!                │  Identity  │  ControllerService  │  NodeService      │
//!                └────────────┴──────────┬──────────┴────────┬──────────┘
//!                                        │                   │
//!                                   ArrayClient       IscsiTransport
//!                                        │            CommandRunner
//!                                        ▼                   ▼
//!                               array REST API      iscsiadm, mount, mkfs
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`controller`] - Provisioning coordinator and preflight validation
//! - [`csi`] - Request and response messages
//! - [`domain`] - Domain layer with ports and events (DDD)
//! - [`error`] - Error types
//! - [`identity`] - Plugin identity service
//! - [`metrics`] - Prometheus counters and their HTTP listener
//! - [`node`] - Node attach/detach engine
//! - [`server`] - RPC endpoint

pub mod adapters;
pub mod controller;
pub mod csi;
pub mod domain;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod server;

// Re-export commonly used types
pub use controller::ControllerService;
pub use error::{Error, Result};
pub use identity::IdentityService;
pub use node::{NodeConfig, NodeService, VolumeAttachment};
pub use server::{Endpoint, Plugin};

/// Name the plugin registers under unless configured otherwise.
pub const DEFAULT_PLUGIN_NAME: &str = "dothill.csi.enix.io";

/// Plugin version reported to the orchestrator.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
