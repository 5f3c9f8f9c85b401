//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the value objects exchanged by the plugin services and
//! the abstractions (ports) over everything outside the process: the array
//! management API, the iSCSI session layer, and external process execution.
//! Infrastructure adapters implement these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  ArrayClient │ IscsiTransport │ CommandRunner       │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  RestArrayClient │ IscsiadmTransport │ SystemRunner │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Volume identifier (value object).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How a volume may be accessed by workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    Unknown,
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// Capability requested for a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

impl VolumeCapability {
    pub fn single_node_writer() -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            fs_type: None,
            mount_flags: Vec::new(),
        }
    }
}

/// Source a volume was pre-populated from, echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeContentSource {
    Snapshot { snapshot_id: String },
    Volume { volume_id: String },
}

/// Descriptor of a provisioned volume.
///
/// `volume_context` carries the create parameters verbatim so that every
/// connection setting reaches the node service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub volume_id: VolumeId,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
}

/// One iSCSI target endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub iqn: String,
    pub portal: String,
}

/// Description of an iSCSI session for one volume, persisted on the node
/// after a successful attach and used to drive the detach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    pub targets: Vec<TargetInfo>,
    pub lun: i32,
    #[serde(default)]
    pub do_discovery: bool,
    /// Resolved block devices, one per logged-in path
    #[serde(default)]
    pub devices: Vec<String>,
    /// Device-mapper device when more than one path was found
    #[serde(default)]
    pub multipath_device: Option<String>,
}

impl Connector {
    /// Build a connector with one target per portal, all sharing the IQN.
    pub fn new<I, S>(iqn: &str, portals: I, lun: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: portals
                .into_iter()
                .map(|portal| TargetInfo {
                    iqn: iqn.to_string(),
                    portal: portal.into(),
                })
                .collect(),
            lun,
            do_discovery: true,
            devices: Vec::new(),
            multipath_device: None,
        }
    }

    pub fn is_multipath(&self) -> bool {
        self.devices.len() > 1
    }
}

/// A LUN mapping of a volume to a host on the array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMap {
    pub volume_name: String,
    pub lun: u32,
}

/// Connection settings for the array management API.
#[derive(Clone, PartialEq, Eq)]
pub struct ArrayCredentials {
    pub api_address: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ArrayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayCredentials")
            .field("api_address", &self.api_address)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Result of an external process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Combined stdout and stderr
    pub output: String,
}

impl CommandOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            output: output.into(),
        }
    }

    pub fn failure(code: i32, output: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            output: output.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

// =============================================================================
// Array Port
// =============================================================================

/// Port for the storage array management API.
///
/// The client is a reconfigurable resource: `configure` swaps the API
/// address and credentials, later calls use them. Callers serialize access.
#[async_trait]
pub trait ArrayClient: Send + Sync {
    /// Point the client at an API address and log in.
    async fn configure(&mut self, credentials: &ArrayCredentials) -> Result<()>;

    /// Create a volume of `size` (e.g. `"1024MiB"`) in `pool`.
    async fn create_volume(&self, name: &str, size: &str, pool: &str) -> Result<()>;

    /// Delete a volume.
    async fn delete_volume(&self, name: &str) -> Result<()>;

    /// Map a volume to an initiator at the given LUN.
    async fn map_volume(&self, name: &str, initiator: &str, lun: u32) -> Result<()>;

    /// Unmap a volume from one initiator, or from every host when `None`.
    async fn unmap_volume(&self, name: &str, initiator: Option<&str>) -> Result<()>;

    /// List the mappings of a host.
    async fn show_host_maps(&self, initiator: &str) -> Result<Vec<HostMap>>;

    /// Delete a host.
    async fn delete_host(&self, initiator: &str) -> Result<()>;

    /// Drop pooled idle connections to the array.
    fn close_idle_connections(&mut self);
}

// =============================================================================
// iSCSI Transport Port
// =============================================================================

/// Port for the iSCSI session layer.
#[async_trait]
pub trait IscsiTransport: Send + Sync {
    /// Discover and log into every target of the connector, fill in the
    /// resolved devices and return the device path to use.
    async fn connect(&self, connector: &mut Connector) -> Result<String>;

    /// Flush and remove the connector's devices, then log out of every
    /// target no other attached LUN still uses.
    async fn disconnect(&self, connector: &Connector) -> Result<()>;
}

// =============================================================================
// Process Execution Port
// =============================================================================

/// Port for running external programs synchronously.
///
/// A process that cannot be spawned is an error; a process that exits with
/// a failure is reported through [`CommandOutput::code`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

use super::events::DomainEvent;

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================
