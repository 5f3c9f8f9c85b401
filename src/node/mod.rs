//! Node module
//!
//! Attaches iSCSI volumes to this node and mounts them for workloads.
//!
//! Nothing is cached between calls. Each call looks at the target path and at
//! the connection record on disk to work out where a volume stands, which
//! makes every call safe to repeat and lets the plugin restart at any time.
//!
//! ```text
//!            connect + persist                mount
//! Detached ─────────────────────▶ Connected ─────────▶ Mounted
//!    ▲                                                    │
//!    └──────────── umount + disconnect + remove ─────────┘
//! ```

pub mod filesystem;
pub mod initiator;
pub mod store;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::csi::{
    NodeGetCapabilitiesResponse, NodeGetInfoResponse, NodePublishVolumeRequest,
    NodeUnpublishVolumeRequest,
};
use crate::domain::events::DomainEvent;
use crate::domain::keys;
use crate::domain::ports::{CommandRunner, Connector, EventPublisher, IscsiTransport};
use crate::error::{Error, Result};

pub use initiator::{read_initiator_name, DEFAULT_INITIATOR_NAME_FILE};
pub use store::ConnectorStore;

/// Publications allowed to run at the same time on one node.
const MAX_CONCURRENT_PUBLICATIONS: usize = 1;

/// Node service configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Kubelet root directory (e.g. `/var/lib/kubelet`)
    pub kubelet_path: PathBuf,
    /// Plugin name, used in the connection record directory
    pub plugin_name: String,
    /// open-iscsi initiator name file
    pub initiator_name_file: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            kubelet_path: PathBuf::from("/var/lib/kubelet"),
            plugin_name: crate::DEFAULT_PLUGIN_NAME.to_string(),
            initiator_name_file: PathBuf::from(DEFAULT_INITIATOR_NAME_FILE),
        }
    }
}

/// Where a volume stands on this node, derived from the target path mount
/// state and the presence of a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeAttachment {
    /// Neither mounted nor recorded
    Detached,
    /// Recorded but not mounted, e.g. a publish that failed after connecting
    /// or an unpublish interrupted after unmounting
    Connected,
    /// Mounted without a record, e.g. a publish interrupted before persisting
    MountedUntracked,
    /// Mounted and recorded
    Mounted,
}

impl VolumeAttachment {
    pub fn from_observation(mounted: bool, recorded: bool) -> Self {
        match (mounted, recorded) {
            (false, false) => Self::Detached,
            (false, true) => Self::Connected,
            (true, false) => Self::MountedUntracked,
            (true, true) => Self::Mounted,
        }
    }
}

/// Value of `key`, looked up in the publish context first.
fn context_value<'a>(
    key: &str,
    publish_context: &'a HashMap<String, String>,
    volume_context: &'a HashMap<String, String>,
) -> Option<&'a str> {
    publish_context
        .get(key)
        .or_else(|| volume_context.get(key))
        .map(String::as_str)
}

/// Build the connection description of a publish request.
pub fn connector_from_request(request: &NodePublishVolumeRequest) -> Result<Connector> {
    let (publish, volume) = (&request.publish_context, &request.volume_context);

    let portals: Vec<&str> = context_value(keys::PORTALS, publish, volume)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if portals.is_empty() {
        return Err(Error::invalid_argument(format!(
            "no iSCSI portal in '{}'",
            keys::PORTALS
        )));
    }

    let iqn = context_value(keys::TARGET_IQN, publish, volume)
        .filter(|iqn| !iqn.is_empty())
        .ok_or_else(|| Error::invalid_argument(format!("'{}' is missing", keys::TARGET_IQN)))?;

    let raw_lun = context_value(keys::LUN, publish, volume)
        .ok_or_else(|| Error::invalid_argument(format!("'{}' is missing", keys::LUN)))?;
    let lun = raw_lun
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|lun| *lun >= 0)
        .ok_or_else(|| Error::invalid_argument(format!("invalid LUN '{}'", raw_lun)))?;

    Ok(Connector::new(iqn, portals, lun))
}

/// Node attach/detach engine.
pub struct NodeService {
    config: NodeConfig,
    store: ConnectorStore,
    transport: Arc<dyn IscsiTransport>,
    runner: Arc<dyn CommandRunner>,
    admission: Arc<Semaphore>,
    events: Arc<dyn EventPublisher>,
}

impl NodeService {
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn IscsiTransport>,
        runner: Arc<dyn CommandRunner>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store: ConnectorStore::new(&config.kubelet_path, &config.plugin_name),
            config,
            transport,
            runner,
            admission: Arc::new(Semaphore::new(MAX_CONCURRENT_PUBLICATIONS)),
            events,
        }
    }

    pub fn store(&self) -> &ConnectorStore {
        &self.store
    }

    async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish domain event");
        }
    }

    async fn target_is_mounted(&self, target_path: &str) -> Result<bool> {
        if !tokio::fs::try_exists(target_path).await.unwrap_or(false) {
            return Ok(false);
        }
        let (mounted, _) = filesystem::is_mountpoint(self.runner.as_ref(), target_path).await?;
        Ok(mounted)
    }

    /// Observe where a volume stands for a given target path.
    pub async fn attachment(&self, volume_id: &str, target_path: &str) -> Result<VolumeAttachment> {
        let mounted = self.target_is_mounted(target_path).await?;
        let recorded = self.store.exists(volume_id).await;
        Ok(VolumeAttachment::from_observation(mounted, recorded))
    }

    /// Connect, format if blank, check and mount a volume at the target path.
    ///
    /// Only one publication runs at a time on a node; a concurrent call is
    /// turned away with [`Error::NodeBusy`] instead of waiting. The work runs
    /// on its own task holding the admission permit, so a caller that stops
    /// waiting leaves it to finish and the node stays busy until it does.
    /// Nothing is rolled back on failure, unpublish cleans up.
    #[instrument(skip(self, request), fields(volume_id = %request.volume_id, target_path = %request.target_path))]
    pub async fn publish_volume(self: &Arc<Self>, request: NodePublishVolumeRequest) -> Result<()> {
        let permit = match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Rejecting publication, another one is in progress");
                self.emit(DomainEvent::publish_rejected(request.volume_id.as_str()))
                    .await;
                return Err(Error::NodeBusy);
            }
        };

        let node = Arc::clone(self);
        let publication = tokio::spawn(
            async move {
                let _permit = permit;
                node.attach_and_mount(request).await
            }
            .in_current_span(),
        );

        match publication.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("publication task failed: {}", e))),
        }
    }

    async fn attach_and_mount(&self, request: NodePublishVolumeRequest) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::invalid_argument("cannot publish volume with empty id"));
        }
        if request.target_path.is_empty() {
            return Err(Error::invalid_argument("cannot publish volume at an empty path"));
        }
        let Some(capability) = request.volume_capability.as_ref() else {
            return Err(Error::invalid_argument("cannot publish volume without capabilities"));
        };

        let state = self
            .attachment(&request.volume_id, &request.target_path)
            .await?;
        debug!(state = ?state, "Observed volume state");
        if state == VolumeAttachment::Mounted {
            info!("Volume already published");
            return Ok(());
        }

        info!("Publishing volume");
        let fs_type = request
            .volume_context
            .get(keys::FS_TYPE)
            .or(capability.fs_type.as_ref())
            .filter(|fs| !fs.is_empty())
            .cloned()
            .ok_or_else(|| Error::invalid_argument(format!("'{}' is missing", keys::FS_TYPE)))?;
        let mut connector = connector_from_request(&request)?;
        let portals: Vec<&str> = connector.targets.iter().map(|t| t.portal.as_str()).collect();
        info!(portals = ?portals, lun = connector.lun, "Initiating iSCSI connection");

        let device = self.transport.connect(&mut connector).await?;
        info!(device = %device, multipath = connector.is_multipath(), "Attached device");

        if state == VolumeAttachment::MountedUntracked {
            info!("Target already mounted, recording connection only");
        } else {
            let runner = self.runner.as_ref();
            filesystem::ensure_fs_type(runner, &fs_type, &device).await?;
            filesystem::check_fs(runner, &fs_type, &device).await?;

            info!("Mounting volume");
            create_target_dir(&request.target_path).await?;
            filesystem::mount(runner, &fs_type, &device, &request.target_path).await?;
        }

        let record = self.store.persist(&request.volume_id, &connector).await?;
        debug!(record = %record.display(), "Saved iSCSI connection info");

        info!("Successfully mounted volume");
        self.emit(DomainEvent::volume_published(
            request.volume_id.as_str(),
            request.target_path.as_str(),
            device.as_str(),
            connector.is_multipath(),
        ))
        .await;
        Ok(())
    }

    /// Unmount a volume and close its iSCSI sessions. Anything already gone
    /// counts as done.
    #[instrument(skip(self, request), fields(volume_id = %request.volume_id, target_path = %request.target_path))]
    pub async fn unpublish_volume(&self, request: NodeUnpublishVolumeRequest) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::invalid_argument("cannot unpublish volume with empty id"));
        }
        if request.target_path.is_empty() {
            return Err(Error::invalid_argument("cannot unpublish volume at an empty path"));
        }

        info!("Unpublishing volume");
        let target = request.target_path.as_str();
        if tokio::fs::try_exists(target).await.unwrap_or(false) {
            self.unmount_target(target).await?;
            if let Err(e) = tokio::fs::remove_dir(target).await {
                warn!(error = %e, "Could not remove target directory");
            }
        }

        let connector = match self.store.load(&request.volume_id).await {
            Ok(Some(connector)) => connector,
            Ok(None) => {
                warn!("No connection info, assuming that iSCSI connection is already closed");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Unreadable connection info, assuming that iSCSI connection is already closed");
                return Ok(());
            }
        };

        info!("Detaching iSCSI device");
        self.transport.disconnect(&connector).await?;

        if let Err(e) = self.store.remove(&request.volume_id).await {
            warn!(error = %e, "Could not delete iSCSI connection info");
        }

        info!("Successfully detached iSCSI device");
        self.emit(DomainEvent::volume_unpublished(
            request.volume_id.as_str(),
            request.target_path.as_str(),
        ))
        .await;
        Ok(())
    }

    async fn unmount_target(&self, target: &str) -> Result<()> {
        match filesystem::is_mountpoint(self.runner.as_ref(), target).await {
            Ok((true, _)) => {
                info!("Unmounting volume");
                if let Err(e) = filesystem::umount(self.runner.as_ref(), target).await {
                    if tokio::fs::try_exists(target).await.unwrap_or(false) {
                        return Err(e);
                    }
                    debug!("Target vanished while unmounting");
                }
            }
            Ok((false, output)) => {
                warn!(output = %output, "Assuming that volume is already unmounted");
            }
            Err(e) => {
                warn!(error = %e, "Assuming that volume is already unmounted");
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_info(&self) -> Result<NodeGetInfoResponse> {
        let node_id = read_initiator_name(&self.config.initiator_name_file).await?;
        Ok(NodeGetInfoResponse {
            node_id,
            max_volumes_per_node: i64::from(keys::MAXIMUM_LUN),
        })
    }

    pub fn get_capabilities(&self) -> NodeGetCapabilitiesResponse {
        NodeGetCapabilitiesResponse::default()
    }

    pub fn stage_volume(&self) -> Result<()> {
        Err(Error::Unimplemented("NodeStageVolume".to_string()))
    }

    pub fn unstage_volume(&self) -> Result<()> {
        Err(Error::Unimplemented("NodeUnstageVolume".to_string()))
    }

    pub fn expand_volume(&self) -> Result<()> {
        Err(Error::Unimplemented("NodeExpandVolume".to_string()))
    }

    pub fn get_volume_stats(&self) -> Result<()> {
        Err(Error::Unimplemented("NodeGetVolumeStats".to_string()))
    }
}

impl std::fmt::Debug for NodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeService")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

async fn create_target_dir(path: &str) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o755);
    builder.create(path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn request(publish: &[(&str, &str)], volume: &[(&str, &str)]) -> NodePublishVolumeRequest {
        let map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        NodePublishVolumeRequest {
            volume_id: "v1".into(),
            target_path: "/mnt/t".into(),
            publish_context: map(publish),
            volume_context: map(volume),
            ..Default::default()
        }
    }

    #[test]
    fn test_attachment_from_observation() {
        use VolumeAttachment::*;
        assert_eq!(VolumeAttachment::from_observation(false, false), Detached);
        assert_eq!(VolumeAttachment::from_observation(false, true), Connected);
        assert_eq!(VolumeAttachment::from_observation(true, false), MountedUntracked);
        assert_eq!(VolumeAttachment::from_observation(true, true), Mounted);
    }

    #[test]
    fn test_connector_from_request_trims_portals() {
        let req = request(
            &[("lun", "2")],
            &[("iqn", "iqn.test"), ("portals", " 10.0.0.1 ,, 10.0.0.2,")],
        );

        let connector = connector_from_request(&req).unwrap();

        let portals: Vec<_> = connector.targets.iter().map(|t| t.portal.as_str()).collect();
        assert_eq!(portals, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(connector.lun, 2);
        assert!(connector.do_discovery);
    }

    #[test]
    fn test_publish_context_wins_over_volume_context() {
        let req = request(
            &[("lun", "5")],
            &[("iqn", "iqn.test"), ("portals", "10.0.0.1"), ("lun", "1")],
        );
        assert_eq!(connector_from_request(&req).unwrap().lun, 5);
    }

    #[test]
    fn test_bad_lun_is_invalid_argument() {
        for lun in ["", "abc", "-1"] {
            let req = request(&[("lun", lun)], &[("iqn", "iqn.test"), ("portals", "10.0.0.1")]);
            assert_matches!(connector_from_request(&req), Err(Error::InvalidArgument(_)));
        }
        let req = request(&[], &[("iqn", "iqn.test"), ("portals", "10.0.0.1")]);
        assert_matches!(connector_from_request(&req), Err(Error::InvalidArgument(msg)) if msg.contains("lun"));
    }

    #[test]
    fn test_missing_portals_or_iqn_is_invalid_argument() {
        let req = request(&[("lun", "1")], &[("iqn", "iqn.test"), ("portals", " , ")]);
        assert_matches!(connector_from_request(&req), Err(Error::InvalidArgument(_)));

        let req = request(&[("lun", "1")], &[("portals", "10.0.0.1")]);
        assert_matches!(connector_from_request(&req), Err(Error::InvalidArgument(msg)) if msg.contains("iqn"));
    }
}
