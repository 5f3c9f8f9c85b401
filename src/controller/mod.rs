//! Controller module
//!
//! Provisions volumes on the array and maps them to node initiators. Every
//! call holds the array client for its whole duration: the client is
//! reconfigured per call from the storage class parameters or secrets, so two
//! calls must never interleave.

pub mod preflight;

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::csi::{
    ControllerCapability, ControllerGetCapabilitiesResponse, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerUnpublishVolumeRequest, CreateVolumeRequest,
    CreateVolumeResponse, DeleteVolumeRequest,
};
use crate::domain::events::DomainEvent;
use crate::domain::keys;
use crate::domain::ports::{ArrayClient, ArrayCredentials, EventPublisher, Volume, VolumeId};
use crate::error::{Error, Result};

pub use preflight::run_preflight_checks;

const MIB: u64 = 1024 * 1024;

/// Array size string for a byte count, rounded up to whole MiB.
pub fn size_in_mib(bytes: u64) -> String {
    let mib = bytes.div_ceil(MIB).max(1);
    format!("{}MiB", mib)
}

/// Fresh volume id: a hyphenated UUID v4 cut to the longest name the array
/// accepts.
pub fn generate_volume_id() -> VolumeId {
    let mut id = uuid::Uuid::new_v4().to_string();
    id.truncate(keys::VOLUME_NAME_MAX_LENGTH);
    VolumeId::new(id)
}

/// Exclusive handle on the array client.
///
/// Idle connections are closed when the handle is dropped, before the lock
/// is released, whatever way the call ends.
struct ArraySession<'a> {
    client: MutexGuard<'a, Box<dyn ArrayClient>>,
}

impl Deref for ArraySession<'_> {
    type Target = Box<dyn ArrayClient>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl DerefMut for ArraySession<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.client
    }
}

impl Drop for ArraySession<'_> {
    fn drop(&mut self) {
        self.client.close_idle_connections();
    }
}

/// Provisioning coordinator.
pub struct ControllerService {
    array: Mutex<Box<dyn ArrayClient>>,
    /// API address used when a call carries none in its secrets
    default_api_address: Option<String>,
    events: Arc<dyn EventPublisher>,
}

impl ControllerService {
    pub fn new(
        array: Box<dyn ArrayClient>,
        default_api_address: Option<String>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            array: Mutex::new(array),
            default_api_address,
            events,
        }
    }

    async fn session(&self) -> ArraySession<'_> {
        ArraySession {
            client: self.array.lock().await,
        }
    }

    async fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish domain event");
        }
    }

    fn credentials(
        api_address: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<ArrayCredentials> {
        let secret = |key: &str| {
            secrets
                .get(key)
                .cloned()
                .ok_or_else(|| Error::invalid_argument(format!("secret '{}' is missing", key)))
        };

        Ok(ArrayCredentials {
            api_address: api_address.to_string(),
            username: secret(keys::USERNAME_SECRET)?,
            password: secret(keys::PASSWORD_SECRET)?,
        })
    }

    /// Credentials for calls that carry no storage class parameters.
    fn credentials_from_secrets(
        &self,
        secrets: &HashMap<String, String>,
    ) -> Result<ArrayCredentials> {
        let api_address = secrets
            .get(keys::API_ADDRESS)
            .or(self.default_api_address.as_ref())
            .ok_or_else(|| {
                Error::failed_precondition(format!(
                    "'{}' is missing from secrets and no default API address is configured",
                    keys::API_ADDRESS
                ))
            })?;
        Self::credentials(api_address, secrets)
    }

    /// Create a volume on the array.
    ///
    /// The parameters are returned verbatim as the volume context. Retrying a
    /// create that timed out provisions a second volume, ids being random.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_volume(&self, request: CreateVolumeRequest) -> Result<CreateVolumeResponse> {
        let mut array = self.session().await;

        run_preflight_checks(&request.parameters, &request.volume_capabilities)?;

        let api_address = &request.parameters[keys::API_ADDRESS];
        let credentials = Self::credentials(api_address, &request.secrets)?;
        array.configure(&credentials).await?;

        let volume_id = generate_volume_id();
        let pool = &request.parameters[keys::POOL];
        let required_bytes = request.required_bytes();
        let size = size_in_mib(required_bytes);

        info!(volume_id = %volume_id, size = %size, pool = %pool, "Creating volume");
        array.create_volume(volume_id.as_str(), &size, pool).await?;
        drop(array);

        self.emit(DomainEvent::volume_created(
            volume_id.as_str(),
            required_bytes,
            pool.as_str(),
        ))
        .await;

        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id,
                capacity_bytes: required_bytes,
                volume_context: request.parameters,
                content_source: request.volume_content_source,
            },
        })
    }

    /// Unmap a volume from every host and delete it. A volume the array no
    /// longer knows is already deleted.
    #[instrument(skip(self, request), fields(volume_id = %request.volume_id))]
    pub async fn delete_volume(&self, request: DeleteVolumeRequest) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::invalid_argument("cannot delete volume with empty ID"));
        }

        let mut array = self.session().await;
        let credentials = self.credentials_from_secrets(&request.secrets)?;
        array.configure(&credentials).await?;

        match array.unmap_volume(&request.volume_id, None).await {
            Err(Error::Array(e)) if e.is_missing_volume() => {
                info!("Volume does not exist on the array, nothing to delete");
                return Ok(());
            }
            Err(Error::Array(e)) if e.is_missing_host_or_map() => {
                debug!("Volume is not mapped");
            }
            other => other?,
        }

        match array.delete_volume(&request.volume_id).await {
            Err(Error::Array(e)) if e.is_missing_volume() => {
                info!("Volume already deleted");
            }
            other => other?,
        }
        drop(array);

        info!("Volume deleted");
        self.emit(DomainEvent::volume_deleted(request.volume_id.as_str()))
            .await;
        Ok(())
    }

    /// Map a volume to the node's initiator and return the LUN it got.
    #[instrument(skip(self, request), fields(volume_id = %request.volume_id, node_id = %request.node_id))]
    pub async fn controller_publish_volume(
        &self,
        request: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse> {
        if request.volume_id.is_empty() {
            return Err(Error::invalid_argument("cannot publish volume with empty ID"));
        }
        if request.node_id.is_empty() {
            return Err(Error::invalid_argument("cannot publish volume to an empty node ID"));
        }
        if request.volume_capability.is_none() {
            return Err(Error::invalid_argument("cannot publish volume without capability"));
        }

        let mut array = self.session().await;
        let credentials = self.credentials_from_secrets(&request.secrets)?;
        array.configure(&credentials).await?;

        let maps = match array.show_host_maps(&request.node_id).await {
            Err(Error::Array(e)) if e.is_missing_host_or_map() => Vec::new(),
            other => other?,
        };

        let lun = match maps.iter().find(|m| m.volume_name == request.volume_id) {
            Some(existing) => {
                debug!(lun = existing.lun, "Volume already mapped to node");
                existing.lun
            }
            None => {
                let used: HashSet<u32> = maps.iter().map(|m| m.lun).collect();
                let lun = (1..=keys::MAXIMUM_LUN)
                    .find(|lun| !used.contains(lun))
                    .ok_or_else(|| {
                        Error::ResourceExhausted(format!(
                            "no LUN left on host {} (maximum is {})",
                            request.node_id,
                            keys::MAXIMUM_LUN
                        ))
                    })?;

                info!(lun, "Mapping volume");
                array
                    .map_volume(&request.volume_id, &request.node_id, lun)
                    .await?;
                drop(array);

                self.emit(DomainEvent::volume_mapped(
                    request.volume_id.as_str(),
                    request.node_id.as_str(),
                    lun,
                ))
                .await;
                lun
            }
        };

        Ok(ControllerPublishVolumeResponse {
            publish_context: HashMap::from([(keys::LUN.to_string(), lun.to_string())]),
        })
    }

    /// Unmap a volume from a node, deleting the host once it maps nothing.
    #[instrument(skip(self, request), fields(volume_id = %request.volume_id, node_id = %request.node_id))]
    pub async fn controller_unpublish_volume(
        &self,
        request: ControllerUnpublishVolumeRequest,
    ) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::invalid_argument("cannot unpublish volume with empty ID"));
        }

        let mut array = self.session().await;
        let credentials = self.credentials_from_secrets(&request.secrets)?;
        array.configure(&credentials).await?;

        let initiator = (!request.node_id.is_empty()).then_some(request.node_id.as_str());
        match array.unmap_volume(&request.volume_id, initiator).await {
            Err(Error::Array(e)) if e.is_missing_host_or_map() || e.is_missing_volume() => {
                debug!(code = e.code, "Volume already unmapped");
            }
            other => other?,
        }

        let Some(initiator) = initiator else {
            return Ok(());
        };

        match array.show_host_maps(initiator).await {
            Ok(maps) if maps.is_empty() => {
                info!("Host has no mapping left, deleting it");
                if let Err(e) = array.delete_host(initiator).await {
                    warn!(error = %e, "Failed to delete host");
                }
            }
            Ok(_) => {}
            Err(Error::Array(e)) if e.is_missing_host_or_map() => {}
            Err(e) => warn!(error = %e, "Failed to list host mappings"),
        }

        Ok(())
    }

    pub fn get_capabilities(&self) -> ControllerGetCapabilitiesResponse {
        ControllerGetCapabilitiesResponse {
            capabilities: vec![
                ControllerCapability::CreateDeleteVolume,
                ControllerCapability::PublishUnpublishVolume,
            ],
        }
    }
}

impl std::fmt::Debug for ControllerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerService")
            .field("default_api_address", &self.default_api_address)
            .finish_non_exhaustive()
    }
}
