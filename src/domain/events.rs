//! Domain Events
//!
//! Immutable records of volume lifecycle transitions, published for audit
//! logging. Nothing in the attach/detach path depends on an event being
//! delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain event representing a significant occurrence in the plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Controller Events
    // =========================================================================
    /// A new volume was created on the array.
    VolumeCreated {
        volume_id: String,
        size_bytes: u64,
        pool: String,
        timestamp: DateTime<Utc>,
    },

    /// A volume was deleted from the array.
    VolumeDeleted {
        volume_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A volume was mapped to a node initiator.
    VolumeMapped {
        volume_id: String,
        initiator: String,
        lun: u32,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Node Events
    // =========================================================================
    /// A volume was attached and mounted on this node.
    VolumePublished {
        volume_id: String,
        target_path: String,
        device: String,
        multipath: bool,
        timestamp: DateTime<Utc>,
    },

    /// A volume was unmounted and detached from this node.
    VolumeUnpublished {
        volume_id: String,
        target_path: String,
        timestamp: DateTime<Utc>,
    },

    /// A publication was turned away because another one was in flight.
    PublishRejected {
        volume_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::VolumeCreated { timestamp, .. }
            | DomainEvent::VolumeDeleted { timestamp, .. }
            | DomainEvent::VolumeMapped { timestamp, .. }
            | DomainEvent::VolumePublished { timestamp, .. }
            | DomainEvent::VolumeUnpublished { timestamp, .. }
            | DomainEvent::PublishRejected { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::VolumeCreated { .. } => "VolumeCreated",
            DomainEvent::VolumeDeleted { .. } => "VolumeDeleted",
            DomainEvent::VolumeMapped { .. } => "VolumeMapped",
            DomainEvent::VolumePublished { .. } => "VolumePublished",
            DomainEvent::VolumeUnpublished { .. } => "VolumeUnpublished",
            DomainEvent::PublishRejected { .. } => "PublishRejected",
        }
    }

    /// Get the volume ID the event refers to.
    pub fn volume_id(&self) -> &str {
        match self {
            DomainEvent::VolumeCreated { volume_id, .. }
            | DomainEvent::VolumeDeleted { volume_id, .. }
            | DomainEvent::VolumeMapped { volume_id, .. }
            | DomainEvent::VolumePublished { volume_id, .. }
            | DomainEvent::VolumeUnpublished { volume_id, .. }
            | DomainEvent::PublishRejected { volume_id, .. } => volume_id,
        }
    }
}

// Convenience constructors
impl DomainEvent {
    pub fn volume_created(
        volume_id: impl Into<String>,
        size_bytes: u64,
        pool: impl Into<String>,
    ) -> Self {
        DomainEvent::VolumeCreated {
            volume_id: volume_id.into(),
            size_bytes,
            pool: pool.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn volume_deleted(volume_id: impl Into<String>) -> Self {
        DomainEvent::VolumeDeleted {
            volume_id: volume_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn volume_mapped(
        volume_id: impl Into<String>,
        initiator: impl Into<String>,
        lun: u32,
    ) -> Self {
        DomainEvent::VolumeMapped {
            volume_id: volume_id.into(),
            initiator: initiator.into(),
            lun,
            timestamp: Utc::now(),
        }
    }

    pub fn volume_published(
        volume_id: impl Into<String>,
        target_path: impl Into<String>,
        device: impl Into<String>,
        multipath: bool,
    ) -> Self {
        DomainEvent::VolumePublished {
            volume_id: volume_id.into(),
            target_path: target_path.into(),
            device: device.into(),
            multipath,
            timestamp: Utc::now(),
        }
    }

    pub fn volume_unpublished(
        volume_id: impl Into<String>,
        target_path: impl Into<String>,
    ) -> Self {
        DomainEvent::VolumeUnpublished {
            volume_id: volume_id.into(),
            target_path: target_path.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn publish_rejected(volume_id: impl Into<String>) -> Self {
        DomainEvent::PublishRejected {
            volume_id: volume_id.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = DomainEvent::volume_created("vol-123", 1024 * 1024 * 1024, "pool-a");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("VolumeCreated"));
        assert!(json.contains("vol-123"));

        let deserialized: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.event_type(), "VolumeCreated");
    }

    #[test]
    fn test_volume_id_extraction() {
        let event = DomainEvent::volume_published("vol-456", "/mnt/v", "/dev/dm-0", true);
        assert_eq!(event.volume_id(), "vol-456");
        assert_eq!(event.event_type(), "VolumePublished");
    }

    #[test]
    fn test_timestamp() {
        let before = Utc::now();
        let event = DomainEvent::publish_rejected("vol-123");
        let after = Utc::now();

        assert!(event.timestamp() >= before);
        assert!(event.timestamp() <= after);
    }
}
