//! Domain Layer
//!
//! Value objects shared by the controller and node services, and the ports
//! through which they reach the array, the iSCSI layer and the host.
//!
//! - **Ports** (`ports.rs`) - Value objects and trait abstractions for external dependencies
//! - **Events** (`events.rs`) - Domain events for audit logging
//! - **Keys** (`keys.rs`) - Parameter, secret and context keys

pub mod events;
pub mod keys;
pub mod ports;

// Re-export commonly used types
pub use events::DomainEvent;
pub use ports::{
    // Port traits
    ArrayClient,
    CommandRunner,
    EventPublisher,
    IscsiTransport,
    // Value objects
    AccessMode,
    ArrayCredentials,
    CommandOutput,
    Connector,
    HostMap,
    TargetInfo,
    Volume,
    VolumeCapability,
    VolumeContentSource,
    VolumeId,
};
