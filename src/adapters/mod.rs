//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  ArrayClient │ IscsiTransport │ CommandRunner │ Events    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ RestArrayClient │ IscsiadmTransport │ SystemCommandRunner │ │
//! │  │ LoggingEventPublisher │ InMemoryEventCollector             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use dothill_csi::adapters::{IscsiConfig, IscsiadmTransport, SystemCommandRunner};
//! use dothill_csi::domain::ports::IscsiTransport;
//!
//! let runner = Arc::new(SystemCommandRunner::new());
//! let transport = IscsiadmTransport::new(IscsiConfig::default(), runner);
//!
//! // Use it through the domain port trait
//! let device = transport.connect(&mut connector).await?;
//! ```

mod array;
mod command;
mod event_publisher;
mod iscsi;

pub use array::RestArrayClient;
pub use command::{format_command, SystemCommandRunner};
pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use iscsi::{IscsiConfig, IscsiadmTransport};
