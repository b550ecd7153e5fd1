//! `wabridge` Core Library
//!
//! Shared functionality for `wabridge` components:
//! - Per-identity storage layout and file reclamation helpers
//! - `SQLite` open options for the master catalog and per-identity stores
//! - Protocol client capability traits and outbound ports
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod layout;
pub mod phone;
pub mod ports;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod tracing_init;

pub use client::{ClientError, ClientFactory, Device, DeviceDescriptor, DeviceStore, WaClient};
pub use config::Config;
pub use error::{Error, Result};
pub use layout::StorageLayout;
pub use ports::{ActivityLog, Keyboard, Transport, TransportError, UiHandle};

/// Operator key as delivered by the transport.
pub type OperatorId = i64;

/// Catalog id of a paired identity.
pub type IdentityId = i64;
