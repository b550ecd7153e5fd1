//! Protocol client capabilities.
//!
//! The bridge never talks to a concrete WhatsApp implementation. It works with
//! any client that provides the capability set below, created by a
//! [`ClientFactory`] from a [`Device`] read out of a per-identity
//! [`DeviceStore`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Connection;
use sqlx::sqlite::SqliteConnection;

use crate::db::identity_store_options;

/// Errors reported by a protocol client or its device store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    Websocket(String),

    #[error("operation timed out")]
    Timeout,

    #[error("client disconnected")]
    Disconnected,

    #[error("device is not paired")]
    NotPaired,

    #[error("device store error: {0}")]
    Store(String),

    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// Whether a pairing attempt that failed with this error may be retried.
    ///
    /// Typed variants decide on their own. `Other` carries whatever text the
    /// protocol library produced, so it falls back to looking for the
    /// websocket/timeout/disconnect wording; this is the only place the bridge
    /// inspects error text.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Websocket(_) | Self::Timeout | Self::Disconnected => true,
            Self::NotPaired | Self::Store(_) => false,
            Self::Other(message) => {
                let message = message.to_ascii_lowercase();
                ["websocket", "timeout", "timed out", "disconnect"]
                    .iter()
                    .any(|needle| message.contains(needle))
            }
        }
    }
}

/// Device descriptor announced to the phone during code pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDescriptor {
    ChromeWindows,
}

impl DeviceDescriptor {
    /// Human-readable name shown in the phone's linked devices list.
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::ChromeWindows => "Chrome (Windows)",
        }
    }
}

/// Device record held in a protocol store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    /// Pairing identity (JID) once the device is linked; `None` when the
    /// device was never paired or has been logged out.
    pub pairing_id: Option<String>,
    /// File the device was read from.
    pub store_path: PathBuf,
}

impl Device {
    pub const fn is_paired(&self) -> bool {
        self.pairing_id.is_some()
    }
}

/// A live protocol client bound to one identity.
#[async_trait]
pub trait WaClient: Send + Sync {
    async fn connect(&self) -> Result<(), ClientError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Current pairing identity, `None` while unpaired or after logout.
    fn pairing_id(&self) -> Option<String>;

    fn has_paired_id(&self) -> bool {
        self.pairing_id().is_some()
    }

    /// Request a pairing code for `phone`.
    async fn pair_phone(
        &self,
        phone: &str,
        descriptor: DeviceDescriptor,
    ) -> Result<String, ClientError>;
}

/// Persistent device store of one identity.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// The first (and for this bridge, only) device in the store.
    async fn first_device(&self) -> Result<Device, ClientError>;
}

/// Creates device stores and clients for the bridge.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Open (creating if needed) the device store at `path`.
    async fn open_store(&self, path: &Path) -> Result<Arc<dyn DeviceStore>, ClientError>;

    /// Build a client for `device`. The client is not connected yet.
    fn build(&self, device: Device) -> Arc<dyn WaClient>;
}

/// Device store backed by the protocol library's `SQLite` file.
///
/// Reads the `jid` of the first row in `whatsmeow_device`. A file without that
/// table, or with no rows, is an unpaired device.
#[derive(Debug, Clone)]
pub struct SqliteDeviceStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteDeviceStore {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeviceStore for SqliteDeviceStore {
    async fn first_device(&self) -> Result<Device, ClientError> {
        let options = identity_store_options(&self.path, self.busy_timeout, false)
            .map_err(|e| ClientError::Store(e.to_string()))?;
        let mut conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| ClientError::Store(e.to_string()))?;

        let has_table: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'whatsmeow_device'",
        )
        .fetch_optional(&mut conn)
        .await
        .map_err(|e| ClientError::Store(e.to_string()))?;

        let pairing_id = if has_table.is_some() {
            sqlx::query_scalar::<_, Option<String>>("SELECT jid FROM whatsmeow_device LIMIT 1")
                .fetch_optional(&mut conn)
                .await
                .map_err(|e| ClientError::Store(e.to_string()))?
                .flatten()
                .filter(|jid| !jid.is_empty())
        } else {
            None
        };

        let _ = conn.close().await;

        Ok(Device {
            pairing_id,
            store_path: self.path.clone(),
        })
    }
}
