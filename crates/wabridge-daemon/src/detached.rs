//! Client factory used when no protocol library is linked in.
//!
//! Device stores are read from disk so startup validation and the sweeps see
//! real pairing state, but clients never connect. The maintenance commands
//! and the reclaimer-only `run` mode use this factory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use wabridge_core::client::SqliteDeviceStore;
use wabridge_core::{ClientError, ClientFactory, Device, DeviceDescriptor, DeviceStore, WaClient};

#[derive(Debug, Clone)]
pub struct DetachedFactory {
    busy_timeout: Duration,
}

impl DetachedFactory {
    pub const fn new(busy_timeout: Duration) -> Self {
        Self { busy_timeout }
    }
}

#[async_trait]
impl ClientFactory for DetachedFactory {
    async fn open_store(&self, path: &Path) -> Result<Arc<dyn DeviceStore>, ClientError> {
        Ok(Arc::new(SqliteDeviceStore::new(path, self.busy_timeout)))
    }

    fn build(&self, device: Device) -> Arc<dyn WaClient> {
        Arc::new(DetachedClient { device })
    }
}

/// Client that reports its device's pairing id and refuses to connect.
#[derive(Debug)]
struct DetachedClient {
    device: Device,
}

fn detached() -> ClientError {
    ClientError::Other("no protocol client attached".to_string())
}

#[async_trait]
impl WaClient for DetachedClient {
    async fn connect(&self) -> Result<(), ClientError> {
        Err(detached())
    }

    async fn disconnect(&self) {}

    fn is_connected(&self) -> bool {
        false
    }

    fn pairing_id(&self) -> Option<String> {
        self.device.pairing_id.clone()
    }

    async fn pair_phone(
        &self,
        _phone: &str,
        _descriptor: DeviceDescriptor,
    ) -> Result<String, ClientError> {
        Err(detached())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clients_keep_pairing_id_but_never_connect() {
        let factory = DetachedFactory::new(Duration::from_secs(1));
        let client = factory.build(Device {
            pairing_id: Some("628111@s.whatsapp.net".to_string()),
            store_path: "/tmp/whatsmeow-555-628111.db".into(),
        });

        assert!(client.has_paired_id());
        assert!(client.connect().await.is_err());
        assert!(!client.is_connected());
        assert!(
            client
                .pair_phone("628111", DeviceDescriptor::ChromeWindows)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn store_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DetachedFactory::new(Duration::from_secs(1));

        let store = factory
            .open_store(&dir.path().join("whatsmeow-555-628111.db"))
            .await
            .unwrap();
        assert!(store.first_device().await.is_err());
    }
}
