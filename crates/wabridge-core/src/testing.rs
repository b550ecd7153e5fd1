//! In-process fakes for the client capabilities and outbound ports.
//!
//! Available to other crates with the `test-utils` feature.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::OperatorId;
use crate::client::{ClientError, ClientFactory, Device, DeviceDescriptor, DeviceStore, WaClient};
use crate::ports::{ActivityLog, Keyboard, Transport, TransportError, UiHandle};

/// Scriptable protocol client.
#[derive(Debug, Default)]
pub struct FakeClient {
    pairing_id: Mutex<Option<String>>,
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    pair_calls: AtomicUsize,
    pair_failures: Mutex<VecDeque<ClientError>>,
    pair_code: Mutex<String>,
    paired_with: Mutex<Vec<(String, DeviceDescriptor)>>,
}

impl FakeClient {
    pub fn new(pairing_id: Option<&str>) -> Self {
        let client = Self::default();
        *client.pairing_id.lock() = pairing_id.map(str::to_string);
        *client.pair_code.lock() = "ABCD-EFGH".to_string();
        client
    }

    /// Simulate the phone confirming the pairing code.
    pub fn complete_pairing(&self, jid: &str) {
        *self.pairing_id.lock() = Some(jid.to_string());
    }

    /// Simulate a logout pushed by the server.
    pub fn log_out(&self) {
        *self.pairing_id.lock() = None;
    }

    /// Simulate a dropped connection.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Make every following `connect()` fail (or succeed again).
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Queue errors returned by the next `pair_phone()` calls.
    pub fn push_pair_failure(&self, error: ClientError) {
        self.pair_failures.lock().push_back(error);
    }

    pub fn set_pair_code(&self, code: &str) {
        *self.pair_code.lock() = code.to_string();
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn pair_calls(&self) -> usize {
        self.pair_calls.load(Ordering::SeqCst)
    }

    pub fn paired_with(&self) -> Vec<(String, DeviceDescriptor)> {
        self.paired_with.lock().clone()
    }
}

#[async_trait]
impl WaClient for FakeClient {
    async fn connect(&self) -> Result<(), ClientError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(ClientError::Websocket("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn pairing_id(&self) -> Option<String> {
        self.pairing_id.lock().clone()
    }

    async fn pair_phone(
        &self,
        phone: &str,
        descriptor: DeviceDescriptor,
    ) -> Result<String, ClientError> {
        self.pair_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.pair_failures.lock().pop_front() {
            return Err(error);
        }
        if !self.is_connected() {
            return Err(ClientError::Disconnected);
        }
        self.paired_with
            .lock()
            .push((phone.to_string(), descriptor));
        Ok(self.pair_code.lock().clone())
    }
}

/// Device store answering from a fixed device record.
#[derive(Debug)]
pub struct FakeDeviceStore {
    device: Device,
}

#[async_trait]
impl DeviceStore for FakeDeviceStore {
    async fn first_device(&self) -> Result<Device, ClientError> {
        Ok(self.device.clone())
    }
}

/// Factory that hands out [`FakeClient`]s.
///
/// Device stores answer with the pairing id registered for their path via
/// [`FakeFactory::set_device`]; unknown paths are unpaired. Opening a store
/// touches the file on disk so the storage layout sees it like a real store.
#[derive(Debug, Default)]
pub struct FakeFactory {
    devices: Mutex<HashMap<PathBuf, Option<String>>>,
    built: Mutex<Vec<Arc<FakeClient>>>,
    refuse_connect: AtomicBool,
    queued_pair_failures: Mutex<Vec<ClientError>>,
    fail_open: AtomicBool,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_device(&self, path: impl Into<PathBuf>, pairing_id: Option<&str>) {
        self.devices
            .lock()
            .insert(path.into(), pairing_id.map(str::to_string));
    }

    /// Clients built from now on refuse to connect.
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// The next built client fails its first `pair_phone()` calls with these.
    pub fn queue_pair_failures(&self, errors: Vec<ClientError>) {
        *self.queued_pair_failures.lock() = errors;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn built(&self) -> Vec<Arc<FakeClient>> {
        self.built.lock().clone()
    }

    pub fn last_built(&self) -> Option<Arc<FakeClient>> {
        self.built.lock().last().cloned()
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn open_store(&self, path: &Path) -> Result<Arc<dyn DeviceStore>, ClientError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(ClientError::Store(format!("cannot open {}", path.display())));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ClientError::Store(e.to_string()))?;
        }
        if !path.exists() {
            std::fs::write(path, b"").map_err(|e| ClientError::Store(e.to_string()))?;
        }
        let pairing_id = self.devices.lock().get(path).cloned().flatten();
        Ok(Arc::new(FakeDeviceStore {
            device: Device {
                pairing_id,
                store_path: path.to_path_buf(),
            },
        }))
    }

    fn build(&self, device: Device) -> Arc<dyn WaClient> {
        let client = Arc::new(FakeClient::new(device.pairing_id.as_deref()));
        client.set_refuse_connect(self.refuse_connect.load(Ordering::SeqCst));
        for error in self.queued_pair_failures.lock().drain(..) {
            client.push_pair_failure(error);
        }
        self.built.lock().push(Arc::clone(&client));
        client
    }
}

/// A message captured by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub operator: OperatorId,
    pub text: String,
    pub edited: Option<UiHandle>,
}

/// Transport that records every outbound message.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    messages: Mutex<Vec<SentMessage>>,
    counter: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.messages.lock().clone()
    }

    pub fn messages_for(&self, operator: OperatorId) -> Vec<SentMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.operator == operator)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(
        &self,
        operator: OperatorId,
        text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> Result<UiHandle, TransportError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.messages.lock().push(SentMessage {
            operator,
            text: text.to_string(),
            edited: None,
        });
        Ok(UiHandle(format!("msg-{n}")))
    }

    async fn edit(
        &self,
        operator: OperatorId,
        handle: &UiHandle,
        text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError> {
        self.messages.lock().push(SentMessage {
            operator,
            text: text.to_string(),
            edited: Some(handle.clone()),
        });
        Ok(())
    }
}

/// Activity log that keeps `(action, operator, success)` entries.
#[derive(Debug, Default)]
pub struct RecordingActivityLog {
    entries: Mutex<Vec<(String, OperatorId, bool)>>,
}

impl RecordingActivityLog {
    pub fn entries(&self) -> Vec<(String, OperatorId, bool)> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl ActivityLog for RecordingActivityLog {
    async fn record(&self, action: &str, _description: &str, operator: OperatorId, success: bool) {
        self.entries
            .lock()
            .push((action.to_string(), operator, success));
    }
}
