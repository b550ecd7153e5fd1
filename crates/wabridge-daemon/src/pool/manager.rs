//! Client pool keyed by identity id.
//!
//! One live client per identity. Entries are replaced, never mutated; each
//! insertion gets a fresh generation. Teardown (`destroy`) runs entirely
//! under the pool's write lock so no lookup can observe a half-destroyed
//! identity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use wabridge_core::config::PoolConfig;
use wabridge_core::db::unix_timestamp;
use wabridge_core::layout::remove_file_group;
use wabridge_core::{ClientFactory, IdentityId, OperatorId, WaClient};

use super::types::{DestroyOutcome, PooledClient};
use crate::error::{BridgeError, BridgeResult};
use crate::storage::{AppStores, IdentityStatus, Registry};
use crate::usage::LastUsed;

#[derive(Debug, Default)]
struct CurrentPointers {
    per_operator: HashMap<OperatorId, IdentityId>,
    /// Last identity selected by anyone; kept for handlers that predate
    /// per-operator sessions.
    global: Option<IdentityId>,
}

struct PoolInner {
    registry: Registry,
    factory: Arc<dyn ClientFactory>,
    app_stores: AppStores,
    last_used: LastUsed,
    config: PoolConfig,
    entries: RwLock<HashMap<IdentityId, PooledClient>>,
    current: RwLock<CurrentPointers>,
    pending_destroy: parking_lot::Mutex<HashSet<IdentityId>>,
    /// One connect at a time per identity.
    connecting: parking_lot::Mutex<HashMap<IdentityId, Arc<Mutex<()>>>>,
    generation: AtomicU64,
}

/// Process-wide map from identity id to live client.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

impl ClientPool {
    pub fn new(
        registry: Registry,
        factory: Arc<dyn ClientFactory>,
        app_stores: AppStores,
        last_used: LastUsed,
        config: PoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                registry,
                factory,
                app_stores,
                last_used,
                config,
                entries: RwLock::new(HashMap::new()),
                current: RwLock::new(CurrentPointers::default()),
                pending_destroy: parking_lot::Mutex::new(HashSet::new()),
                connecting: parking_lot::Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn factory(&self) -> &Arc<dyn ClientFactory> {
        &self.inner.factory
    }

    pub fn last_used(&self) -> &LastUsed {
        &self.inner.last_used
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Live, connected client for `id`.
    ///
    /// A pooled client that has lost its connection is reconnected in place.
    /// A client (or device store) without a pairing id means the identity was
    /// logged out; its teardown is scheduled and `LoggedOut` returned.
    /// Concurrent callers for the same id wait for the connect already in
    /// progress instead of starting their own.
    pub async fn get_or_create(&self, id: IdentityId) -> BridgeResult<PooledClient> {
        let existing = self.inner.entries.read().await.get(&id).cloned();
        if let Some(entry) = existing
            && entry.is_paired()
            && entry.client.is_connected()
        {
            return Ok(entry);
        }

        let guard = self.connect_guard(id);
        let _connecting = guard.lock().await;

        let existing = self.inner.entries.read().await.get(&id).cloned();
        if let Some(entry) = existing {
            return self.revive(entry).await;
        }

        let identity = self.inner.registry.require(id).await?;
        let store = self
            .inner
            .factory
            .open_store(&identity.protocol_store_path)
            .await?;
        let device = store.first_device().await?;
        if !device.is_paired() {
            warn!(identity_id = id, "Device store has no pairing id, identity logged out");
            self.schedule_destroy(id);
            return Err(BridgeError::LoggedOut { identity_id: id });
        }

        let entry = {
            let mut entries = self.inner.entries.write().await;
            // Adopted while the device store was being read.
            if let Some(adopted) = entries.get(&id).cloned() {
                drop(entries);
                return self.revive(adopted).await;
            }
            let entry = PooledClient {
                identity_id: id,
                client: self.inner.factory.build(device),
                generation: self.next_generation(),
            };
            entries.insert(id, entry.clone());
            entry
        };

        if let Err(e) = self.connect_bounded(&entry, self.inner.config.connect_timeout()).await {
            // Only evict the entry this call inserted.
            let mut entries = self.inner.entries.write().await;
            if entries
                .get(&id)
                .is_some_and(|current| current.generation == entry.generation)
            {
                entries.remove(&id);
            }
            drop(entries);
            entry.client.disconnect().await;
            warn!(identity_id = id, error = %e, "Client failed to connect, dropped from pool");
            return Err(e);
        }

        self.inner
            .registry
            .update_status(id, IdentityStatus::Active)
            .await?;
        info!(identity_id = id, generation = entry.generation, "Client connected");
        Ok(entry)
    }

    fn connect_guard(&self, id: IdentityId) -> Arc<Mutex<()>> {
        Arc::clone(self.inner.connecting.lock().entry(id).or_default())
    }

    async fn revive(&self, entry: PooledClient) -> BridgeResult<PooledClient> {
        let id = entry.identity_id;
        if !entry.is_paired() {
            self.schedule_destroy(id);
            return Err(BridgeError::LoggedOut { identity_id: id });
        }
        if entry.client.is_connected() {
            return Ok(entry);
        }

        debug!(identity_id = id, "Reconnecting pooled client");
        self.connect_bounded(&entry, self.inner.config.reconnect_timeout())
            .await?;
        Ok(entry)
    }

    async fn connect_bounded(&self, entry: &PooledClient, limit: Duration) -> BridgeResult<()> {
        connect_within(&entry.client, limit, self.inner.config.connect_poll())
            .await
            .map_err(|e| match e {
                BridgeError::Timeout(_) => BridgeError::Timeout(format!(
                    "identity {} did not connect within {}s",
                    entry.identity_id,
                    limit.as_secs()
                )),
                other => other,
            })
    }

    /// Pooled entry without touching the network.
    pub async fn peek(&self, id: IdentityId) -> Option<PooledClient> {
        self.inner.entries.read().await.get(&id).cloned()
    }

    /// Ids with a pooled client, ascending.
    pub async fn ids(&self) -> Vec<IdentityId> {
        let mut ids: Vec<_> = self.inner.entries.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Take ownership of an already connected client, typically one that just
    /// finished pairing. Any previous client for `id` is disconnected.
    pub async fn adopt(
        &self,
        id: IdentityId,
        client: Arc<dyn WaClient>,
    ) -> BridgeResult<PooledClient> {
        let entry = PooledClient {
            identity_id: id,
            client,
            generation: self.next_generation(),
        };
        let previous = self.inner.entries.write().await.insert(id, entry.clone());
        if let Some(previous) = previous
            && !previous.same_client(&entry)
        {
            previous.client.disconnect().await;
        }

        if entry.is_paired() {
            self.inner
                .registry
                .update_status(id, IdentityStatus::Active)
                .await?;
        }
        info!(identity_id = id, generation = entry.generation, "Client adopted into pool");
        Ok(entry)
    }

    /// Point `operator` (and the legacy global pointer) at `id`.
    pub async fn set_current_for(&self, operator: OperatorId, id: IdentityId) {
        let mut current = self.inner.current.write().await;
        current.per_operator.insert(operator, id);
        current.global = Some(id);
        drop(current);
        self.inner.last_used.touch(id);
        debug!(operator, identity_id = id, "Current identity set");
    }

    pub async fn current_for(&self, operator: OperatorId) -> Option<IdentityId> {
        self.inner
            .current
            .read()
            .await
            .per_operator
            .get(&operator)
            .copied()
    }

    pub async fn current_global(&self) -> Option<IdentityId> {
        self.inner.current.read().await.global
    }

    async fn clear_current(&self, id: IdentityId) {
        let mut current = self.inner.current.write().await;
        current.per_operator.retain(|_, selected| *selected != id);
        if current.global == Some(id) {
            current.global = None;
        }
    }

    /// Disconnect and drop the client; the row stays, marked inactive.
    pub async fn remove(&self, id: IdentityId) -> BridgeResult<bool> {
        let removed = self.inner.entries.write().await.remove(&id);
        let Some(entry) = removed else {
            return Ok(false);
        };
        entry.client.disconnect().await;

        match self
            .inner
            .registry
            .update_status(id, IdentityStatus::Inactive)
            .await
        {
            Ok(()) | Err(BridgeError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        info!(identity_id = id, "Client removed from pool");
        Ok(true)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Fully tear down an identity.
    ///
    /// Disconnects and drops the client, backs up the app store, deletes the
    /// catalog row and both stores with their sidecars, and clears the
    /// identity's last-used entry and current pointers. The write lock is held
    /// for the whole sequence.
    pub async fn destroy(&self, id: IdentityId) -> BridgeResult<DestroyOutcome> {
        let mut entries = self.inner.entries.write().await;
        if let Some(entry) = entries.remove(&id) {
            entry.client.disconnect().await;
        }

        let identity = self.inner.registry.get(id).await?;
        let mut outcome = DestroyOutcome::default();

        if let Some(identity) = identity {
            self.inner.app_stores.release_identity(id).await;

            match self
                .inner
                .registry
                .layout()
                .backup_app_store(&identity.app_store_path, unix_timestamp())
            {
                Ok(backup) => outcome.backup = backup,
                Err(e) => {
                    warn!(identity_id = id, error = %e, "App store backup failed");
                }
            }

            match self.inner.registry.delete(id).await {
                Ok(()) | Err(BridgeError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }

            outcome.files_deleted = remove_file_group(&identity.protocol_store_path)
                + remove_file_group(&identity.app_store_path);
            outcome.identity = Some(identity);
        }

        self.inner.last_used.remove(id);
        self.clear_current(id).await;
        drop(entries);

        info!(
            identity_id = id,
            files_deleted = outcome.files_deleted,
            "Identity destroyed"
        );
        Ok(outcome)
    }

    /// Destroy `id` after the logout debounce, unless it was re-paired in the
    /// meantime. Repeated calls for the same id collapse into one.
    pub fn schedule_destroy(&self, id: IdentityId) {
        if !self.inner.pending_destroy.lock().insert(id) {
            debug!(identity_id = id, "Destroy already scheduled");
            return;
        }

        let pool = self.clone();
        let debounce = self.inner.config.logout_debounce();
        tokio::spawn(async move {
            sleep(debounce).await;

            if pool.peek(id).await.is_some_and(|entry| entry.is_paired()) {
                debug!(identity_id = id, "Identity paired again, destroy skipped");
            } else if let Err(e) = pool.destroy(id).await {
                warn!(identity_id = id, error = %e, "Scheduled destroy failed");
            }
            pool.inner.pending_destroy.lock().remove(&id);
        });
    }

    /// Ids with a destroy still waiting for its debounce.
    pub fn pending_destroys(&self) -> Vec<IdentityId> {
        let mut ids: Vec<_> = self.inner.pending_destroy.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// `connect()`, then poll `is_connected()` every `poll` until `limit`.
pub(crate) async fn connect_within(
    client: &Arc<dyn WaClient>,
    limit: Duration,
    poll: Duration,
) -> BridgeResult<()> {
    let client = Arc::clone(client);
    let attempt = async move {
        client.connect().await?;
        while !client.is_connected() {
            sleep(poll).await;
        }
        Ok::<(), wabridge_core::ClientError>(())
    };

    match timeout(limit, attempt).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(BridgeError::Timeout(format!(
            "no connection within {}s",
            limit.as_secs()
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::path::Path;

    use std::sync::atomic::AtomicBool;

    use wabridge_core::testing::FakeFactory;
    use wabridge_core::{ClientError, Device, DeviceDescriptor, DeviceStore, StorageLayout};

    use super::*;
    use crate::storage::Identity;

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: ClientPool,
        factory: Arc<FakeFactory>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(StorageLayout::new(dir.path()), Duration::from_secs(1))
            .await
            .unwrap();
        let factory = Arc::new(FakeFactory::new());
        let config = PoolConfig {
            connect_timeout_secs: 1,
            reconnect_timeout_secs: 1,
            connect_poll_millis: 10,
            call_timeout_secs: 1,
            logout_debounce_millis: 100,
        };
        let pool = ClientPool::new(
            registry,
            factory.clone(),
            AppStores::new(Duration::from_millis(1), Duration::from_secs(1)),
            LastUsed::new(),
            config,
        );
        Fixture {
            _dir: dir,
            pool,
            factory,
        }
    }

    async fn paired_identity(fx: &Fixture, owner: OperatorId, phone: &str) -> Identity {
        let registry = fx.pool.registry();
        let paths = registry.layout().identity_paths(owner, phone);
        touch(&paths.protocol_store);
        touch(&paths.app_store);
        fx.factory
            .set_device(&paths.protocol_store, Some(format!("{phone}@s.whatsapp.net").as_str()));
        registry
            .insert(phone, &paths.protocol_store, &paths.app_store, owner)
            .await
            .unwrap()
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"store").unwrap();
    }

    #[tokio::test]
    async fn slow_path_connects_and_fast_path_reuses() {
        let fx = fixture().await;
        let identity = paired_identity(&fx, 555, "628111").await;

        let first = fx.pool.get_or_create(identity.id).await.unwrap();
        assert!(first.client.is_connected());
        let second = fx.pool.get_or_create(identity.id).await.unwrap();
        assert!(first.same_client(&second));
        assert_eq!(first.generation, second.generation);
        assert_eq!(fx.factory.built().len(), 1);
    }

    #[tokio::test]
    async fn dropped_connection_is_revived_in_place() {
        let fx = fixture().await;
        let identity = paired_identity(&fx, 555, "628111").await;
        let first = fx.pool.get_or_create(identity.id).await.unwrap();

        let fake = fx.factory.last_built().unwrap();
        fake.drop_connection();

        let again = fx.pool.get_or_create(identity.id).await.unwrap();
        assert!(again.same_client(&first));
        assert_eq!(fake.connect_calls(), 2);
        assert_eq!(fx.factory.built().len(), 1);
    }

    /// Client whose connect takes a while and fails when one is already
    /// running, like a real websocket client.
    #[derive(Default)]
    struct SlowClient {
        connecting: AtomicBool,
        connected: AtomicBool,
        connects: AtomicU64,
    }

    #[async_trait::async_trait]
    impl WaClient for SlowClient {
        async fn connect(&self) -> Result<(), ClientError> {
            if self.connecting.swap(true, Ordering::SeqCst) || self.is_connected() {
                return Err(ClientError::Websocket("already connected".into()));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(50)).await;
            self.connected.store(true, Ordering::SeqCst);
            self.connecting.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn pairing_id(&self) -> Option<String> {
            Some("628111@s.whatsapp.net".to_string())
        }

        async fn pair_phone(
            &self,
            _phone: &str,
            _descriptor: DeviceDescriptor,
        ) -> Result<String, ClientError> {
            Err(ClientError::NotPaired)
        }
    }

    /// Reads devices through a [`FakeFactory`] and builds [`SlowClient`]s.
    struct SlowFactory {
        stores: Arc<FakeFactory>,
        built: parking_lot::Mutex<Vec<Arc<SlowClient>>>,
    }

    #[async_trait::async_trait]
    impl ClientFactory for SlowFactory {
        async fn open_store(&self, path: &Path) -> Result<Arc<dyn DeviceStore>, ClientError> {
            self.stores.open_store(path).await
        }

        fn build(&self, _device: Device) -> Arc<dyn WaClient> {
            let client = Arc::new(SlowClient::default());
            self.built.lock().push(Arc::clone(&client));
            client
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_connect() {
        let fx = fixture().await;
        let identity = paired_identity(&fx, 555, "628111").await;
        let factory = Arc::new(SlowFactory {
            stores: fx.factory.clone(),
            built: parking_lot::Mutex::new(Vec::new()),
        });
        let pool = ClientPool::new(
            fx.pool.registry().clone(),
            factory.clone(),
            AppStores::new(Duration::from_millis(1), Duration::from_secs(1)),
            LastUsed::new(),
            fx.pool.config().clone(),
        );

        let (a, b, c) = tokio::join!(
            pool.get_or_create(identity.id),
            pool.get_or_create(identity.id),
            pool.get_or_create(identity.id),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert!(a.same_client(&b) && a.same_client(&c));
        assert!(a.client.is_connected());
        assert!(pool.peek(identity.id).await.unwrap().same_client(&a));
        let built = factory.built.lock().clone();
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconnect_is_not_run_twice() {
        let fx = fixture().await;
        let identity = paired_identity(&fx, 555, "628111").await;
        let factory = Arc::new(SlowFactory {
            stores: fx.factory.clone(),
            built: parking_lot::Mutex::new(Vec::new()),
        });
        let pool = ClientPool::new(
            fx.pool.registry().clone(),
            factory.clone(),
            AppStores::new(Duration::from_millis(1), Duration::from_secs(1)),
            LastUsed::new(),
            fx.pool.config().clone(),
        );
        let first = pool.get_or_create(identity.id).await.unwrap();
        first.client.disconnect().await;

        let (a, b) = tokio::join!(pool.get_or_create(identity.id), pool.get_or_create(identity.id));
        assert!(a.unwrap().same_client(&first));
        assert!(b.unwrap().same_client(&first));
        assert_eq!(factory.built.lock()[0].connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_row_is_not_found() {
        let fx = fixture().await;
        let err = fx.pool.get_or_create(42).await.unwrap_err();
        assert_eq!(err.code(), "ENOTFOUND");
    }

    #[tokio::test]
    async fn refused_connect_leaves_no_entry() {
        let fx = fixture().await;
        let identity = paired_identity(&fx, 555, "628111").await;
        fx.factory.set_refuse_connect(true);

        let err = fx.pool.get_or_create(identity.id).await.unwrap_err();
        assert_eq!(err.code(), "ETRANSPORT");
        assert!(fx.pool.peek(identity.id).await.is_none());
    }

    #[tokio::test]
    async fn unpaired_device_is_logged_out_and_destroyed() {
        let fx = fixture().await;
        let identity = paired_identity(&fx, 555, "628111").await;
        fx.factory.set_device(&identity.protocol_store_path, None);

        let err = fx.pool.get_or_create(identity.id).await.unwrap_err();
        assert_eq!(err.code(), "ELOGGEDOUT");
        let err = fx.pool.get_or_create(identity.id).await.unwrap_err();
        assert_eq!(err.code(), "ELOGGEDOUT");
        assert_eq!(fx.pool.pending_destroys(), vec![identity.id]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(fx.pool.pending_destroys().is_empty());
        assert!(fx.pool.registry().get(identity.id).await.unwrap().is_none());
        assert!(!identity.protocol_store_path.exists());
        assert!(!identity.app_store_path.exists());
    }

    #[tokio::test]
    async fn logout_of_pooled_client_schedules_destroy() {
        let fx = fixture().await;
        let identity = paired_identity(&fx, 555, "628111").await;
        fx.pool.get_or_create(identity.id).await.unwrap();
        fx.factory.last_built().unwrap().log_out();

        let err = fx.pool.get_or_create(identity.id).await.unwrap_err();
        assert_eq!(err.code(), "ELOGGEDOUT");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(fx.pool.peek(identity.id).await.is_none());
        assert!(fx.pool.registry().get(identity.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn destroy_removes_everything() {
        let fx = fixture().await;
        let identity = paired_identity(&fx, 555, "628111").await;
        for sidecar in wabridge_core::layout::sidecars(&identity.app_store_path) {
            touch(&sidecar);
        }
        fx.pool.get_or_create(identity.id).await.unwrap();
        fx.pool.set_current_for(555, identity.id).await;

        let outcome = fx.pool.destroy(identity.id).await.unwrap();
        assert_eq!(outcome.files_deleted, 4);
        assert!(outcome.backup.unwrap().exists());
        assert!(fx.pool.peek(identity.id).await.is_none());
        assert!(fx.pool.current_for(555).await.is_none());
        assert!(fx.pool.current_global().await.is_none());
        assert!(fx.pool.last_used().get(identity.id).is_none());
        assert_eq!(fx.factory.last_built().unwrap().disconnect_calls(), 1);

        // Idempotent.
        let again = fx.pool.destroy(identity.id).await.unwrap();
        assert!(again.identity.is_none());
        assert_eq!(again.files_deleted, 0);
    }

    #[tokio::test]
    async fn adopt_replaces_with_new_generation() {
        let fx = fixture().await;
        let identity = paired_identity(&fx, 555, "628111").await;
        let first = fx.pool.get_or_create(identity.id).await.unwrap();

        let replacement = Arc::new(wabridge_core::testing::FakeClient::new(Some("628111@s")));
        replacement.connect().await.unwrap();
        let adopted = fx.pool.adopt(identity.id, replacement).await.unwrap();

        assert!(adopted.generation > first.generation);
        assert!(!first.client.is_connected());
        let current = fx.pool.get_or_create(identity.id).await.unwrap();
        assert!(current.same_client(&adopted));
    }

    #[tokio::test]
    async fn remove_marks_inactive() {
        let fx = fixture().await;
        let identity = paired_identity(&fx, 555, "628111").await;
        fx.pool.get_or_create(identity.id).await.unwrap();

        assert!(fx.pool.remove(identity.id).await.unwrap());
        assert!(!fx.pool.remove(identity.id).await.unwrap());
        let row = fx.pool.registry().require(identity.id).await.unwrap();
        assert_eq!(row.status, IdentityStatus::Inactive);
        assert!(fx.pool.ids().await.is_empty());
    }

    #[tokio::test]
    async fn current_pointers_are_per_operator() {
        let fx = fixture().await;
        fx.pool.set_current_for(555, 1).await;
        fx.pool.set_current_for(777, 2).await;

        assert_eq!(fx.pool.current_for(555).await, Some(1));
        assert_eq!(fx.pool.current_for(777).await, Some(2));
        assert_eq!(fx.pool.current_global().await, Some(2));
        assert!(fx.pool.last_used().get(1).is_some());
    }
}
