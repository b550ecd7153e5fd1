//! Per-operator binding of app stores.
//!
//! Each operator has at most one open app store. Switching identity closes
//! the old pool, waits for the file lock to be released and opens the new
//! file, so the next read always lands in the selected tenant's store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::{debug, info};

use wabridge_core::db::open_identity_pool;
use wabridge_core::{IdentityId, OperatorId};

use crate::error::BridgeResult;

/// Open app store of one identity.
#[derive(Debug, Clone)]
pub struct AppStoreHandle {
    pub identity_id: IdentityId,
    pub path: PathBuf,
    pub pool: SqlitePool,
}

/// Table of bound app stores, one per operator.
#[derive(Clone)]
pub struct AppStores {
    bindings: Arc<RwLock<HashMap<OperatorId, AppStoreHandle>>>,
    rebuild_delay: Duration,
    busy_timeout: Duration,
}

impl AppStores {
    pub fn new(rebuild_delay: Duration, busy_timeout: Duration) -> Self {
        Self {
            bindings: Arc::new(RwLock::new(HashMap::new())),
            rebuild_delay,
            busy_timeout,
        }
    }

    /// Bind `operator` to the app store at `path`.
    ///
    /// Returns the existing handle when it already points at `path`.
    pub async fn bind(
        &self,
        operator: OperatorId,
        identity_id: IdentityId,
        path: &Path,
    ) -> BridgeResult<AppStoreHandle> {
        if let Some(handle) = self.bindings.read().await.get(&operator)
            && handle.path == path
            && !handle.pool.is_closed()
        {
            return Ok(handle.clone());
        }

        let previous = self.bindings.write().await.remove(&operator);
        if let Some(previous) = previous {
            previous.pool.close().await;
            debug!(operator, path = %previous.path.display(), "App store released");
            tokio::time::sleep(self.rebuild_delay).await;
        }

        let pool = open_identity_pool(path, self.busy_timeout).await?;
        let handle = AppStoreHandle {
            identity_id,
            path: path.to_path_buf(),
            pool,
        };
        self.bindings.write().await.insert(operator, handle.clone());

        info!(operator, identity_id, path = %path.display(), "App store bound");
        Ok(handle)
    }

    /// Handle currently bound for `operator`.
    pub async fn get(&self, operator: OperatorId) -> Option<AppStoreHandle> {
        self.bindings.read().await.get(&operator).cloned()
    }

    /// Close the operator's app store, if any.
    pub async fn release(&self, operator: OperatorId) {
        let removed = self.bindings.write().await.remove(&operator);
        if let Some(handle) = removed {
            handle.pool.close().await;
            debug!(operator, path = %handle.path.display(), "App store released");
        }
    }

    /// Close every binding that points at `identity_id`.
    pub async fn release_identity(&self, identity_id: IdentityId) {
        let removed: Vec<AppStoreHandle> = {
            let mut bindings = self.bindings.write().await;
            let operators: Vec<OperatorId> = bindings
                .iter()
                .filter(|(_, handle)| handle.identity_id == identity_id)
                .map(|(operator, _)| *operator)
                .collect();
            operators
                .into_iter()
                .filter_map(|operator| bindings.remove(&operator))
                .collect()
        };
        for handle in removed {
            handle.pool.close().await;
            debug!(identity_id, path = %handle.path.display(), "App store released");
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn stores() -> AppStores {
        AppStores::new(Duration::from_millis(10), Duration::from_secs(1))
    }

    async fn write_marker(handle: &AppStoreHandle, value: &str) {
        sqlx::query("CREATE TABLE IF NOT EXISTS marker (value TEXT)")
            .execute(&handle.pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO marker (value) VALUES (?)")
            .bind(value)
            .execute(&handle.pool)
            .await
            .unwrap();
    }

    async fn read_marker(handle: &AppStoreHandle) -> Vec<String> {
        sqlx::query_scalar("SELECT value FROM marker")
            .fetch_all(&handle.pool)
            .await
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn bind_same_path_reuses_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("555/bot_data-555-628111.db");
        let stores = stores();

        let first = stores.bind(555, 1, &path).await.unwrap();
        write_marker(&first, "a").await;
        let second = stores.bind(555, 1, &path).await.unwrap();
        assert_eq!(read_marker(&second).await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn rebind_reads_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("555/bot_data-555-628111.db");
        let b = dir.path().join("555/bot_data-555-628222.db");
        let stores = stores();

        let handle = stores.bind(555, 1, &a).await.unwrap();
        write_marker(&handle, "from-a").await;
        assert!(!handle.pool.is_closed());

        let handle_b = stores.bind(555, 2, &b).await.unwrap();
        assert!(handle.pool.is_closed());
        assert!(read_marker(&handle_b).await.is_empty());
        assert_eq!(stores.get(555).await.unwrap().identity_id, 2);
    }

    #[tokio::test]
    async fn release_identity_closes_all_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("555/bot_data-555-628111.db");
        let other = dir.path().join("777/bot_data-777-628999.db");
        let stores = stores();

        let handle = stores.bind(555, 1, &path).await.unwrap();
        stores.bind(777, 2, &other).await.unwrap();
        stores.release_identity(1).await;

        assert!(handle.pool.is_closed());
        assert!(stores.get(555).await.is_none());
        assert!(stores.get(777).await.is_some());

        stores.release(777).await;
        assert!(stores.get(777).await.is_none());
    }
}
