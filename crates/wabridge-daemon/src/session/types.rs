//! Session types.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use wabridge_core::{IdentityId, OperatorId, WaClient};

use crate::pool::PooledClient;
use crate::storage::{AppStoreHandle, Identity};

/// One operator's resolved view: their identity, its live client and the
/// bound app store.
///
/// Non-authoritative; rebuilt whenever the row or the pooled client changes.
#[derive(Debug)]
pub struct Session {
    pub operator: OperatorId,
    pub identity: Identity,
    pub pooled: PooledClient,
    pub app_store: AppStoreHandle,
    work: Mutex<()>,
}

impl Session {
    pub(crate) fn new(
        operator: OperatorId,
        identity: Identity,
        pooled: PooledClient,
        app_store: AppStoreHandle,
    ) -> Self {
        Self {
            operator,
            identity,
            pooled,
            app_store,
            work: Mutex::new(()),
        }
    }

    pub const fn identity_id(&self) -> IdentityId {
        self.identity.id
    }

    pub fn client(&self) -> Arc<dyn WaClient> {
        Arc::clone(&self.pooled.client)
    }

    pub const fn generation(&self) -> u64 {
        self.pooled.generation
    }

    /// Serialise mutating handler work on this session.
    pub async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.work.lock().await
    }
}
