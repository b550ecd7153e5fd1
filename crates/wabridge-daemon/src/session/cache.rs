//! Per-operator session cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use wabridge_core::{IdentityId, OperatorId};

use super::types::Session;
use crate::error::{BridgeError, BridgeResult};
use crate::pool::ClientPool;
use crate::storage::{AppStores, Identity};

/// Maps each operator to at most one session.
#[derive(Clone)]
pub struct SessionCache {
    pool: ClientPool,
    app_stores: AppStores,
    sessions: Arc<RwLock<HashMap<OperatorId, Arc<Session>>>>,
}

impl SessionCache {
    pub fn new(pool: ClientPool, app_stores: AppStores) -> Self {
        Self {
            pool,
            app_stores,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Session for `operator`, building it when the cached one is stale.
    ///
    /// `Ok(None)` means the operator has no identity yet.
    pub async fn resolve(&self, operator: OperatorId) -> BridgeResult<Option<Arc<Session>>> {
        let cached = self.sessions.read().await.get(&operator).cloned();
        if let Some(session) = cached {
            if self.is_valid(&session).await {
                return Ok(Some(session));
            }
            debug!(operator, identity_id = session.identity_id(), "Session stale, rebuilding");
            self.drop_if_same(operator, &session).await;
        }

        let Some(identity) = self.pick_identity(operator).await? else {
            return Ok(None);
        };

        let pooled = self.pool.get_or_create(identity.id).await?;
        let app_store = self
            .app_stores
            .bind(operator, identity.id, &identity.app_store_path)
            .await?;

        let session = Arc::new(Session::new(operator, identity, pooled, app_store));
        self.sessions
            .write()
            .await
            .insert(operator, Arc::clone(&session));

        info!(
            operator,
            identity_id = session.identity_id(),
            generation = session.generation(),
            "Session resolved"
        );
        Ok(Some(session))
    }

    /// The operator's current pointer when it is theirs, else their first
    /// identity.
    async fn pick_identity(&self, operator: OperatorId) -> BridgeResult<Option<Identity>> {
        let registry = self.pool.registry();
        if let Some(id) = self.pool.current_for(operator).await {
            match registry.get(id).await {
                Ok(Some(identity)) if identity.is_owned_by(operator) => return Ok(Some(identity)),
                Ok(_) | Err(BridgeError::Forbidden(_)) => {
                    debug!(operator, identity_id = id, "Ignoring stale current pointer");
                }
                Err(e) => return Err(e),
            }
        }

        let picked = registry.get_by_owner(operator).await?;
        if let Some(identity) = &picked {
            self.pool.set_current_for(operator, identity.id).await;
        }
        Ok(picked)
    }

    async fn is_valid(&self, session: &Session) -> bool {
        let id = session.identity_id();

        if let Some(current) = self.pool.current_for(session.operator).await
            && current != id
        {
            return false;
        }

        let still_paired = self.pool.peek(id).await.is_some_and(|entry| {
            entry.generation == session.generation() && entry.is_paired()
        });
        if !still_paired {
            return false;
        }

        matches!(
            self.pool.registry().get(id).await,
            Ok(Some(identity)) if identity.is_owned_by(session.operator)
        )
    }

    async fn drop_if_same(&self, operator: OperatorId, stale: &Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&operator)
            .is_some_and(|current| Arc::ptr_eq(current, stale))
        {
            sessions.remove(&operator);
        }
    }

    /// Forget the operator's session.
    pub async fn invalidate(&self, operator: OperatorId) {
        if self.sessions.write().await.remove(&operator).is_some() {
            debug!(operator, "Session invalidated");
        }
    }

    /// Forget every session bound to `id`.
    pub async fn invalidate_identity(&self, id: IdentityId) {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.identity_id() != id);
        let removed = before - sessions.len();
        drop(sessions);
        if removed > 0 {
            debug!(identity_id = id, sessions = removed, "Sessions invalidated");
        }
    }

    /// Identities with a live session.
    pub async fn active_identity_ids(&self) -> HashSet<IdentityId> {
        self.sessions
            .read()
            .await
            .values()
            .map(|session| session.identity_id())
            .collect()
    }

    /// Cached session without validation.
    pub async fn cached(&self, operator: OperatorId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&operator).cloned()
    }
}
