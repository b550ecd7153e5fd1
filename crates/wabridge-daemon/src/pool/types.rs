//! Types for the client pool.

use std::path::PathBuf;
use std::sync::Arc;

use wabridge_core::{IdentityId, WaClient};

use crate::storage::Identity;

/// A live client as held by the pool.
///
/// `generation` grows every time a client is inserted for any identity, so a
/// caller holding an older generation knows the client has been replaced.
#[derive(Clone)]
pub struct PooledClient {
    pub identity_id: IdentityId,
    pub client: Arc<dyn WaClient>,
    pub generation: u64,
}

impl PooledClient {
    pub fn is_paired(&self) -> bool {
        self.client.has_paired_id()
    }

    /// Whether `other` is the very same client object.
    pub fn same_client(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.client, &other.client)
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("identity_id", &self.identity_id)
            .field("generation", &self.generation)
            .field("connected", &self.client.is_connected())
            .finish_non_exhaustive()
    }
}

/// What a destroy removed.
#[derive(Debug, Clone, Default)]
pub struct DestroyOutcome {
    /// Catalog row as it was before deletion; `None` when it was already gone.
    pub identity: Option<Identity>,
    pub files_deleted: usize,
    pub backup: Option<PathBuf>,
}
