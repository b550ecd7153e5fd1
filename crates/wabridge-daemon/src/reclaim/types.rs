//! Reclaimer reports and collaborators.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use wabridge_core::IdentityId;

use crate::session::SessionCache;

/// Identities that must survive the inactive sweep regardless of age.
#[async_trait]
pub trait ActiveIdentities: Send + Sync {
    async fn active_identity_ids(&self) -> HashSet<IdentityId>;
}

#[async_trait]
impl ActiveIdentities for SessionCache {
    async fn active_identity_ids(&self) -> HashSet<IdentityId> {
        Self::active_identity_ids(self).await
    }
}

/// Nothing is ever active; used by the maintenance commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoActiveIdentities;

#[async_trait]
impl ActiveIdentities for NoActiveIdentities {
    async fn active_identity_ids(&self) -> HashSet<IdentityId> {
        HashSet::new()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanReport {
    pub scanned: usize,
    pub deleted: Vec<PathBuf>,
}

/// Result of pruning an operator's identities to a phone list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub files_deleted: usize,
    pub kept_phones: Vec<String>,
    pub deleted_phones: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub checked: usize,
    pub relocated: Vec<IdentityId>,
    pub deactivated: Vec<IdentityId>,
    pub logged_out: Vec<IdentityId>,
}
