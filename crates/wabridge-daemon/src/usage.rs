//! Process-local last-used timestamps.
//!
//! Advisory only: the inactive sweep combines it with the catalog's
//! `updated_at`, and nothing here survives a restart.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use wabridge_core::IdentityId;
use wabridge_core::db::unix_timestamp;

#[derive(Debug, Clone, Default)]
pub struct LastUsed {
    inner: Arc<RwLock<HashMap<IdentityId, i64>>>,
}

impl LastUsed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self, id: IdentityId) {
        self.inner.write().insert(id, unix_timestamp());
    }

    pub fn set(&self, id: IdentityId, at: i64) {
        self.inner.write().insert(id, at);
    }

    pub fn get(&self, id: IdentityId) -> Option<i64> {
        self.inner.read().get(&id).copied()
    }

    pub fn remove(&self, id: IdentityId) {
        self.inner.write().remove(&id);
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn touch_and_remove() {
        let last_used = LastUsed::new();
        assert!(last_used.get(1).is_none());

        last_used.touch(1);
        assert!(last_used.get(1).unwrap() > 0);

        last_used.set(1, 42);
        assert_eq!(last_used.get(1), Some(42));

        last_used.remove(1);
        assert!(last_used.get(1).is_none());
    }
}
