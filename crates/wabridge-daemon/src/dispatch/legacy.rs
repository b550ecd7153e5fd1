//! Task-local "current client" for handlers written against a single global
//! client.
//!
//! The dispatcher scopes the dispatched operator's client around the handler
//! future, so a read from inside a handler can never observe another
//! operator's client.

use std::future::Future;
use std::sync::Arc;

use wabridge_core::{IdentityId, WaClient};

/// Snapshot visible to legacy handler code.
#[derive(Clone)]
pub struct CurrentClient {
    pub identity_id: IdentityId,
    pub client: Arc<dyn WaClient>,
}

tokio::task_local! {
    static CURRENT: Option<CurrentClient>;
}

/// Run `fut` with `current` as the current client.
pub async fn scope<F: Future>(current: Option<CurrentClient>, fut: F) -> F::Output {
    CURRENT.scope(current, fut).await
}

/// Client of the operator being dispatched, if any.
pub fn current_client() -> Option<CurrentClient> {
    CURRENT.try_with(Clone::clone).ok().flatten()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use wabridge_core::testing::FakeClient;

    use super::*;

    #[tokio::test]
    async fn snapshot_is_scoped_per_task() {
        assert!(current_client().is_none());

        let a: Arc<dyn WaClient> = Arc::new(FakeClient::new(Some("a@s")));
        let b: Arc<dyn WaClient> = Arc::new(FakeClient::new(Some("b@s")));

        let task_a = tokio::spawn(scope(
            Some(CurrentClient {
                identity_id: 1,
                client: a,
            }),
            async {
                tokio::task::yield_now().await;
                current_client().map(|c| c.client.pairing_id())
            },
        ));
        let task_b = tokio::spawn(scope(
            Some(CurrentClient {
                identity_id: 2,
                client: b,
            }),
            async {
                tokio::task::yield_now().await;
                current_client().map(|c| c.identity_id)
            },
        ));

        assert_eq!(task_a.await.unwrap(), Some(Some("a@s".to_string())));
        assert_eq!(task_b.await.unwrap(), Some(2));
        assert!(current_client().is_none());
    }
}
