#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! End-to-end identity lifecycle through the [`Bridge`] facade.
//!
//! Drives cataloguing, gap reuse, cross-operator refusal, bulk jobs across a
//! client swap, orphan reclamation and the inactive sweep against a real
//! on-disk storage root with in-process protocol fakes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use wabridge_core::layout::file_group;
use wabridge_core::testing::{FakeFactory, RecordingActivityLog, RecordingTransport};
use wabridge_core::{Config, OperatorId, WaClient};
use wabridge_daemon::Bridge;
use wabridge_daemon::storage::Identity;

struct Harness {
    dir: tempfile::TempDir,
    bridge: Bridge,
    factory: Arc<FakeFactory>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.root = dir.path().to_path_buf();
        config.session.rebuild_delay_millis = 1;
        config.pool.logout_debounce_millis = 10;
        config.pairing.timeout_secs = 2;
        config.pairing.poll_interval_millis = 10;
        config.pairing.backoff_unit_millis = 1;

        let factory = Arc::new(FakeFactory::new());
        let bridge = Bridge::open(
            &config,
            factory.clone(),
            Arc::new(RecordingTransport::new()),
            Arc::new(RecordingActivityLog::default()),
        )
        .await
        .unwrap();
        Self {
            dir,
            bridge,
            factory,
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Catalogue `phone` for `owner` with a paired device store on disk.
    async fn catalogue(&self, owner: OperatorId, phone: &str) -> Identity {
        let paths = self.bridge.registry().layout().identity_paths(owner, phone);
        std::fs::create_dir_all(paths.protocol_store.parent().unwrap()).unwrap();
        std::fs::write(&paths.protocol_store, b"").unwrap();
        std::fs::write(&paths.app_store, b"").unwrap();
        self.factory.set_device(
            &paths.protocol_store,
            Some(format!("{phone}@s.whatsapp.net").as_str()),
        );
        self.bridge
            .registry()
            .insert(phone, &paths.protocol_store, &paths.app_store, owner)
            .await
            .unwrap()
    }
}

fn write_group(path: &Path) {
    for file in file_group(path) {
        std::fs::write(file, b"x").unwrap();
    }
}

fn store_files_under(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else if wabridge_core::layout::is_identity_store(&path) {
                found.push(path);
            }
        }
    }
    found
}

#[tokio::test]
async fn first_identity_is_catalogued_under_owner_dir() {
    let h = Harness::new().await;

    let identity = h.catalogue(555, "628111").await;

    assert_eq!(identity.id, 1);
    assert_eq!(
        identity.protocol_store_path,
        h.root().join("555").join("whatsmeow-555-628111.db")
    );
    assert_eq!(
        identity.app_store_path,
        h.root().join("555").join("bot_data-555-628111.db")
    );
    assert_eq!(h.bridge.list_identities(555).await.unwrap().len(), 1);
    assert!(h.bridge.list_identities(999).await.unwrap().is_empty());
}

#[tokio::test]
async fn deleted_id_is_reused_and_sequence_tracks_max() {
    let h = Harness::new().await;
    let first = h.catalogue(555, "628111").await;
    let second = h.catalogue(555, "628222").await;
    assert_eq!(second.id, 2);

    h.bridge.delete_identity(555, first.id).await.unwrap();
    let third = h.catalogue(555, "628333").await;

    assert_eq!(third.id, 1);
    assert!(h.bridge.registry().sequence_value().await.unwrap().unwrap() >= 2);
}

#[tokio::test]
async fn other_operator_cannot_delete() {
    let h = Harness::new().await;
    h.catalogue(555, "628111").await;
    let target = h.catalogue(555, "628222").await;

    let err = h.bridge.delete_identity(999, target.id).await.unwrap_err();

    assert_eq!(err.code(), "EFORBIDDEN");
    assert!(h.bridge.registry().get(target.id).await.unwrap().is_some());
}

#[tokio::test]
async fn bulk_job_continues_on_replacement_client() {
    let h = Harness::new().await;
    let identity = h.catalogue(555, "628111").await;

    let seen: Arc<Mutex<Vec<Arc<dyn WaClient>>>> = Arc::new(Mutex::new(Vec::new()));
    let pool = h.bridge.pool().clone();
    let seen_op = seen.clone();
    let id = identity.id;
    let groups: Vec<String> = (1..=10).map(|n| format!("group-{n}")).collect();

    let handle = h
        .bridge
        .spawn_job(555, groups, Duration::from_millis(5), move |client, group| {
            let seen = seen_op.clone();
            let pool = pool.clone();
            async move {
                seen.lock().push(client);
                if group == "group-3" {
                    // Disconnect; the next iteration reconnects through the pool.
                    pool.remove(id).await.unwrap();
                }
                Ok(())
            }
        })
        .await
        .unwrap();
    let report = handle.join().await.unwrap();

    assert_eq!(report.attempted, 10);
    assert_eq!(report.succeeded, 10);
    let seen = seen.lock();
    let stale = Arc::as_ptr(&seen[2]);
    let fresh = Arc::as_ptr(&seen[3]);
    assert!(!std::ptr::addr_eq(stale, fresh));
    for client in &seen[3..] {
        assert!(std::ptr::addr_eq(Arc::as_ptr(client), fresh));
        assert!(client.is_connected());
    }
}

#[tokio::test]
async fn startup_sweep_removes_stray_store_and_keeps_master() {
    let h = Harness::new().await;
    let kept = h.catalogue(555, "628111").await;
    let stray = h.root().join("bot_data-777-628444.db");
    write_group(&stray);

    let report = h.bridge.startup().await.unwrap();

    assert_eq!(report.orphans.deleted.len(), 3);
    for file in file_group(&stray) {
        assert!(!file.exists());
    }
    assert!(h.bridge.registry().layout().master_path().exists());
    assert!(kept.protocol_store_path.exists());
    assert!(kept.app_store_path.exists());
}

#[tokio::test]
async fn idle_identity_is_destroyed_with_all_files() {
    let h = Harness::new().await;
    let identity = h.catalogue(555, "628111").await;
    write_group(&identity.protocol_store_path);
    write_group(&identity.app_store_path);
    let eight_days_ago = identity.updated_at;
    h.bridge.pool().last_used().set(identity.id, eight_days_ago);

    let now = eight_days_ago + 8 * 24 * 60 * 60;
    let destroyed = h.bridge.reclaimer().sweep_inactive_at(now).await.unwrap();

    assert_eq!(destroyed, vec![identity.id]);
    assert!(h.bridge.registry().get(identity.id).await.unwrap().is_none());
    for file in file_group(&identity.protocol_store_path)
        .into_iter()
        .chain(file_group(&identity.app_store_path))
    {
        assert!(!file.exists(), "{} should be gone", file.display());
    }
    assert!(h.bridge.pool().last_used().get(identity.id).is_none());
}

#[tokio::test]
async fn row_owner_always_matches_app_store_path() {
    let h = Harness::new().await;
    h.catalogue(555, "628111").await;
    h.catalogue(555, "628222").await;
    h.catalogue(777, "628111").await;

    let rows = h.bridge.registry().list_all().await.unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(
            wabridge_core::layout::parse_owner(&row.app_store_path),
            Some(row.owner)
        );
    }

    let pairs: HashSet<_> = rows.iter().map(|r| (r.owner, r.phone.clone())).collect();
    assert_eq!(pairs.len(), rows.len());
    let err = h
        .bridge
        .registry()
        .insert(
            "+62 811-1",
            &h.root().join("555/whatsmeow-555-628111.db"),
            &h.root().join("555/bot_data-555-628111.db"),
            555,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "EDUPLICATE");
}

#[tokio::test]
async fn ids_stay_dense_as_gaps_close() {
    let h = Harness::new().await;
    for phone in ["628101", "628102", "628103", "628104"] {
        h.catalogue(555, phone).await;
    }
    h.bridge.delete_identity(555, 2).await.unwrap();
    h.bridge.delete_identity(555, 3).await.unwrap();
    assert_eq!(h.bridge.registry().ids().await.unwrap(), vec![1, 4]);

    assert_eq!(h.catalogue(555, "628105").await.id, 2);
    assert_eq!(h.catalogue(555, "628106").await.id, 3);
    assert_eq!(h.catalogue(555, "628107").await.id, 5);
}

#[tokio::test]
async fn orphan_sweep_leaves_only_catalogued_files() {
    let h = Harness::new().await;
    let identity = h.catalogue(555, "628111").await;
    write_group(&h.root().join("555").join("whatsmeow-555-628999.db"));
    write_group(&h.root().join("bot_data-888.db"));

    let first = h.bridge.reclaimer().sweep_orphan_files().await.unwrap();
    assert_eq!(first.deleted.len(), 6);
    let second = h.bridge.reclaimer().sweep_orphan_files().await.unwrap();
    assert!(second.deleted.is_empty());

    let catalogued: HashSet<PathBuf> = [
        identity.protocol_store_path.clone(),
        identity.app_store_path.clone(),
    ]
    .into_iter()
    .collect();
    for file in store_files_under(h.root()) {
        assert!(catalogued.contains(&file), "{} is not catalogued", file.display());
    }
    assert!(identity.protocol_store_path.exists());
    assert!(identity.app_store_path.exists());
}

#[tokio::test]
async fn concurrent_operators_never_share_a_client() {
    let h = Harness::new().await;
    let a = h.catalogue(555, "628111").await;
    let b = h.catalogue(777, "628222").await;

    for _ in 0..5 {
        let (left, right) = tokio::join!(h.bridge.resolve_session(555), h.bridge.resolve_session(777));
        let left = left.unwrap().unwrap();
        let right = right.unwrap().unwrap();

        assert_eq!(left.identity_id(), a.id);
        assert_eq!(right.identity_id(), b.id);
        assert!(!std::ptr::addr_eq(
            Arc::as_ptr(&left.client()),
            Arc::as_ptr(&right.client())
        ));
        assert_ne!(left.app_store.path, right.app_store.path);
    }
}

#[tokio::test]
async fn destroy_then_insert_takes_smallest_free_id() {
    let h = Harness::new().await;
    let first = h.catalogue(555, "628111").await;
    h.catalogue(555, "628222").await;

    h.bridge.delete_identity(555, first.id).await.unwrap();
    let again = h.catalogue(555, "628111").await;

    assert_eq!(again.id, first.id);
}

#[tokio::test]
async fn delete_round_trip_leaves_no_sidecars() {
    let h = Harness::new().await;
    let identity = h.catalogue(555, "628111").await;
    write_group(&identity.protocol_store_path);
    write_group(&identity.app_store_path);
    assert!(
        h.bridge
            .list_identities(555)
            .await
            .unwrap()
            .iter()
            .any(|i| i.id == identity.id)
    );

    let outcome = h.bridge.delete_identity(555, identity.id).await.unwrap();

    assert_eq!(outcome.files_deleted, 6);
    assert!(h.bridge.list_identities(555).await.unwrap().is_empty());
    assert!(store_files_under(h.root()).is_empty());

    let err = h.bridge.registry().delete(identity.id).await.unwrap_err();
    assert_eq!(err.code(), "ENOTFOUND");
}

#[tokio::test]
async fn registered_identity_becomes_current_session() {
    let h = Harness::new().await;
    let bridge = Arc::new(h.bridge);
    let factory = h.factory.clone();

    let task = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.register_identity(555, "6281112345678").await })
    };
    // Wait for the throw-away pairing client, then confirm on the "phone".
    let client = loop {
        if let Some(client) = factory.last_built() {
            break client;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    client.complete_pairing("6281112345678@s.whatsapp.net");

    let identity = task.await.unwrap().unwrap();
    assert_eq!(identity.phone, "6281112345678");
    assert_eq!(bridge.pool().current_for(555).await, Some(identity.id));

    let session = bridge.resolve_session(555).await.unwrap().unwrap();
    assert_eq!(session.identity_id(), identity.id);
    assert!(session.client().is_connected());
}
