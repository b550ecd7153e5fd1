//! Background reclamation of per-identity storage.
//!
//! Every destroy goes through [`ClientPool::destroy`], which holds the pool's
//! write lock for the whole teardown.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use wabridge_core::config::ReclaimConfig;
use wabridge_core::db::unix_timestamp;
use wabridge_core::layout::{file_group, remove_file_quietly};
use wabridge_core::{IdentityId, OperatorId, phone};

use super::types::{ActiveIdentities, OrphanReport, PruneReport, ValidationReport};
use crate::error::BridgeResult;
use crate::pairing::PairingCoordinator;
use crate::pool::ClientPool;
use crate::storage::IdentityStatus;

const MIN_TICK: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Reclaimer {
    pool: ClientPool,
    pairing: PairingCoordinator,
    active: Arc<dyn ActiveIdentities>,
    config: ReclaimConfig,
}

impl Reclaimer {
    pub fn new(
        pool: ClientPool,
        pairing: PairingCoordinator,
        active: Arc<dyn ActiveIdentities>,
        config: ReclaimConfig,
    ) -> Self {
        Self {
            pool,
            pairing,
            active,
            config,
        }
    }

    // =========================================================================
    // Orphan files
    // =========================================================================

    /// Delete per-identity store files that no catalog row (and no pairing in
    /// flight) accounts for. The master catalog is never a candidate.
    pub async fn sweep_orphan_files(&self) -> BridgeResult<OrphanReport> {
        let registry = self.pool.registry();
        let scanned = registry
            .layout()
            .scan_store_files()
            .map_err(|e| crate::error::BridgeError::Storage(e.to_string()))?;

        // In-flight first: a pairing that completes in between is then
        // already catalogued when the catalog is read.
        let in_flight = self.pairing.in_flight_paths().await;
        let catalogued = registry.catalog_paths().await?;

        let mut keep: HashSet<PathBuf> = HashSet::new();
        for path in in_flight.into_iter().chain(catalogued) {
            keep.extend(file_group(&path).iter().map(|p| comparable(p)));
        }

        let mut report = OrphanReport {
            scanned: scanned.len(),
            deleted: Vec::new(),
        };
        for path in scanned {
            if keep.contains(&comparable(&path)) {
                continue;
            }
            if remove_file_quietly(&path) {
                report.deleted.push(path);
            }
        }

        if report.deleted.is_empty() {
            debug!(scanned = report.scanned, "Orphan sweep found nothing");
        } else {
            info!(
                scanned = report.scanned,
                deleted = report.deleted.len(),
                "Orphan store files removed"
            );
        }
        Ok(report)
    }

    // =========================================================================
    // Inactive identities
    // =========================================================================

    /// Destroy identities unused for longer than the inactive threshold.
    pub async fn sweep_inactive(&self) -> BridgeResult<Vec<IdentityId>> {
        self.sweep_inactive_at(unix_timestamp()).await
    }

    /// [`Reclaimer::sweep_inactive`] evaluated at `now` (unix seconds).
    pub async fn sweep_inactive_at(&self, now: i64) -> BridgeResult<Vec<IdentityId>> {
        let threshold = i64::try_from(self.config.inactive_threshold().as_secs()).unwrap_or(i64::MAX);
        let active = self.active.active_identity_ids().await;
        let last_used = self.pool.last_used();

        let mut destroyed = Vec::new();
        for identity in self.pool.registry().list_all().await? {
            let last = last_used
                .get(identity.id)
                .map_or(identity.updated_at, |used| used.max(identity.updated_at));
            if now.saturating_sub(last) <= threshold || active.contains(&identity.id) {
                continue;
            }

            info!(
                identity_id = identity.id,
                owner = identity.owner,
                idle_secs = now - last,
                "Destroying inactive identity"
            );
            match self.pool.destroy(identity.id).await {
                Ok(_) => destroyed.push(identity.id),
                Err(e) => warn!(identity_id = identity.id, error = %e, "Inactive destroy failed"),
            }
        }
        Ok(destroyed)
    }

    // =========================================================================
    // Phone list
    // =========================================================================

    /// Destroy every identity of `operator` whose phone is not in `keep`.
    pub async fn prune_to_phones<S: AsRef<str>>(
        &self,
        operator: OperatorId,
        keep: &[S],
    ) -> BridgeResult<PruneReport> {
        let keep: HashSet<String> = keep.iter().map(|p| phone::normalize(p.as_ref())).collect();

        let mut report = PruneReport::default();
        for identity in self.pool.registry().list_by_owner(operator).await? {
            if keep.contains(&identity.phone) {
                report.kept_phones.push(identity.phone);
                continue;
            }
            let outcome = self.pool.destroy(identity.id).await?;
            report.files_deleted += outcome.files_deleted;
            report.deleted_phones.push(identity.phone);
        }

        info!(
            operator,
            kept = report.kept_phones.len(),
            deleted = report.deleted_phones.len(),
            files = report.files_deleted,
            "Identities pruned to phone list"
        );
        Ok(report)
    }

    // =========================================================================
    // Startup validation
    // =========================================================================

    /// Check every catalogued identity against the disk.
    ///
    /// Missing protocol stores are looked up under `<root>/<owner>/` and the
    /// row is rewritten when found; otherwise the identity is marked inactive
    /// and left to the inactive sweep. A device store without a pairing id is
    /// a logged-out identity and gets a debounced destroy.
    pub async fn validate_startup(&self) -> BridgeResult<ValidationReport> {
        let registry = self.pool.registry();
        let layout = registry.layout();
        let mut report = ValidationReport::default();

        for identity in registry.list_all().await? {
            report.checked += 1;
            let mut protocol = identity.protocol_store_path.clone();

            if !protocol.exists() {
                let Some(moved) = layout
                    .relocated(&protocol, identity.owner)
                    .filter(|p| p.exists())
                else {
                    warn!(
                        identity_id = identity.id,
                        path = %protocol.display(),
                        "Protocol store missing, marking inactive"
                    );
                    registry
                        .update_status(identity.id, IdentityStatus::Inactive)
                        .await?;
                    report.deactivated.push(identity.id);
                    continue;
                };

                let app = layout
                    .relocated(&identity.app_store_path, identity.owner)
                    .filter(|p| p.exists())
                    .unwrap_or_else(|| identity.app_store_path.clone());
                registry.update_paths(identity.id, &moved, &app).await?;
                info!(identity_id = identity.id, path = %moved.display(), "Protocol store relocated");
                report.relocated.push(identity.id);
                protocol = moved;
            }

            if self.is_logged_out(identity.id, &protocol).await {
                self.pool.schedule_destroy(identity.id);
                report.logged_out.push(identity.id);
            }
        }

        info!(
            checked = report.checked,
            relocated = report.relocated.len(),
            deactivated = report.deactivated.len(),
            logged_out = report.logged_out.len(),
            "Startup validation complete"
        );
        Ok(report)
    }

    async fn is_logged_out(&self, id: IdentityId, protocol: &Path) -> bool {
        let store = match self.pool.factory().open_store(protocol).await {
            Ok(store) => store,
            Err(e) => {
                warn!(identity_id = id, error = %e, "Cannot open device store");
                return false;
            }
        };
        match store.first_device().await {
            Ok(device) => !device.is_paired(),
            Err(e) => {
                warn!(identity_id = id, error = %e, "Cannot read device store");
                false
            }
        }
    }

    // =========================================================================
    // Worker
    // =========================================================================

    /// Run the inactive sweep every `interval` (and the orphan sweep every
    /// `orphan_interval` when configured) until `shutdown` changes.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut inactive_timer = ticker(self.config.interval());
            let mut orphan_timer = self.config.orphan_interval().map(ticker);
            inactive_timer.tick().await;
            if let Some(timer) = orphan_timer.as_mut() {
                timer.tick().await;
            }

            info!(
                interval_secs = self.config.interval().as_secs(),
                orphan_sweep = orphan_timer.is_some(),
                "Reclaimer started"
            );

            loop {
                tokio::select! {
                    _ = inactive_timer.tick() => {
                        match self.sweep_inactive().await {
                            Ok(ids) if !ids.is_empty() => {
                                info!(destroyed = ?ids, "Inactive sweep complete");
                            }
                            Ok(_) => debug!("Inactive sweep found nothing"),
                            Err(e) => error!(error = %e, "Inactive sweep failed"),
                        }
                    }
                    () = tick_if_some(&mut orphan_timer) => {
                        if let Err(e) = self.sweep_orphan_files().await {
                            error!(error = %e, "Orphan sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Reclaimer shutting down");
                        return;
                    }
                }
            }
        })
    }
}

fn ticker(period: Duration) -> Interval {
    let mut timer = interval(period.max(MIN_TICK));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn tick_if_some(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Canonical form for comparing scanned paths with catalog paths.
fn comparable(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
