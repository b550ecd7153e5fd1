//! Handler-facing facade.
//!
//! [`Bridge`] wires the registry, pool, session cache, pairing coordinator,
//! reclaimer and job runner together and exposes the operations command
//! handlers call. Every operation that names an identity checks that the
//! calling operator owns it.

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use wabridge_core::{
    ActivityLog, ClientError, ClientFactory, Config, IdentityId, Keyboard, OperatorId, Transport,
    UiHandle, WaClient,
};

use crate::dispatch::{DeleteTicket, DeleteTickets, Dispatcher, Handler, OperatorEvent};
use crate::error::{BridgeError, BridgeResult};
use crate::jobs::{JobHandle, JobRunner};
use crate::pairing::{PairingCode, PairingCoordinator};
use crate::pool::{ClientPool, DestroyOutcome};
use crate::reclaim::{ActiveIdentities, OrphanReport, PruneReport, Reclaimer, ValidationReport};
use crate::session::{Session, SessionCache};
use crate::storage::{AppStores, Identity, Registry};
use crate::usage::LastUsed;

/// Callback data carried by the delete confirmation buttons.
pub const CONFIRM_DELETE: &str = "confirm_delete";
pub const CANCEL_DELETE: &str = "cancel_delete";

/// Identities with a cached session or a running job.
struct InUse {
    sessions: SessionCache,
    jobs: JobRunner,
}

#[async_trait]
impl ActiveIdentities for InUse {
    async fn active_identity_ids(&self) -> HashSet<IdentityId> {
        let mut ids = self.sessions.active_identity_ids().await;
        ids.extend(self.jobs.active_identity_ids().await);
        ids
    }
}

/// Summary of the startup maintenance pass.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub migrated: usize,
    pub validation: ValidationReport,
    pub orphans: OrphanReport,
}

pub struct Bridge {
    pool: ClientPool,
    sessions: SessionCache,
    pairing: PairingCoordinator,
    reclaimer: Reclaimer,
    jobs: JobRunner,
    tickets: DeleteTickets,
    dispatcher: Dispatcher,
    transport: Arc<dyn Transport>,
}

impl Bridge {
    /// Open the master catalog under `config.storage` and build every
    /// component on top of it.
    pub async fn open(
        config: &Config,
        factory: Arc<dyn ClientFactory>,
        transport: Arc<dyn Transport>,
        activity: Arc<dyn ActivityLog>,
    ) -> BridgeResult<Self> {
        let busy_timeout = config.storage.busy_timeout();
        let registry = Registry::open(config.layout(), busy_timeout).await?;
        let app_stores = AppStores::new(config.session.rebuild_delay(), busy_timeout);
        let pool = ClientPool::new(
            registry,
            factory,
            app_stores.clone(),
            LastUsed::new(),
            config.pool.clone(),
        );
        let sessions = SessionCache::new(pool.clone(), app_stores);
        let pairing = PairingCoordinator::new(pool.clone(), config.pairing.clone());
        let jobs = JobRunner::new(pool.clone(), config.pool.call_timeout());
        let active = Arc::new(InUse {
            sessions: sessions.clone(),
            jobs: jobs.clone(),
        });
        let reclaimer = Reclaimer::new(
            pool.clone(),
            pairing.clone(),
            active,
            config.reclaim.clone(),
        );
        let dispatcher = Dispatcher::new(
            sessions.clone(),
            pool.clone(),
            Arc::clone(&transport),
            activity,
        );

        info!(
            root = %config.storage.root.display(),
            master = %pool.registry().layout().master_path().display(),
            "Bridge opened"
        );

        Ok(Self {
            pool,
            sessions,
            pairing,
            reclaimer,
            jobs,
            tickets: DeleteTickets::new(config.reclaim.ticket_ttl()),
            dispatcher,
            transport,
        })
    }

    pub fn register(&mut self, command: impl Into<String>, handler: Arc<dyn Handler>) {
        self.dispatcher.register(command, handler);
    }

    pub fn registry(&self) -> &Registry {
        self.pool.registry()
    }

    pub const fn pool(&self) -> &ClientPool {
        &self.pool
    }

    pub const fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub const fn pairing(&self) -> &PairingCoordinator {
        &self.pairing
    }

    pub const fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    pub const fn jobs(&self) -> &JobRunner {
        &self.jobs
    }

    pub const fn tickets(&self) -> &DeleteTickets {
        &self.tickets
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Import legacy catalogs, validate every row against the disk and drop
    /// orphaned store files.
    pub async fn startup(&self) -> BridgeResult<StartupReport> {
        let migrated = self.registry().migrate_from_legacy().await?;
        let validation = self.reclaimer.validate_startup().await?;
        let orphans = self.reclaimer.sweep_orphan_files().await?;
        info!(
            migrated,
            checked = validation.checked,
            relocated = validation.relocated.len(),
            deactivated = validation.deactivated.len(),
            logged_out = validation.logged_out.len(),
            orphans_deleted = orphans.deleted.len(),
            "Startup maintenance complete"
        );
        Ok(StartupReport {
            migrated,
            validation,
            orphans,
        })
    }

    /// Start the periodic reclaimer.
    pub fn spawn_reclaimer(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.reclaimer.clone().spawn(shutdown)
    }

    // =========================================================================
    // Sessions and dispatch
    // =========================================================================

    pub async fn resolve_session(&self, operator: OperatorId) -> BridgeResult<Option<Arc<Session>>> {
        self.sessions.resolve(operator).await
    }

    pub async fn dispatch(&self, event: OperatorEvent) -> BridgeResult<()> {
        self.dispatcher.dispatch(event).await
    }

    /// Run a bulk job with the operator's current identity.
    pub async fn spawn_job<T, F, Fut>(
        &self,
        operator: OperatorId,
        items: Vec<T>,
        delay: Duration,
        op: F,
    ) -> BridgeResult<JobHandle>
    where
        T: Display + Send + 'static,
        F: Fn(Arc<dyn WaClient>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ClientError>> + Send,
    {
        let session = self
            .sessions
            .resolve(operator)
            .await?
            .ok_or_else(|| BridgeError::forbidden("no paired identity"))?;
        Ok(self
            .jobs
            .spawn(operator, session.identity_id(), items, delay, op))
    }

    // =========================================================================
    // Pairing
    // =========================================================================

    /// Pair `raw_phone` and wait for the phone to confirm.
    ///
    /// The pairing code goes to the operator through the transport while
    /// this call blocks for up to the pairing timeout.
    pub async fn register_identity(
        &self,
        operator: OperatorId,
        raw_phone: &str,
    ) -> BridgeResult<Identity> {
        self.pairing.begin(operator).await;
        let code = self.pairing.submit_phone(operator, raw_phone).await?;
        send_code(self.transport.as_ref(), operator, &code).await?;

        let identity = self.pairing.await_confirmation(operator).await?;
        self.sessions.invalidate(operator).await;
        Ok(identity)
    }

    /// Request a pairing code and return it; confirmation is awaited on a
    /// worker task which reports the outcome through the transport.
    pub async fn start_pairing(
        &self,
        operator: OperatorId,
        raw_phone: &str,
    ) -> BridgeResult<PairingCode> {
        self.pairing.begin(operator).await;
        let code = self.pairing.submit_phone(operator, raw_phone).await?;

        let pairing = self.pairing.clone();
        let sessions = self.sessions.clone();
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let text = match pairing.await_confirmation(operator).await {
                Ok(identity) => {
                    sessions.invalidate(operator).await;
                    format!("WhatsApp +{} is now connected.", identity.phone)
                }
                Err(e) => {
                    warn!(operator, code = e.code(), error = %e, "Pairing did not complete");
                    e.user_reason().to_string()
                }
            };
            if let Err(e) = transport.send(operator, &text, None).await {
                warn!(operator, error = %e, "Failed to report pairing outcome");
            }
        });

        Ok(code)
    }

    pub async fn cancel_pairing(&self, operator: OperatorId) -> bool {
        self.pairing.cancel(operator).await
    }

    // =========================================================================
    // Identity management
    // =========================================================================

    pub async fn list_identities(&self, operator: OperatorId) -> BridgeResult<Vec<Identity>> {
        self.registry().list_by_owner(operator).await
    }

    /// Make `identity_id` the operator's current identity.
    pub async fn switch_current(
        &self,
        operator: OperatorId,
        identity_id: IdentityId,
    ) -> BridgeResult<Identity> {
        let identity = self.owned(operator, identity_id).await?;
        self.pool.set_current_for(operator, identity.id).await;
        self.sessions.invalidate(operator).await;
        info!(operator, identity_id, "Current identity switched");
        Ok(identity)
    }

    /// Destroy one of the operator's identities right away.
    pub async fn delete_identity(
        &self,
        operator: OperatorId,
        identity_id: IdentityId,
    ) -> BridgeResult<DestroyOutcome> {
        self.owned(operator, identity_id).await?;
        let outcome = self.pool.destroy(identity_id).await?;
        self.sessions.invalidate_identity(identity_id).await;
        info!(operator, identity_id, files = outcome.files_deleted, "Identity deleted");
        Ok(outcome)
    }

    /// Ask the operator to confirm deleting `identity_id`.
    pub async fn request_delete(
        &self,
        operator: OperatorId,
        identity_id: IdentityId,
    ) -> BridgeResult<DeleteTicket> {
        let identity = self.owned(operator, identity_id).await?;
        self.tickets.cleanup_expired();
        let ticket = self
            .tickets
            .issue(operator, identity.id, &identity.phone, None);

        let keyboard = Keyboard::row([
            ("Delete".to_string(), CONFIRM_DELETE.to_string()),
            ("Cancel".to_string(), CANCEL_DELETE.to_string()),
        ]);
        let text = format!(
            "Delete WhatsApp +{}? Its stored data will be removed.",
            identity.phone
        );
        match self.transport.send(operator, &text, Some(&keyboard)).await {
            Ok(handle) => {
                self.tickets.set_handle(operator, handle.clone());
                Ok(DeleteTicket {
                    ui_handle: Some(handle),
                    ..ticket
                })
            }
            Err(e) => {
                self.tickets.take(operator);
                Err(BridgeError::Transport(e.to_string()))
            }
        }
    }

    /// Carry out the pending delete.
    pub async fn confirm_delete(&self, operator: OperatorId) -> BridgeResult<DestroyOutcome> {
        let ticket = self
            .tickets
            .take(operator)
            .ok_or_else(|| BridgeError::NotFound("pending delete".to_string()))?;

        let result = self.delete_identity(operator, ticket.identity_id).await;
        let text = match &result {
            Ok(_) => format!("WhatsApp +{} deleted.", ticket.phone),
            Err(e) => e.user_reason().to_string(),
        };
        self.edit_prompt(operator, ticket.ui_handle.as_ref(), &text)
            .await;
        result
    }

    /// Drop the pending delete. Returns whether one existed.
    pub async fn cancel_delete(&self, operator: OperatorId) -> bool {
        let Some(ticket) = self.tickets.take(operator) else {
            return false;
        };
        self.edit_prompt(operator, ticket.ui_handle.as_ref(), "Delete cancelled.")
            .await;
        true
    }

    /// Destroy every identity of `operator` whose phone is not in `keep`.
    pub async fn prune_identities<S: AsRef<str>>(
        &self,
        operator: OperatorId,
        keep: &[S],
    ) -> BridgeResult<PruneReport> {
        let report = self.reclaimer.prune_to_phones(operator, keep).await?;
        if !report.deleted_phones.is_empty() {
            self.sessions.invalidate(operator).await;
        }
        Ok(report)
    }

    async fn owned(&self, operator: OperatorId, identity_id: IdentityId) -> BridgeResult<Identity> {
        let identity = self.registry().require(identity_id).await?;
        if identity.owner != operator {
            warn!(operator, identity_id, owner = identity.owner, "Cross-operator access refused");
            return Err(BridgeError::forbidden(format!(
                "identity {identity_id} belongs to another operator"
            )));
        }
        Ok(identity)
    }

    async fn edit_prompt(&self, operator: OperatorId, handle: Option<&UiHandle>, text: &str) {
        let Some(handle) = handle else {
            return;
        };
        if let Err(e) = self.transport.edit(operator, handle, text, None).await {
            warn!(operator, error = %e, "Failed to update delete prompt");
        }
    }
}

async fn send_code(
    transport: &dyn Transport,
    operator: OperatorId,
    code: &PairingCode,
) -> BridgeResult<()> {
    let text = format!(
        "Pairing code for +{}: {}\nOpen WhatsApp > Linked devices > Link with phone number.",
        code.phone, code.code
    );
    transport
        .send(operator, &text, None)
        .await
        .map(|_| ())
        .map_err(|e| BridgeError::Transport(e.to_string()))
}
