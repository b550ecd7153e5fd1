//! Interactive phone-code pairing.
//!
//! An operator submits a phone number, gets a pairing code from a throw-away
//! client and types it on the phone. Once the client reports a pairing id the
//! identity is catalogued and the client moves into the pool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use wabridge_core::config::PairingConfig;
use wabridge_core::layout::{IdentityPaths, remove_file_group};
use wabridge_core::{DeviceDescriptor, OperatorId, WaClient, phone};

use super::types::{PairingCode, PairingPhase, PairingState};
use crate::error::{BridgeError, BridgeResult};
use crate::pool::{ClientPool, connect_within};
use crate::storage::Identity;

/// Poll interval while waiting for the pairing client's socket.
const CONNECT_POLL: std::time::Duration = std::time::Duration::from_millis(250);

/// Per-operator pairing state machine.
#[derive(Clone)]
pub struct PairingCoordinator {
    pool: ClientPool,
    config: PairingConfig,
    states: Arc<RwLock<HashMap<OperatorId, PairingState>>>,
    attempts: Arc<AtomicU64>,
}

impl PairingCoordinator {
    pub fn new(pool: ClientPool, config: PairingConfig) -> Self {
        Self {
            pool,
            config,
            states: Arc::new(RwLock::new(HashMap::new())),
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub const fn config(&self) -> &PairingConfig {
        &self.config
    }

    fn next_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Start (or restart) pairing for `operator`.
    pub async fn begin(&self, operator: OperatorId) -> PairingPhase {
        let previous = self
            .states
            .write()
            .await
            .insert(operator, PairingState::new(self.next_attempt()));
        if let Some(previous) = previous {
            discard(previous).await;
        }
        debug!(operator, "Pairing started");
        PairingPhase::AwaitPhone
    }

    pub async fn phase(&self, operator: OperatorId) -> Option<PairingPhase> {
        self.states.read().await.get(&operator).map(|s| s.phase)
    }

    /// Store paths of every pairing in flight.
    pub async fn in_flight_paths(&self) -> Vec<PathBuf> {
        self.states
            .read()
            .await
            .values()
            .filter_map(|state| state.paths.as_ref())
            .flat_map(|paths| [paths.protocol_store.clone(), paths.app_store.clone()])
            .collect()
    }

    /// Validate `raw_phone`, connect a fresh client and request a pairing
    /// code for it.
    ///
    /// Invalid or already paired phones leave the operator at
    /// [`PairingPhase::AwaitPhone`]. Websocket, timeout and disconnect errors
    /// from the code request are retried with linear backoff.
    pub async fn submit_phone(
        &self,
        operator: OperatorId,
        raw_phone: &str,
    ) -> BridgeResult<PairingCode> {
        if self.phase(operator).await != Some(PairingPhase::AwaitPhone) {
            self.begin(operator).await;
        }

        let phone = phone::validate(raw_phone)?;

        let registry = self.pool.registry();
        if registry.find_by_phone(operator, &phone).await?.is_some() {
            self.begin(operator).await;
            return Err(BridgeError::Duplicate { owner: operator, phone });
        }

        let paths = registry.layout().identity_paths(operator, &phone);
        let attempt = {
            let mut states = self.states.write().await;
            let state = states
                .entry(operator)
                .or_insert_with(|| PairingState::new(self.next_attempt()));
            state.phone = Some(phone.clone());
            state.paths = Some(paths.clone());
            state.attempt
        };

        match self.request_code(&phone, &paths).await {
            Ok((client, code)) => {
                let mut states = self.states.write().await;
                match states.get_mut(&operator) {
                    Some(state) if state.attempt == attempt => {
                        state.phase = PairingPhase::AwaitConfirmation;
                        state.client = Some(client);
                    }
                    _ => {
                        drop(states);
                        client.disconnect().await;
                        remove_file_group(&paths.protocol_store);
                        return Err(BridgeError::Invalid("pairing was cancelled".to_string()));
                    }
                }
                drop(states);
                info!(operator, phone = %phone, "Pairing code issued");
                Ok(PairingCode { phone, code })
            }
            Err(e) => {
                self.reset(operator, attempt, false).await;
                warn!(operator, phone = %phone, error = %e, "Pairing code request failed");
                Err(e)
            }
        }
    }

    async fn request_code(
        &self,
        phone: &str,
        paths: &IdentityPaths,
    ) -> BridgeResult<(Arc<dyn WaClient>, String)> {
        let factory = self.pool.factory();
        let store = factory.open_store(&paths.protocol_store).await?;
        let device = store.first_device().await?;
        let client = factory.build(device);

        if let Err(e) = connect_within(&client, self.config.connect_timeout(), CONNECT_POLL).await {
            client.disconnect().await;
            return Err(e);
        }

        let mut attempt = 1;
        loop {
            match client.pair_phone(phone, DeviceDescriptor::ChromeWindows).await {
                Ok(code) => return Ok((client, code)),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let backoff = self.config.backoff(attempt);
                    warn!(phone, attempt, error = %e, ?backoff, "Pairing code request failed, retrying");
                    sleep(backoff).await;
                    if !client.is_connected()
                        && let Err(e) = client.connect().await
                    {
                        debug!(phone, error = %e, "Reconnect before retry failed");
                    }
                    attempt += 1;
                }
                Err(e) => {
                    client.disconnect().await;
                    return Err(e.into());
                }
            }
        }
    }

    /// Wait for the phone to confirm the code.
    ///
    /// On success the identity is catalogued, its client adopted by the pool
    /// and, when it is the operator's first identity, made current. On
    /// timeout the client and its half-created store are discarded.
    pub async fn await_confirmation(&self, operator: OperatorId) -> BridgeResult<Identity> {
        let (client, phone, paths, attempt) = {
            let states = self.states.read().await;
            match states.get(&operator) {
                Some(PairingState {
                    phase: PairingPhase::AwaitConfirmation,
                    client: Some(client),
                    phone: Some(phone),
                    paths: Some(paths),
                    attempt,
                    ..
                }) => (Arc::clone(client), phone.clone(), paths.clone(), *attempt),
                _ => {
                    return Err(BridgeError::Invalid(
                        "no pairing awaiting confirmation".to_string(),
                    ));
                }
            }
        };

        let poll = self.config.poll_interval();
        let watched = Arc::clone(&client);
        let confirmed = timeout(self.config.timeout(), async {
            loop {
                if watched.has_paired_id() {
                    return true;
                }
                if !self.is_attempt(operator, attempt).await {
                    return false;
                }
                sleep(poll).await;
            }
        })
        .await;

        match confirmed {
            Ok(true) => self.complete(operator, attempt, client, &phone, &paths).await,
            Ok(false) => Err(BridgeError::Invalid("pairing was cancelled".to_string())),
            Err(_) => {
                self.reset(operator, attempt, true).await;
                warn!(operator, phone = %phone, "Pairing not confirmed in time");
                Err(BridgeError::Timeout(format!(
                    "pairing of {phone} not confirmed within {}s",
                    self.config.timeout().as_secs()
                )))
            }
        }
    }

    async fn complete(
        &self,
        operator: OperatorId,
        attempt: u64,
        client: Arc<dyn WaClient>,
        phone: &str,
        paths: &IdentityPaths,
    ) -> BridgeResult<Identity> {
        let registry = self.pool.registry();
        let had_identity = registry.get_by_owner(operator).await?.is_some();

        let identity = match registry
            .insert(phone, &paths.protocol_store, &paths.app_store, operator)
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                // The store path is shared with any existing row for this
                // phone, so files are only removed when nothing was inserted
                // by someone else.
                let keep_files = matches!(e, BridgeError::Duplicate { .. });
                self.forget(operator, attempt).await;
                client.disconnect().await;
                if !keep_files {
                    remove_file_group(&paths.protocol_store);
                }
                return Err(e);
            }
        };

        self.forget(operator, attempt).await;
        self.pool.adopt(identity.id, client).await?;
        if !had_identity {
            self.pool.set_current_for(operator, identity.id).await;
        }

        info!(operator, identity_id = identity.id, phone, "Pairing confirmed");
        Ok(identity)
    }

    /// Abort pairing for `operator`. Returns whether anything was in flight.
    pub async fn cancel(&self, operator: OperatorId) -> bool {
        let removed = self.states.write().await.remove(&operator);
        match removed {
            Some(state) => {
                discard(state).await;
                info!(operator, "Pairing cancelled");
                true
            }
            None => false,
        }
    }

    async fn is_attempt(&self, operator: OperatorId, attempt: u64) -> bool {
        self.states
            .read()
            .await
            .get(&operator)
            .is_some_and(|s| s.attempt == attempt)
    }

    /// Drop the state of `attempt` without touching its client or files.
    async fn forget(&self, operator: OperatorId, attempt: u64) {
        let mut states = self.states.write().await;
        if states.get(&operator).is_some_and(|s| s.attempt == attempt) {
            states.remove(&operator);
        }
    }

    /// Discard `attempt`, either removing the operator's state or putting
    /// them back at [`PairingPhase::AwaitPhone`].
    async fn reset(&self, operator: OperatorId, attempt: u64, remove: bool) {
        let previous = {
            let mut states = self.states.write().await;
            if !states.get(&operator).is_some_and(|s| s.attempt == attempt) {
                return;
            }
            if remove {
                states.remove(&operator)
            } else {
                states.insert(operator, PairingState::new(self.next_attempt()))
            }
        };
        if let Some(previous) = previous {
            discard(previous).await;
        }
    }
}

/// Disconnect the pairing client and remove the half-created protocol store.
async fn discard(state: PairingState) {
    if let Some(client) = state.client {
        client.disconnect().await;
    }
    if let Some(paths) = state.paths {
        let removed = remove_file_group(&paths.protocol_store);
        if removed > 0 {
            debug!(path = %paths.protocol_store.display(), removed, "Half-created store removed");
        }
    }
}
