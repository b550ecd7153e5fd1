//! Pairing state.

use std::sync::Arc;

use wabridge_core::WaClient;
use wabridge_core::layout::IdentityPaths;

/// Where an operator is in the pairing flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    AwaitPhone,
    AwaitConfirmation,
}

/// In-flight pairing of one operator.
pub(crate) struct PairingState {
    pub phase: PairingPhase,
    pub phone: Option<String>,
    /// Throw-away client, not pooled until the phone confirms.
    pub client: Option<Arc<dyn WaClient>>,
    pub paths: Option<IdentityPaths>,
    /// Bumped on every reset so a stale confirmation poller can tell.
    pub attempt: u64,
}

impl PairingState {
    pub fn new(attempt: u64) -> Self {
        Self {
            phase: PairingPhase::AwaitPhone,
            phone: None,
            client: None,
            paths: None,
            attempt,
        }
    }
}

/// Pairing code handed to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCode {
    pub phone: String,
    pub code: String,
}
