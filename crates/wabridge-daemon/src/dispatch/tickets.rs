//! Delete-confirmation tickets.
//!
//! A ticket is issued when an operator asks to delete an identity and is
//! consumed by the next confirm or cancel. Expired tickets disappear silently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use wabridge_core::{IdentityId, OperatorId, UiHandle};

/// Pending delete awaiting the operator's confirmation.
#[derive(Debug, Clone)]
pub struct DeleteTicket {
    pub identity_id: IdentityId,
    pub phone: String,
    /// Message carrying the confirm/cancel buttons.
    pub ui_handle: Option<UiHandle>,
    pub expires_at: Instant,
}

impl DeleteTicket {
    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// One ticket per operator.
#[derive(Debug, Clone)]
pub struct DeleteTickets {
    tickets: Arc<Mutex<HashMap<OperatorId, DeleteTicket>>>,
    ttl: Duration,
}

impl DeleteTickets {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tickets: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Issue a ticket, replacing any previous one for `operator`.
    pub fn issue(
        &self,
        operator: OperatorId,
        identity_id: IdentityId,
        phone: &str,
        ui_handle: Option<UiHandle>,
    ) -> DeleteTicket {
        let ticket = DeleteTicket {
            identity_id,
            phone: phone.to_string(),
            ui_handle,
            expires_at: Instant::now() + self.ttl,
        };
        self.tickets.lock().insert(operator, ticket.clone());
        debug!(operator, identity_id, "Delete ticket issued");
        ticket
    }

    /// Attach the message handle once the confirmation prompt is sent.
    pub fn set_handle(&self, operator: OperatorId, handle: UiHandle) {
        if let Some(ticket) = self.tickets.lock().get_mut(&operator) {
            ticket.ui_handle = Some(handle);
        }
    }

    /// Consume the operator's ticket. Expired tickets read as absent.
    pub fn take(&self, operator: OperatorId) -> Option<DeleteTicket> {
        let ticket = self.tickets.lock().remove(&operator)?;
        if ticket.is_expired() {
            debug!(operator, identity_id = ticket.identity_id, "Delete ticket expired");
            return None;
        }
        Some(ticket)
    }

    pub fn peek(&self, operator: OperatorId) -> Option<DeleteTicket> {
        self.tickets
            .lock()
            .get(&operator)
            .filter(|t| !t.is_expired())
            .cloned()
    }

    /// Drop expired tickets. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut tickets = self.tickets.lock();
        let before = tickets.len();
        tickets.retain(|_, t| !t.is_expired());
        before - tickets.len()
    }
}
