//! Outbound ports: operator transport and activity log.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::OperatorId;

/// Opaque handle to a message previously sent to an operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UiHandle(pub String);

/// Inline keyboard rows attached to an outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
    /// Rows of `(label, callback)` buttons.
    pub rows: Vec<Vec<(String, String)>>,
}

impl Keyboard {
    /// Single-row keyboard.
    pub fn row(buttons: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            rows: vec![buttons.into_iter().collect()],
        }
    }
}

/// Error returned by a transport implementation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Bot transport used to reach operators.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        operator: OperatorId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<UiHandle, TransportError>;

    async fn edit(
        &self,
        operator: OperatorId,
        handle: &UiHandle,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TransportError>;
}

/// Records operator-visible actions. No persistence contract.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn record(&self, action: &str, description: &str, operator: OperatorId, success: bool);
}

/// Activity log that writes to the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLog;

#[async_trait]
impl ActivityLog for TracingActivityLog {
    async fn record(&self, action: &str, description: &str, operator: OperatorId, success: bool) {
        if success {
            info!(target: "wabridge::activity", operator, action, description, "Activity");
        } else {
            warn!(target: "wabridge::activity", operator, action, description, "Activity failed");
        }
    }
}
