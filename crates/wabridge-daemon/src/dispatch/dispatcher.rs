//! Routes operator events to handlers against the operator's own session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use wabridge_core::{ActivityLog, OperatorId, Transport, UiHandle};

use super::legacy::{self, CurrentClient};
use crate::error::{BridgeError, BridgeResult};
use crate::pool::ClientPool;
use crate::session::{Session, SessionCache};

/// Commands an operator without a usable identity may still run.
pub const UNPAIRED_WHITELIST: [&str; 5] =
    ["start_menu", "help", "pair", "login_info", "back_to_login"];

/// One inbound request from the transport.
#[derive(Debug, Clone)]
pub struct OperatorEvent {
    pub operator: OperatorId,
    pub command: String,
    pub args: Vec<String>,
    pub ui_handle: Option<UiHandle>,
}

impl OperatorEvent {
    pub fn new(operator: OperatorId, command: impl Into<String>) -> Self {
        Self {
            operator,
            command: command.into(),
            args: Vec::new(),
            ui_handle: None,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_handle(mut self, handle: UiHandle) -> Self {
        self.ui_handle = Some(handle);
        self
    }
}

/// What a handler is given.
pub struct HandlerContext {
    pub event: OperatorEvent,
    /// `None` only for whitelisted commands from unpaired operators.
    pub session: Option<Arc<Session>>,
    pub transport: Arc<dyn Transport>,
}

impl HandlerContext {
    pub const fn operator(&self) -> OperatorId {
        self.event.operator
    }

    /// The session, or `Forbidden` when the operator has none.
    pub fn session(&self) -> BridgeResult<&Arc<Session>> {
        self.session
            .as_ref()
            .ok_or_else(|| BridgeError::forbidden("no paired identity"))
    }
}

/// A command implementation.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> BridgeResult<()>;
}

/// Registry of handlers keyed by command name.
pub struct Dispatcher {
    sessions: SessionCache,
    pool: ClientPool,
    transport: Arc<dyn Transport>,
    activity: Arc<dyn ActivityLog>,
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Dispatcher {
    pub fn new(
        sessions: SessionCache,
        pool: ClientPool,
        transport: Arc<dyn Transport>,
        activity: Arc<dyn ActivityLog>,
    ) -> Self {
        Self {
            sessions,
            pool,
            transport,
            activity,
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, command: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(command.into(), handler);
    }

    pub fn is_whitelisted(command: &str) -> bool {
        UNPAIRED_WHITELIST.contains(&command)
    }

    /// Dispatch one event.
    ///
    /// Failures are also reported to the operator through the transport, with
    /// the error's user-facing reason.
    pub async fn dispatch(&self, event: OperatorEvent) -> BridgeResult<()> {
        let operator = event.operator;
        let command = event.command.clone();

        let result = self.route(event).await;
        match &result {
            Ok(()) => {
                self.activity
                    .record(&command, "dispatched", operator, true)
                    .await;
            }
            Err(e) => {
                warn!(operator, command = %command, code = e.code(), error = %e, "Dispatch failed");
                self.activity
                    .record(&command, &e.to_string(), operator, false)
                    .await;
                if let Err(send_err) = self.transport.send(operator, e.user_reason(), None).await {
                    warn!(operator, error = %send_err, "Failed to report error to operator");
                }
            }
        }
        result
    }

    async fn route(&self, event: OperatorEvent) -> BridgeResult<()> {
        let operator = event.operator;

        let handler = self
            .handlers
            .get(&event.command)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("command {}", event.command)))?;

        let whitelisted = Self::is_whitelisted(&event.command);
        let session = match self.sessions.resolve(operator).await {
            Ok(Some(session)) => Some(session),
            Ok(None) if whitelisted => None,
            Ok(None) => {
                return Err(BridgeError::forbidden(format!(
                    "command {} requires a paired identity",
                    event.command
                )));
            }
            // The login flow stays reachable whatever state the line is in.
            Err(e) if whitelisted => {
                debug!(
                    operator,
                    command = %event.command,
                    code = e.code(),
                    "Session unavailable, dispatching without one"
                );
                None
            }
            Err(e) => return Err(e),
        };

        let current = session.as_ref().map(|s| CurrentClient {
            identity_id: s.identity_id(),
            client: s.client(),
        });
        if let Some(session) = &session {
            self.pool.last_used().touch(session.identity_id());
            debug!(operator, identity_id = session.identity_id(), command = %event.command, "Dispatching");
        } else {
            info!(operator, command = %event.command, "Dispatching for unpaired operator");
        }

        let ctx = HandlerContext {
            event,
            session,
            transport: Arc::clone(&self.transport),
        };
        legacy::scope(current, handler.handle(ctx)).await
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_covers_login_flow_only() {
        for command in ["start_menu", "help", "pair", "login_info", "back_to_login"] {
            assert!(Dispatcher::is_whitelisted(command));
        }
        for command in ["broadcast", "delete_account", "list_groups", ""] {
            assert!(!Dispatcher::is_whitelisted(command));
        }
    }

    #[test]
    fn event_builder() {
        let event = OperatorEvent::new(555, "pair")
            .with_args(["628111"])
            .with_handle(UiHandle("msg-1".into()));
        assert_eq!(event.args, vec!["628111".to_string()]);
        assert_eq!(event.ui_handle, Some(UiHandle("msg-1".into())));
    }
}
