//! Error kinds surfaced by the session manager.

use wabridge_core::db::DatabaseError;
use wabridge_core::{ClientError, IdentityId, OperatorId};

/// Result type alias using [`BridgeError`].
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Closed set of failures the bridge reports to handlers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Ownership mismatch, cross-tenant access, or a non-whitelisted command
    /// from an unpaired operator.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The device store exists but carries no pairing id.
    #[error("identity {identity_id} is logged out")]
    LoggedOut { identity_id: IdentityId },

    #[error("phone {phone} is already paired for operator {owner}")]
    Duplicate { owner: OperatorId, phone: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Invalid(String),
}

impl BridgeError {
    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Forbidden(_) => "EFORBIDDEN",
            Self::LoggedOut { .. } => "ELOGGEDOUT",
            Self::Duplicate { .. } => "EDUPLICATE",
            Self::Timeout(_) => "ETIMEOUT",
            Self::Transport(_) => "ETRANSPORT",
            Self::Storage(_) => "ESTORAGE",
            Self::NotFound(_) => "ENOTFOUND",
            Self::Invalid(_) => "EINVALID",
        }
    }

    /// Reason shown to the operator. Each kind has its own wording.
    pub const fn user_reason(&self) -> &'static str {
        match self {
            Self::Forbidden(_) => "access denied",
            Self::LoggedOut { .. } => "this WhatsApp line was logged out, please pair it again",
            Self::Duplicate { .. } => "this phone number is already paired",
            Self::Timeout(_) => "the operation timed out",
            Self::Transport(_) => "WhatsApp is unreachable right now",
            Self::Storage(_) => "storage is temporarily unavailable",
            Self::NotFound(_) => "not found",
            Self::Invalid(_) => "invalid phone number",
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }
}

impl From<DatabaseError> for BridgeError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<ClientError> for BridgeError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Timeout => Self::Timeout("client call".to_string()),
            ClientError::Store(message) => Self::Storage(message),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<wabridge_core::Error> for BridgeError {
    fn from(e: wabridge_core::Error) -> Self {
        match e {
            wabridge_core::Error::InvalidPhone { phone, reason } => {
                Self::Invalid(format!("{phone:?}: {reason}"))
            }
            wabridge_core::Error::Io(io) => Self::Storage(io.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}
