//! Catalog models.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use wabridge_core::layout::parse_owner;
use wabridge_core::{IdentityId, OperatorId};

use crate::error::BridgeError;

/// Raw `whatsapp_accounts` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IdentityRow {
    pub id: i64,
    pub phone_number: String,
    pub owner_id: i64,
    pub db_path: String,
    pub bot_data_db_path: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Identity status column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    Active,
    Inactive,
}

impl IdentityStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    /// Unknown values read back as inactive.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("active") {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

impl std::fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A paired WhatsApp line owned by one operator.
///
/// Pure data: the live client for an identity lives in the client pool and is
/// joined by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub phone: String,
    pub owner: OperatorId,
    pub protocol_store_path: PathBuf,
    pub app_store_path: PathBuf,
    pub status: IdentityStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Identity {
    pub fn is_owned_by(&self, operator: OperatorId) -> bool {
        self.owner == operator
    }
}

impl TryFrom<IdentityRow> for Identity {
    type Error = BridgeError;

    /// Converts a row, rejecting it when the owner encoded in the app store
    /// path disagrees with the owner column.
    fn try_from(row: IdentityRow) -> Result<Self, Self::Error> {
        let app_store_path = PathBuf::from(&row.bot_data_db_path);
        match parse_owner(&app_store_path) {
            Some(encoded) if encoded == row.owner_id => Ok(Self {
                id: row.id,
                phone: row.phone_number,
                owner: row.owner_id,
                protocol_store_path: PathBuf::from(row.db_path),
                app_store_path,
                status: IdentityStatus::parse(&row.status),
                created_at: row.created_at,
                updated_at: row.updated_at,
            }),
            Some(encoded) => Err(BridgeError::forbidden(format!(
                "identity {} path encodes owner {encoded}, row says {}",
                row.id, row.owner_id
            ))),
            None => Err(BridgeError::forbidden(format!(
                "identity {} app store path {} does not encode an owner",
                row.id, row.bot_data_db_path
            ))),
        }
    }
}
