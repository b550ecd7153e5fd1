//! Shared database types and utilities.
//!
//! Provides `DatabaseError`, `unix_timestamp()` and the connect options used
//! for the master catalog and for per-identity stores. Every file opened here
//! uses journal mode `DELETE` so no `-wal`/`-shm` sidecars linger next to the
//! stores the reclaimer scans.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions,
};
use sqlx::{Pool, Sqlite};
use tracing::debug;

/// Minimum busy timeout applied to per-identity stores.
pub const MIN_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Database errors shared across the registry, app stores and device stores.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

fn base_options(path: &Path, create: bool) -> Result<SqliteConnectOptions, DatabaseError> {
    let mode = if create { "rwc" } else { "rw" };
    SqliteConnectOptions::from_str(&format!("sqlite:{}?mode={mode}", path.display()))
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

/// Connect options for the master catalog.
///
/// The catalog is opened per operation, so it keeps normal locking; only the
/// journal mode is pinned.
pub fn master_options(
    path: &Path,
    busy_timeout: Duration,
) -> Result<SqliteConnectOptions, DatabaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
    }
    Ok(base_options(path, true)?
        .journal_mode(SqliteJournalMode::Delete)
        .busy_timeout(busy_timeout))
}

/// Connect options for a per-identity store (protocol or app store).
///
/// Journal `DELETE`, shared cache, `EXCLUSIVE` locking and a busy timeout of
/// at least [`MIN_BUSY_TIMEOUT`] so concurrent bulk jobs queue up instead of
/// failing with "table is locked".
pub fn identity_store_options(
    path: &Path,
    busy_timeout: Duration,
    create: bool,
) -> Result<SqliteConnectOptions, DatabaseError> {
    if create && let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
    }
    Ok(base_options(path, create)?
        .journal_mode(SqliteJournalMode::Delete)
        .shared_cache(true)
        .locking_mode(SqliteLockingMode::Exclusive)
        .busy_timeout(busy_timeout.max(MIN_BUSY_TIMEOUT)))
}

/// Read-only options for inspecting a file that may not belong to us
/// (legacy catalog copies).
pub fn read_only_options(path: &Path) -> Result<SqliteConnectOptions, DatabaseError> {
    Ok(SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .map_err(|e| DatabaseError::Connection(e.to_string()))?
        .read_only(true))
}

/// Open a single-connection pool over a per-identity store.
///
/// `EXCLUSIVE` locking means a second connection from the same process would
/// block on the first, so the pool is capped at one connection.
pub async fn open_identity_pool(
    path: &Path,
    busy_timeout: Duration,
) -> Result<Pool<Sqlite>, DatabaseError> {
    let options = identity_store_options(path, busy_timeout, true)?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    debug!(path = %path.display(), "Identity store opened");
    Ok(pool)
}

/// Returns the current time as a Unix timestamp (seconds since epoch).
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
