//! Identity registry backed by the master catalog.
//!
//! The catalog is opened per operation; no connection is held between calls.
//! Every row read back is revalidated against the owner encoded in its app
//! store path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use wabridge_core::db::{DatabaseError, master_options, unix_timestamp};
use wabridge_core::layout::parse_owner;
use wabridge_core::{IdentityId, OperatorId, StorageLayout, phone};

use super::alloc::smallest_free_id;
use super::models::{Identity, IdentityRow, IdentityStatus};
use crate::error::{BridgeError, BridgeResult};

pub(super) const CREATE_ACCOUNTS: &str = r"
    CREATE TABLE IF NOT EXISTS whatsapp_accounts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        phone_number TEXT NOT NULL,
        owner_id INTEGER NOT NULL,
        db_path TEXT NOT NULL,
        bot_data_db_path TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (owner_id, phone_number)
    )
";

/// Columns of a pre-`owner_id` catalog, timestamps coerced to unix seconds
/// whether they were stored as integers or as `DATETIME` text.
pub(super) const LEGACY_SELECT: &str = r"
    SELECT id, phone_number, db_path, bot_data_db_path,
           COALESCE(status, 'active') AS status,
           COALESCE(CASE typeof(created_at)
               WHEN 'integer' THEN created_at
               WHEN 'text' THEN CAST(strftime('%s', created_at) AS INTEGER)
           END, 0) AS created_at,
           COALESCE(CASE typeof(updated_at)
               WHEN 'integer' THEN updated_at
               WHEN 'text' THEN CAST(strftime('%s', updated_at) AS INTEGER)
           END, 0) AS updated_at
    FROM {table}
";

const SYNC_SEQUENCE: &str = "UPDATE sqlite_sequence SET seq = (SELECT COALESCE(MAX(id), 0) FROM whatsapp_accounts) WHERE name = 'whatsapp_accounts'";

const SEED_SEQUENCE: &str = "INSERT INTO sqlite_sequence (name, seq) SELECT 'whatsapp_accounts', COALESCE(MAX(id), 0) FROM whatsapp_accounts";

/// Row of a catalog written before the `owner_id` column existed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct LegacyRow {
    pub id: i64,
    pub phone_number: String,
    pub db_path: String,
    pub bot_data_db_path: String,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Durable catalog of paired identities.
#[derive(Clone)]
pub struct Registry {
    options: SqliteConnectOptions,
    layout: Arc<StorageLayout>,
    pub(super) migrate_lock: Arc<Mutex<()>>,
}

impl Registry {
    /// Open the master catalog described by `layout`, creating or upgrading
    /// the schema as needed.
    pub async fn open(layout: StorageLayout, busy_timeout: Duration) -> Result<Self, DatabaseError> {
        let options = master_options(layout.master_path(), busy_timeout)?;
        let registry = Self {
            options,
            layout: Arc::new(layout),
            migrate_lock: Arc::new(Mutex::new(())),
        };
        registry.ensure_schema().await?;
        info!(path = %registry.layout.master_path().display(), "Identity registry opened");
        Ok(registry)
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub(super) async fn connect(&self) -> Result<SqliteConnection, DatabaseError> {
        SqliteConnection::connect_with(&self.options)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))
    }

    async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        let mut conn = self.connect().await?;

        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('whatsapp_accounts')")
                .fetch_all(&mut conn)
                .await?;

        if !columns.is_empty() && !columns.iter().any(|c| c == "owner_id") {
            upgrade_legacy_schema(&mut conn).await?;
        } else {
            sqlx::query(CREATE_ACCOUNTS)
                .execute(&mut conn)
                .await
                .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        }

        let _ = conn.close().await;
        debug!("Registry schema ready");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Every valid row, ordered by id. Rows failing the ownership check are
    /// skipped and logged.
    pub async fn list_all(&self) -> BridgeResult<Vec<Identity>> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query_as::<_, IdentityRow>("SELECT * FROM whatsapp_accounts ORDER BY id")
            .fetch_all(&mut conn)
            .await?;
        let _ = conn.close().await;
        Ok(valid_identities(rows))
    }

    /// Rows owned by `owner` whose path encoding agrees.
    pub async fn list_by_owner(&self, owner: OperatorId) -> BridgeResult<Vec<Identity>> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query_as::<_, IdentityRow>(
            "SELECT * FROM whatsapp_accounts WHERE owner_id = ? ORDER BY id",
        )
        .bind(owner)
        .fetch_all(&mut conn)
        .await?;
        let _ = conn.close().await;
        Ok(valid_identities(rows))
    }

    /// Look up one identity. A row that fails the ownership check is
    /// `Forbidden`, never silently returned.
    pub async fn get(&self, id: IdentityId) -> BridgeResult<Option<Identity>> {
        let mut conn = self.connect().await?;
        let row =
            sqlx::query_as::<_, IdentityRow>("SELECT * FROM whatsapp_accounts WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut conn)
                .await?;
        let _ = conn.close().await;
        row.map(Identity::try_from).transpose()
    }

    /// Like [`Registry::get`], but a missing row is `NotFound`.
    pub async fn require(&self, id: IdentityId) -> BridgeResult<Identity> {
        self.get(id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("identity {id}")))
    }

    /// The operator's first identity (lowest id).
    pub async fn get_by_owner(&self, owner: OperatorId) -> BridgeResult<Option<Identity>> {
        Ok(self.list_by_owner(owner).await?.into_iter().next())
    }

    /// Identity with `phone` (normalised) under `owner`.
    pub async fn find_by_phone(
        &self,
        owner: OperatorId,
        raw_phone: &str,
    ) -> BridgeResult<Option<Identity>> {
        let phone = phone::normalize(raw_phone);
        let mut conn = self.connect().await?;
        let row = sqlx::query_as::<_, IdentityRow>(
            "SELECT * FROM whatsapp_accounts WHERE owner_id = ? AND phone_number = ?",
        )
        .bind(owner)
        .bind(&phone)
        .fetch_optional(&mut conn)
        .await?;
        let _ = conn.close().await;
        row.map(Identity::try_from).transpose()
    }

    /// All ids, ascending.
    pub async fn ids(&self) -> BridgeResult<Vec<IdentityId>> {
        let mut conn = self.connect().await?;
        let ids = sqlx::query_scalar("SELECT id FROM whatsapp_accounts ORDER BY id")
            .fetch_all(&mut conn)
            .await?;
        let _ = conn.close().await;
        Ok(ids)
    }

    /// Store paths of every row, ownership unchecked.
    ///
    /// The orphan sweep must keep the files of rows that fail validation too.
    pub async fn catalog_paths(&self) -> BridgeResult<Vec<PathBuf>> {
        let mut conn = self.connect().await?;
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT db_path, bot_data_db_path FROM whatsapp_accounts")
                .fetch_all(&mut conn)
                .await?;
        let _ = conn.close().await;
        Ok(rows
            .into_iter()
            .flat_map(|(protocol, app)| [PathBuf::from(protocol), PathBuf::from(app)])
            .collect())
    }

    /// Current `sqlite_sequence` value for the catalog table.
    pub async fn sequence_value(&self) -> BridgeResult<Option<i64>> {
        let mut conn = self.connect().await?;
        let seq = sqlx::query_scalar(
            "SELECT seq FROM sqlite_sequence WHERE name = 'whatsapp_accounts'",
        )
        .fetch_optional(&mut conn)
        .await?;
        let _ = conn.close().await;
        Ok(seq)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Catalog a newly paired identity.
    ///
    /// The phone is normalised, the app store path must encode `owner`, and
    /// `(owner, phone)` must be new. The row gets the smallest free id; the
    /// autoincrement sequence is then pulled back to `MAX(id)`.
    pub async fn insert(
        &self,
        raw_phone: &str,
        protocol_path: &Path,
        app_path: &Path,
        owner: OperatorId,
    ) -> BridgeResult<Identity> {
        let phone = phone::normalize(raw_phone);
        if phone.is_empty() {
            return Err(BridgeError::Invalid("empty phone".to_string()));
        }
        check_path_owner(app_path, owner)?;

        let mut conn = self.connect().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut conn).await?;

        match insert_row(&mut conn, &phone, protocol_path, app_path, owner).await {
            Ok(id) => {
                sqlx::query("COMMIT").execute(&mut conn).await?;
                let _ = conn.close().await;
                info!(identity_id = id, owner, phone = %phone, "Identity catalogued");
                self.require(id).await
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut conn).await;
                let _ = conn.close().await;
                Err(e)
            }
        }
    }

    /// Set the status column.
    pub async fn update_status(&self, id: IdentityId, status: IdentityStatus) -> BridgeResult<()> {
        let mut conn = self.connect().await?;
        let result =
            sqlx::query("UPDATE whatsapp_accounts SET status = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(unix_timestamp())
                .bind(id)
                .execute(&mut conn)
                .await?;
        let _ = conn.close().await;

        if result.rows_affected() == 0 {
            return Err(BridgeError::NotFound(format!("identity {id}")));
        }
        debug!(identity_id = id, %status, "Identity status updated");
        Ok(())
    }

    /// Rewrite both store paths. The new app store path must still encode the
    /// row's owner.
    pub async fn update_paths(
        &self,
        id: IdentityId,
        protocol_path: &Path,
        app_path: &Path,
    ) -> BridgeResult<()> {
        let current = self.require(id).await?;
        check_path_owner(app_path, current.owner)?;

        let mut conn = self.connect().await?;
        sqlx::query(
            "UPDATE whatsapp_accounts SET db_path = ?, bot_data_db_path = ?, updated_at = ? WHERE id = ?",
        )
        .bind(protocol_path.to_string_lossy().as_ref())
        .bind(app_path.to_string_lossy().as_ref())
        .bind(unix_timestamp())
        .bind(id)
        .execute(&mut conn)
        .await?;
        let _ = conn.close().await;

        info!(identity_id = id, protocol = %protocol_path.display(), "Identity paths updated");
        Ok(())
    }

    /// Bump `updated_at`.
    pub async fn touch(&self, id: IdentityId) -> BridgeResult<()> {
        let mut conn = self.connect().await?;
        let result = sqlx::query("UPDATE whatsapp_accounts SET updated_at = ? WHERE id = ?")
            .bind(unix_timestamp())
            .bind(id)
            .execute(&mut conn)
            .await?;
        let _ = conn.close().await;

        if result.rows_affected() == 0 {
            return Err(BridgeError::NotFound(format!("identity {id}")));
        }
        Ok(())
    }

    /// Remove a row. Files are left to the caller.
    pub async fn delete(&self, id: IdentityId) -> BridgeResult<()> {
        let mut conn = self.connect().await?;
        let result = sqlx::query("DELETE FROM whatsapp_accounts WHERE id = ?")
            .bind(id)
            .execute(&mut conn)
            .await?;
        let _ = conn.close().await;

        if result.rows_affected() == 0 {
            return Err(BridgeError::NotFound(format!("identity {id}")));
        }
        info!(identity_id = id, "Identity removed from catalog");
        Ok(())
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    pub(crate) async fn force_owner_column(&self, id: IdentityId, owner: OperatorId) {
        let mut conn = self.connect().await.unwrap();
        sqlx::query("UPDATE whatsapp_accounts SET owner_id = ? WHERE id = ?")
            .bind(owner)
            .bind(id)
            .execute(&mut conn)
            .await
            .unwrap();
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    pub(crate) async fn force_updated_at(&self, id: IdentityId, updated_at: i64) {
        let mut conn = self.connect().await.unwrap();
        sqlx::query("UPDATE whatsapp_accounts SET updated_at = ? WHERE id = ?")
            .bind(updated_at)
            .bind(id)
            .execute(&mut conn)
            .await
            .unwrap();
    }
}

fn check_path_owner(app_path: &Path, owner: OperatorId) -> BridgeResult<()> {
    match parse_owner(app_path) {
        Some(encoded) if encoded == owner => Ok(()),
        Some(encoded) => Err(BridgeError::forbidden(format!(
            "app store {} belongs to operator {encoded}, not {owner}",
            app_path.display()
        ))),
        None => Err(BridgeError::forbidden(format!(
            "app store {} does not encode an owner",
            app_path.display()
        ))),
    }
}

fn valid_identities(rows: Vec<IdentityRow>) -> Vec<Identity> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id;
            match Identity::try_from(row) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!(identity_id = id, error = %e, "Skipping catalog row with bad ownership");
                    None
                }
            }
        })
        .collect()
}

async fn insert_row(
    conn: &mut SqliteConnection,
    phone: &str,
    protocol_path: &Path,
    app_path: &Path,
    owner: OperatorId,
) -> BridgeResult<IdentityId> {
    let existing: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM whatsapp_accounts WHERE owner_id = ? AND phone_number = ?",
    )
    .bind(owner)
    .bind(phone)
    .fetch_optional(&mut *conn)
    .await?;
    if existing.is_some() {
        return Err(BridgeError::Duplicate {
            owner,
            phone: phone.to_string(),
        });
    }

    let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM whatsapp_accounts ORDER BY id")
        .fetch_all(&mut *conn)
        .await?;
    let id = smallest_free_id(&ids);
    let now = unix_timestamp();

    sqlx::query(
        r"
        INSERT INTO whatsapp_accounts
            (id, phone_number, owner_id, db_path, bot_data_db_path, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(id)
    .bind(phone)
    .bind(owner)
    .bind(protocol_path.to_string_lossy().as_ref())
    .bind(app_path.to_string_lossy().as_ref())
    .bind(IdentityStatus::Active.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => BridgeError::Duplicate {
            owner,
            phone: phone.to_string(),
        },
        _ => BridgeError::from(e),
    })?;

    if ids.last().is_some_and(|&max| id <= max) {
        debug!(identity_id = id, "Reused gap id");
    }
    sync_sequence(conn).await?;
    Ok(id)
}

/// Pull the autoincrement sequence to `MAX(id)`.
pub(super) async fn sync_sequence(conn: &mut SqliteConnection) -> Result<(), DatabaseError> {
    let result = sqlx::query(SYNC_SEQUENCE).execute(&mut *conn).await?;
    if result.rows_affected() == 0 {
        sqlx::query(SEED_SEQUENCE).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Rebuild a catalog that predates the `owner_id` column.
///
/// Owners are recovered from the app store path; rows whose path does not
/// encode one cannot be attributed to a tenant and are dropped.
async fn upgrade_legacy_schema(conn: &mut SqliteConnection) -> Result<(), DatabaseError> {
    info!("Upgrading whatsapp_accounts to the owner-scoped schema");

    let mut tx = conn.begin().await?;
    sqlx::query("ALTER TABLE whatsapp_accounts RENAME TO whatsapp_accounts_legacy")
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;
    sqlx::query(CREATE_ACCOUNTS)
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;

    let rows = sqlx::query_as::<_, LegacyRow>(
        &LEGACY_SELECT.replace("{table}", "whatsapp_accounts_legacy"),
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut kept = 0usize;
    for row in rows {
        let Some(owner) = parse_owner(Path::new(&row.bot_data_db_path)) else {
            warn!(
                identity_id = row.id,
                path = %row.bot_data_db_path,
                "Dropping legacy row without owner encoding"
            );
            continue;
        };
        let phone = phone::normalize(&row.phone_number);
        let inserted = sqlx::query(
            r"
            INSERT OR IGNORE INTO whatsapp_accounts
                (id, phone_number, owner_id, db_path, bot_data_db_path, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(row.id)
        .bind(&phone)
        .bind(owner)
        .bind(&row.db_path)
        .bind(&row.bot_data_db_path)
        .bind(&row.status)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut *tx)
        .await?;
        kept += usize::try_from(inserted.rows_affected()).unwrap_or(0);
    }

    sqlx::query("DROP TABLE whatsapp_accounts_legacy")
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;
    sync_sequence(&mut *tx).await?;
    tx.commit().await?;

    info!(rows = kept, "Catalog schema upgraded");
    Ok(())
}
