//! Import of identities from catalogs written by older single-file builds.

use std::path::{Path, PathBuf};

use sqlx::Connection;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info, warn};

use wabridge_core::db::read_only_options;
use wabridge_core::layout::{is_identity_store, parse_owner};

use super::registry::{LEGACY_SELECT, LegacyRow, Registry};
use crate::error::{BridgeError, BridgeResult};

impl Registry {
    /// Copy identities out of stray `*.db` catalogs next to the master.
    ///
    /// Files following the per-identity naming scheme and the master itself
    /// are never touched. Each candidate is opened read-only; when it holds a
    /// `whatsapp_accounts` table every `(owner, phone)` not yet catalogued is
    /// inserted, owner taken from the app store path. Returns the number of
    /// rows copied.
    pub async fn migrate_from_legacy(&self) -> BridgeResult<usize> {
        let _guard = self.migrate_lock.lock().await;

        let mut copied = 0;
        for candidate in self.legacy_candidates()? {
            match read_legacy_rows(&candidate).await {
                Ok(rows) if rows.is_empty() => {}
                Ok(rows) => {
                    debug!(path = %candidate.display(), rows = rows.len(), "Found legacy catalog");
                    copied += self.copy_legacy_rows(rows).await?;
                }
                Err(e) => {
                    warn!(path = %candidate.display(), error = %e, "Skipping unreadable legacy catalog");
                }
            }
        }

        if copied > 0 {
            info!(rows = copied, "Legacy identities migrated");
        }
        Ok(copied)
    }

    fn legacy_candidates(&self) -> BridgeResult<Vec<PathBuf>> {
        let layout = self.layout();
        let dir = layout
            .master_path()
            .parent()
            .map_or_else(|| layout.root().to_path_buf(), Path::to_path_buf);

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BridgeError::Storage(e.to_string())),
        };

        let mut candidates: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path.extension().is_some_and(|ext| ext == "db")
                    && !layout.is_master(path)
                    && !is_identity_store(path)
            })
            .collect();
        candidates.sort();
        Ok(candidates)
    }

    async fn copy_legacy_rows(&self, rows: Vec<LegacyRow>) -> BridgeResult<usize> {
        let mut copied = 0;
        for row in rows {
            let Some(owner) = parse_owner(Path::new(&row.bot_data_db_path)) else {
                warn!(
                    legacy_id = row.id,
                    path = %row.bot_data_db_path,
                    "Legacy row has no owner encoding, skipped"
                );
                continue;
            };
            if self.find_by_phone(owner, &row.phone_number).await?.is_some() {
                continue;
            }
            match self
                .insert(
                    &row.phone_number,
                    Path::new(&row.db_path),
                    Path::new(&row.bot_data_db_path),
                    owner,
                )
                .await
            {
                Ok(identity) => {
                    debug!(identity_id = identity.id, owner, "Legacy identity copied");
                    copied += 1;
                }
                Err(BridgeError::Duplicate { .. } | BridgeError::Invalid(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(copied)
    }
}

async fn read_legacy_rows(path: &Path) -> Result<Vec<LegacyRow>, sqlx::Error> {
    let options = read_only_options(path).map_err(|e| sqlx::Error::Configuration(e.into()))?;
    let mut conn = SqliteConnection::connect_with(&options).await?;

    let has_table: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'whatsapp_accounts'",
    )
    .fetch_optional(&mut conn)
    .await?;

    let rows = if has_table.is_some() {
        let select = LEGACY_SELECT.replace("{table}", "whatsapp_accounts");
        sqlx::query_as::<_, LegacyRow>(&select)
            .fetch_all(&mut conn)
            .await?
    } else {
        Vec::new()
    };

    let _ = conn.close().await;
    Ok(rows)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use wabridge_core::StorageLayout;
    use wabridge_core::db::master_options;

    use super::*;

    async fn open_registry(root: &Path) -> Registry {
        Registry::open(StorageLayout::new(root), Duration::from_secs(1))
            .await
            .unwrap()
    }

    /// Write a catalog in the single-owner schema older builds used.
    async fn write_old_catalog(path: &Path, rows: &[(&str, &str, &str)]) {
        let options = master_options(path, Duration::from_secs(1)).unwrap();
        let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
        sqlx::query(
            r"CREATE TABLE whatsapp_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                phone_number TEXT NOT NULL UNIQUE,
                db_path TEXT NOT NULL,
                bot_data_db_path TEXT NOT NULL,
                status TEXT DEFAULT 'active',
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        for (phone, protocol, app) in rows {
            sqlx::query(
                "INSERT INTO whatsapp_accounts (phone_number, db_path, bot_data_db_path) VALUES (?, ?, ?)",
            )
            .bind(phone)
            .bind(protocol)
            .bind(app)
            .execute(&mut conn)
            .await
            .unwrap();
        }
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn sibling_catalog_rows_are_copied_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open_registry(dir.path()).await;
        let paths = registry.layout().identity_paths(555, "628111");
        registry
            .insert("628111", &paths.protocol_store, &paths.app_store, 555)
            .await
            .unwrap();

        write_old_catalog(
            &dir.path().join("old.db"),
            &[
                ("628111", "x/whatsmeow-555-628111.db", "x/bot_data-555-628111.db"),
                ("628222", "x/whatsmeow-777-628222.db", "x/bot_data-777-628222.db"),
                ("628333", "x/whatsmeow.db", "x/bot_data.db"),
            ],
        )
        .await;

        assert_eq!(registry.migrate_from_legacy().await.unwrap(), 1);
        assert_eq!(registry.migrate_from_legacy().await.unwrap(), 0);

        let rows: Vec<_> = registry
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|identity| (identity.id, identity.owner, identity.phone))
            .collect();
        assert_eq!(
            rows,
            vec![(1, 555, "628111".to_string()), (2, 777, "628222".to_string())]
        );
    }

    #[tokio::test]
    async fn per_identity_files_are_never_read_as_catalogs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open_registry(dir.path()).await;

        write_old_catalog(
            &dir.path().join("bot_data-999-628000.db"),
            &[("628000", "x/whatsmeow-999-628000.db", "x/bot_data-999-628000.db")],
        )
        .await;

        assert_eq!(registry.migrate_from_legacy().await.unwrap(), 0);
        assert!(registry.list_all().await.unwrap().is_empty());
    }
}
