//! Per-identity storage layout.
//!
//! Every identity owns two store files under `<root>/<owner>/`:
//!
//! - protocol store: `whatsmeow-<owner>-<phone>.db`
//! - app store: `bot_data-<owner>-<phone>.db`
//!
//! The master catalog sits at `<root>/<master>` and is the only file allowed
//! to hold the `whatsapp_accounts` table. The owner encoded into an app store
//! file name is what the registry checks ownership against.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::OperatorId;

/// Default file name of the master catalog.
pub const MASTER_FILE_NAME: &str = "bot_data.db";

/// Sidecar suffixes that some journal modes leave next to a store.
pub const SIDECAR_SUFFIXES: [&str; 2] = ["-shm", "-wal"];

#[allow(clippy::expect_used)]
static PROTOCOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^whatsmeow-(\d+)-(\d+)\.db(-shm|-wal)?$").expect("static regex is valid")
});

#[allow(clippy::expect_used)]
static APP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^bot_data-(\d+)-(\d+)\.db(-shm|-wal)?$").expect("static regex is valid")
});

// Single-identity app store from before phones were part of the name.
#[allow(clippy::expect_used)]
static LEGACY_APP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^bot_data-(\d+)\.db(-shm|-wal)?$").expect("static regex is valid")
});

/// Which of the per-identity stores a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Protocol library device store.
    Protocol,
    /// Application data store.
    App,
    /// Application data store in the single-identity legacy naming.
    LegacyApp,
}

/// A file name recognised as part of the per-identity naming scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFile {
    pub kind: StoreKind,
    pub owner: OperatorId,
    pub phone: Option<String>,
    /// `Some("-wal")` / `Some("-shm")` for sidecars.
    pub sidecar: Option<&'static str>,
}

fn sidecar_of(capture: Option<regex::Match<'_>>) -> Option<&'static str> {
    match capture.map(|m| m.as_str()) {
        Some("-shm") => Some("-shm"),
        Some("-wal") => Some("-wal"),
        _ => None,
    }
}

/// Classify a bare file name against the per-identity naming scheme.
pub fn classify(file_name: &str) -> Option<StoreFile> {
    if let Some(caps) = PROTOCOL_RE.captures(file_name) {
        return Some(StoreFile {
            kind: StoreKind::Protocol,
            owner: caps[1].parse().ok()?,
            phone: Some(caps[2].to_string()),
            sidecar: sidecar_of(caps.get(3)),
        });
    }
    if let Some(caps) = APP_RE.captures(file_name) {
        return Some(StoreFile {
            kind: StoreKind::App,
            owner: caps[1].parse().ok()?,
            phone: Some(caps[2].to_string()),
            sidecar: sidecar_of(caps.get(3)),
        });
    }
    if let Some(caps) = LEGACY_APP_RE.captures(file_name) {
        return Some(StoreFile {
            kind: StoreKind::LegacyApp,
            owner: caps[1].parse().ok()?,
            phone: None,
            sidecar: sidecar_of(caps.get(2)),
        });
    }
    None
}

/// Whether `path` names a per-identity store file (or one of its sidecars).
pub fn is_identity_store(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(classify)
        .is_some()
}

/// Parse the owner encoded into an app store path.
///
/// Only the two app store patterns are accepted; a protocol store path or any
/// other file yields `None`.
pub fn parse_owner(app_store_path: &Path) -> Option<OperatorId> {
    let name = app_store_path.file_name()?.to_str()?;
    classify(name)
        .filter(|f| matches!(f.kind, StoreKind::App | StoreKind::LegacyApp) && f.sidecar.is_none())
        .map(|f| f.owner)
}

/// Paths of the two sidecars of `path`.
pub fn sidecars(path: &Path) -> [PathBuf; 2] {
    SIDECAR_SUFFIXES.map(|suffix| {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    })
}

/// `path` followed by its two sidecars.
pub fn file_group(path: &Path) -> [PathBuf; 3] {
    let [shm, wal] = sidecars(path);
    [path.to_path_buf(), shm, wal]
}

/// Remove a single file, ignoring "not found".
///
/// Returns `true` when a file was actually deleted. Other errors are logged
/// and swallowed; reclamation is best-effort.
pub fn remove_file_quietly(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed store file");
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove store file");
            false
        }
    }
}

/// Remove a store and its sidecars. Returns the number of files deleted.
pub fn remove_file_group(path: &Path) -> usize {
    file_group(path)
        .iter()
        .filter(|p| remove_file_quietly(p))
        .count()
}

/// Protocol and app store paths of one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPaths {
    pub protocol_store: PathBuf,
    pub app_store: PathBuf,
}

/// Deterministic file-path scheme rooted at a data directory.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    master_path: PathBuf,
    backup_dir: PathBuf,
}

impl StorageLayout {
    /// Layout with the default master file name and `<root>/backup`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_master(root, MASTER_FILE_NAME)
    }

    /// Layout with a custom master catalog file name.
    pub fn with_master(root: impl Into<PathBuf>, master_file_name: &str) -> Self {
        let root = root.into();
        Self {
            master_path: root.join(master_file_name),
            backup_dir: root.join("backup"),
            root,
        }
    }

    /// Override the backup directory.
    #[must_use]
    pub fn with_backup_dir(mut self, backup_dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = backup_dir.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn master_path(&self) -> &Path {
        &self.master_path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// `<root>/<owner>`
    pub fn owner_dir(&self, owner: OperatorId) -> PathBuf {
        self.root.join(owner.to_string())
    }

    pub fn protocol_store_path(&self, owner: OperatorId, phone: &str) -> PathBuf {
        self.owner_dir(owner)
            .join(format!("whatsmeow-{owner}-{phone}.db"))
    }

    pub fn app_store_path(&self, owner: OperatorId, phone: &str) -> PathBuf {
        self.owner_dir(owner)
            .join(format!("bot_data-{owner}-{phone}.db"))
    }

    pub fn identity_paths(&self, owner: OperatorId, phone: &str) -> IdentityPaths {
        IdentityPaths {
            protocol_store: self.protocol_store_path(owner, phone),
            app_store: self.app_store_path(owner, phone),
        }
    }

    /// Where `path` would live if it had been placed in the owner's directory.
    pub fn relocated(&self, path: &Path, owner: OperatorId) -> Option<PathBuf> {
        path.file_name().map(|name| self.owner_dir(owner).join(name))
    }

    /// Whether `path` is the master catalog (compared by file name).
    pub fn is_master(&self, path: &Path) -> bool {
        path.file_name().is_some() && path.file_name() == self.master_path.file_name()
    }

    /// Enumerate every file under the root and the owner directories that
    /// matches the per-identity naming scheme, sidecars included.
    ///
    /// The master catalog is never returned. A missing root yields nothing.
    pub fn scan_store_files(&self) -> io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let is_owner_dir = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
                if is_owner_dir {
                    for inner in std::fs::read_dir(&path)? {
                        let inner = inner?;
                        let inner_path = inner.path();
                        if inner.file_type()?.is_file() && self.is_candidate(&inner_path) {
                            found.push(inner_path);
                        }
                    }
                }
            } else if file_type.is_file() && self.is_candidate(&path) {
                found.push(path);
            }
        }

        found.sort();
        Ok(found)
    }

    fn is_candidate(&self, path: &Path) -> bool {
        !self.is_master(path) && is_identity_store(path)
    }

    /// Copy an app store into the backup directory with a timestamp suffix.
    ///
    /// Returns `Ok(None)` when there is nothing to back up.
    pub fn backup_app_store(&self, app_store: &Path, timestamp: i64) -> io::Result<Option<PathBuf>> {
        if !app_store.exists() {
            return Ok(None);
        }
        let Some(name) = app_store.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        std::fs::create_dir_all(&self.backup_dir)?;
        let target = self.backup_dir.join(format!("{name}.{timestamp}.bak"));
        std::fs::copy(app_store, &target)?;
        Ok(Some(target))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_owner_phone_scheme() {
        let layout = StorageLayout::new("root");
        assert_eq!(
            layout.protocol_store_path(555, "628111"),
            PathBuf::from("root/555/whatsmeow-555-628111.db")
        );
        assert_eq!(
            layout.app_store_path(555, "628111"),
            PathBuf::from("root/555/bot_data-555-628111.db")
        );
        assert_eq!(layout.master_path(), Path::new("root/bot_data.db"));
    }

    #[test]
    fn parse_owner_accepts_both_app_patterns() {
        assert_eq!(
            parse_owner(Path::new("root/555/bot_data-555-628111.db")),
            Some(555)
        );
        assert_eq!(parse_owner(Path::new("bot_data-42.db")), Some(42));
    }

    #[test]
    fn parse_owner_rejects_other_files() {
        assert_eq!(parse_owner(Path::new("root/bot_data.db")), None);
        assert_eq!(
            parse_owner(Path::new("root/555/whatsmeow-555-628111.db")),
            None
        );
        assert_eq!(parse_owner(Path::new("bot_data-555-628111.db-wal")), None);
        assert_eq!(parse_owner(Path::new("bot_data-abc-1.db")), None);
    }

    #[test]
    fn classify_recognises_sidecars() {
        let file = classify("whatsmeow-777-628444.db-shm").unwrap();
        assert_eq!(file.kind, StoreKind::Protocol);
        assert_eq!(file.owner, 777);
        assert_eq!(file.phone.as_deref(), Some("628444"));
        assert_eq!(file.sidecar, Some("-shm"));

        assert!(classify("bot_data.db").is_none());
        assert!(classify("notes.txt").is_none());
    }

    #[test]
    fn file_group_lists_main_and_sidecars() {
        let group = file_group(Path::new("a/bot_data-1-2.db"));
        assert_eq!(group[0], PathBuf::from("a/bot_data-1-2.db"));
        assert_eq!(group[1], PathBuf::from("a/bot_data-1-2.db-shm"));
        assert_eq!(group[2], PathBuf::from("a/bot_data-1-2.db-wal"));
    }

    #[test]
    fn remove_file_group_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("bot_data-1-2.db");
        std::fs::write(&main, b"x").unwrap();
        std::fs::write(dir.path().join("bot_data-1-2.db-wal"), b"x").unwrap();

        assert_eq!(remove_file_group(&main), 2);
        assert_eq!(remove_file_group(&main), 0);
    }

    #[test]
    fn scan_skips_master_and_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        std::fs::create_dir_all(layout.owner_dir(555)).unwrap();
        std::fs::create_dir_all(dir.path().join("backup")).unwrap();

        std::fs::write(layout.master_path(), b"").unwrap();
        std::fs::write(dir.path().join("bot_data-777-628444.db"), b"").unwrap();
        std::fs::write(layout.app_store_path(555, "628111"), b"").unwrap();
        std::fs::write(layout.owner_dir(555).join("readme.txt"), b"").unwrap();
        std::fs::write(
            dir.path().join("backup").join("bot_data-555-628111.db"),
            b"",
        )
        .unwrap();

        let found = layout.scan_store_files().unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&dir.path().join("bot_data-777-628444.db")));
        assert!(found.contains(&layout.app_store_path(555, "628111")));
    }

    #[test]
    fn scan_of_missing_root_is_empty() {
        let layout = StorageLayout::new("/definitely/not/here");
        assert!(layout.scan_store_files().unwrap().is_empty());
    }

    #[test]
    fn backup_copies_with_timestamp_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let app = layout.app_store_path(555, "628111");
        std::fs::create_dir_all(app.parent().unwrap()).unwrap();
        std::fs::write(&app, b"data").unwrap();

        let target = layout.backup_app_store(&app, 1_700_000_000).unwrap().unwrap();
        assert_eq!(
            target,
            dir.path()
                .join("backup")
                .join("bot_data-555-628111.db.1700000000.bak")
        );
        assert_eq!(std::fs::read(target).unwrap(), b"data");

        let missing = layout.app_store_path(555, "628999");
        assert!(layout.backup_app_store(&missing, 1).unwrap().is_none());
    }
}
