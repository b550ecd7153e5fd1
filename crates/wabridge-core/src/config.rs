//! Configuration resolution for wabridge.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/wabridge/settings.json)
//! 3. Project config (.wabridge/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::layout::{MASTER_FILE_NAME, StorageLayout};

/// Complete wabridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub reclaim: ReclaimConfig,
}

impl Config {
    /// Storage layout described by the `storage` section.
    pub fn layout(&self) -> StorageLayout {
        let layout = StorageLayout::with_master(&self.storage.root, &self.storage.master_file_name);
        match &self.storage.backup_dir {
            Some(dir) => layout.with_backup_dir(dir),
            None => layout,
        }
    }
}

/// Where per-identity stores and the master catalog live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub master_file_name: String,
    /// Defaults to `<root>/backup`.
    pub backup_dir: Option<PathBuf>,
    pub busy_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            master_file_name: MASTER_FILE_NAME.to_string(),
            backup_dir: None,
            busy_timeout_secs: 10,
        }
    }
}

impl StorageConfig {
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

/// Client pool timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub connect_timeout_secs: u64,
    pub reconnect_timeout_secs: u64,
    pub connect_poll_millis: u64,
    /// Deadline applied to every client call made by bulk jobs.
    pub call_timeout_secs: u64,
    /// Delay before a logged-out identity is torn down.
    pub logout_debounce_millis: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            reconnect_timeout_secs: 5,
            connect_poll_millis: 500,
            call_timeout_secs: 30,
            logout_debounce_millis: 500,
        }
    }
}

impl PoolConfig {
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub const fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }

    pub const fn connect_poll(&self) -> Duration {
        Duration::from_millis(self.connect_poll_millis)
    }

    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub const fn logout_debounce(&self) -> Duration {
        Duration::from_millis(self.logout_debounce_millis)
    }
}

/// Session cache behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Wait between closing an operator's app store and opening the next one.
    pub rebuild_delay_millis: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rebuild_delay_millis: 100,
        }
    }
}

impl SessionConfig {
    pub const fn rebuild_delay(&self) -> Duration {
        Duration::from_millis(self.rebuild_delay_millis)
    }
}

/// Interactive pairing limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Wall-clock limit for the phone to confirm the code.
    pub timeout_secs: u64,
    pub poll_interval_millis: u64,
    pub connect_timeout_secs: u64,
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * backoff_unit`.
    pub backoff_unit_millis: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            poll_interval_millis: 5_000,
            connect_timeout_secs: 15,
            max_attempts: 3,
            backoff_unit_millis: 2_000,
        }
    }
}

impl PairingConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub const fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_unit_millis.saturating_mul(attempt as u64))
    }
}

/// Reclaimer schedule and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    pub interval_secs: u64,
    /// Identities unused for longer than this are destroyed. Default: 7 days.
    pub inactive_threshold_secs: u64,
    /// Run the orphan-file sweep periodically as well as at startup.
    pub orphan_interval_secs: Option<u64>,
    /// Lifetime of a delete-confirmation ticket.
    pub ticket_ttl_secs: u64,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            inactive_threshold_secs: 7 * 24 * 60 * 60, // 7 days
            orphan_interval_secs: None,
            ticket_ttl_secs: 5 * 60,
        }
    }
}

impl ReclaimConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub const fn inactive_threshold(&self) -> Duration {
        Duration::from_secs(self.inactive_threshold_secs)
    }

    pub const fn orphan_interval(&self) -> Option<Duration> {
        match self.orphan_interval_secs {
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        }
    }

    pub const fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.ticket_ttl_secs)
    }
}

/// Load configuration with hierarchical resolution.
///
/// Files are merged key by key, so a project file only overrides the keys it
/// names. `null` values never override.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut merged = Value::Object(serde_json::Map::new());

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_values(&mut merged, read_config_value(&global_path)?);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".wabridge").join("settings.json");
        if project_path.exists() {
            merge_values(&mut merged, read_config_value(&project_path)?);
        }
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Failed to merge config files: {e}")))?;
    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load a single settings file without consulting the hierarchy.
pub fn load_config_file(path: &Path) -> Result<Config> {
    serde_json::from_value(read_config_value(path)?).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Read a settings file as JSON, checking that it parses as a [`Config`].
fn read_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    Config::deserialize(&value).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    Ok(value)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".wabridge").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/wabridge/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("wabridge").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                if value.is_null() {
                    continue;
                }
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("WABRIDGE_ROOT") {
        config.storage.root = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("WABRIDGE_MASTER_FILE") {
        config.storage.master_file_name = val;
    }
    if let Ok(val) = std::env::var("WABRIDGE_RECLAIM_INTERVAL_SECS")
        && let Ok(n) = val.parse()
    {
        config.reclaim.interval_secs = n;
    }
    if let Ok(val) = std::env::var("WABRIDGE_INACTIVE_THRESHOLD_SECS")
        && let Ok(n) = val.parse()
    {
        config.reclaim.inactive_threshold_secs = n;
    }
    if let Ok(val) = std::env::var("WABRIDGE_PAIRING_TIMEOUT_SECS")
        && let Ok(n) = val.parse()
    {
        config.pairing.timeout_secs = n;
    }
}
