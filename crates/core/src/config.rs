// crates/core/src/config.rs
//! Rollup engine configuration.
//!
//! Loaded from TOML (`hudcache.toml`); every field has a default so an
//! empty or missing file is valid. `HUDCACHE_DB` overrides the database path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::style::StyleMode;

/// Environment variable overriding [`RollupConfig::db_path`].
pub const DB_PATH_ENV: &str = "HUDCACHE_DB";

/// How first-insert serialization is enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// A mutex inside this process. Correct for single-writer deployments.
    #[default]
    InProcess,
    /// A lock row in the backing store, for several importer processes
    /// sharing one database.
    StoreRow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    pub db_path: Option<PathBuf>,
    pub style_mode: StyleMode,
    pub week_start: Weekday,
    pub lock_mode: LockMode,
    pub lock_timeout_ms: u64,
    /// A store-row lock older than this is considered abandoned.
    pub lock_stale_after_secs: u64,
    pub max_apply_retries: u32,
    pub retry_backoff_ms: u64,
    /// Allowed absolute difference on amount columns when a rebuild is
    /// compared with the incremental state.
    pub money_tolerance: f64,
    pub rebuild_chunk_size: u32,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            style_mode: StyleMode::AllTime,
            week_start: Weekday::Mon,
            lock_mode: LockMode::InProcess,
            lock_timeout_ms: 5_000,
            lock_stale_after_secs: 60,
            max_apply_retries: 5,
            retry_backoff_ms: 20,
            money_tolerance: 1e-6,
            rebuild_chunk_size: 5_000,
        }
    }
}

impl RollupConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let mut config = Self::from_toml(&raw).map_err(|message| ConfigError::Malformed {
            path: path.to_owned(),
            message,
        })?;
        config.apply_env();
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise defaults. Env overrides
    /// apply either way.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            _ => {
                let mut config = Self::default();
                config.apply_env();
                Ok(config)
            }
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.to_string())
    }

    fn apply_env(&mut self) {
        if let Some(path) = std::env::var_os(DB_PATH_ENV).filter(|v| !v.is_empty()) {
            tracing::debug!(path = ?path, "database path overridden from environment");
            self.db_path = Some(PathBuf::from(path));
        }
    }

    /// Configured database path, or the default cache location.
    pub fn resolved_db_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.db_path {
            Some(p) => Ok(p.clone()),
            None => crate::paths::db_path().ok_or(ConfigError::NoCacheDir),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
