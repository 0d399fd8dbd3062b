//! Store configuration with file and environment overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`StoreConfig::default()`]
//! 2. If a JSON config file exists, deep-merge its values over the defaults
//! 3. Apply `ED_*` environment variable overrides (highest priority)
//!
//! Invalid environment values are ignored with a warning. The merged result is
//! checked with [`StoreConfig::validate`] before it is returned.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A config value was invalid.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Connection pool sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Maximum number of open connections.
    pub max_size: u32,
    /// Idle ceiling; idle connections above it are closed by the pool.
    pub max_idle: u32,
    /// How long an idle connection above the ceiling may linger.
    pub idle_timeout_ms: u64,
    /// How long a checkout may wait for a free connection.
    pub connection_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 16,
            max_idle: 10,
            idle_timeout_ms: 60_000,
            connection_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Checkout timeout as a [`Duration`].
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Top-level store configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// Path of the durable database file.
    pub db_path: PathBuf,
    /// Pool sizing.
    pub pool: PoolConfig,
    /// `SQLite` busy timeout applied to every connection.
    pub busy_timeout_ms: u32,
    /// Prepared statements cached per connection.
    pub statement_cache_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("diskDb.db"),
            pool: PoolConfig::default(),
            busy_timeout_ms: 60_000,
            statement_cache_capacity: 32,
        }
    }
}

impl StoreConfig {
    /// Defaults pointed at a specific database file.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Self::default()
        }
    }

    /// Reject configurations the pool cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_size == 0 {
            return Err(ConfigError::InvalidValue(
                "pool.maxSize must be at least 1".into(),
            ));
        }
        if self.pool.max_idle > self.pool.max_size {
            return Err(ConfigError::InvalidValue(format!(
                "pool.maxIdle ({}) exceeds pool.maxSize ({})",
                self.pool.max_idle, self.pool.max_size
            )));
        }
        if self.statement_cache_capacity < crate::sqlite::statements::StatementKind::ALL.len() {
            return Err(ConfigError::InvalidValue(format!(
                "statementCacheCapacity ({}) is smaller than the statement set",
                self.statement_cache_capacity
            )));
        }
        Ok(())
    }
}

/// Load config from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_config_from_path(path: &Path) -> Result<StoreConfig, ConfigError> {
    let defaults = serde_json::to_value(StoreConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: StoreConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key; arrays and primitives in `source` replace `target`;
/// nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `ED_*` environment variable overrides.
pub fn apply_env_overrides(config: &mut StoreConfig) {
    if let Some(v) = read_env_string("ED_DB_PATH") {
        config.db_path = PathBuf::from(v);
    }
    if let Some(v) = read_env_u64("ED_POOL_SIZE", 1, 1024) {
        config.pool.max_size = u32::try_from(v).unwrap_or(config.pool.max_size);
    }
    if let Some(v) = read_env_u64("ED_MAX_IDLE", 0, 1024) {
        config.pool.max_idle = u32::try_from(v).unwrap_or(config.pool.max_idle);
    }
    if let Some(v) = read_env_u64("ED_BUSY_TIMEOUT_MS", 0, 3_600_000) {
        config.busy_timeout_ms = u32::try_from(v).unwrap_or(config.busy_timeout_ms);
    }
    if let Some(v) = read_env_u64("ED_CONNECTION_TIMEOUT_MS", 1, 3_600_000) {
        config.pool.connection_timeout_ms = v;
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid integer env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
