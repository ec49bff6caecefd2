//! Configuration management for Tiergate.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TiergateError};
use crate::ratelimit::TierPolicy;
use crate::storage::StorageKind;

/// Environment variable prefix, e.g. `TIERGATE_STORAGE=relational`.
pub const ENV_PREFIX: &str = "TIERGATE";

/// Main configuration for the rate limiting engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiergateConfig {
    /// When false every check is admitted with a maximal limit
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Storage backend to use
    #[serde(default)]
    pub storage: StorageKind,

    /// Limit used by single-window checks that do not name one
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Window used by single-window checks that do not name one
    #[serde(default = "default_window_seconds")]
    pub default_window_seconds: u64,

    /// Deny instead of admit when the backend fails mid-check
    #[serde(default)]
    pub fail_closed: bool,

    /// How the three windows are checked and incremented
    #[serde(default)]
    pub admission: AdmissionStrategy,

    /// Upper bound for every backend call, including connect
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Namespace prepended to every window key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Sweep expired entries after this many increments; 0 disables sweeping
    #[serde(default = "default_purge_interval")]
    pub purge_interval: u64,

    /// Distributed cache connection
    #[serde(default)]
    pub redis: RedisConfig,

    /// Relational store connection
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Tier limits
    #[serde(default)]
    pub tiers: TierPolicy,
}

impl Default for TiergateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage: StorageKind::default(),
            default_limit: default_limit(),
            default_window_seconds: default_window_seconds(),
            fail_closed: false,
            admission: AdmissionStrategy::default(),
            operation_timeout_ms: default_operation_timeout_ms(),
            key_prefix: default_key_prefix(),
            purge_interval: default_purge_interval(),
            redis: RedisConfig::default(),
            database: DatabaseConfig::default(),
            tiers: TierPolicy::default(),
        }
    }
}

/// Strategy for admitting a request across the hourly, minute and burst windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionStrategy {
    /// Increment each window and compare the post-increment count, undoing
    /// the increments when a window is over its limit. Never admits more
    /// than the limit under concurrent load.
    #[default]
    Atomic,
    /// Read all windows, decide, then increment all windows. Concurrent
    /// callers can overshoot a limit by up to `concurrency - 1`.
    CheckThenIncrement,
}

/// Distributed cache (Redis) connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Logical database index
    #[serde(default)]
    pub database: i64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            database: 0,
            username: None,
            password: None,
        }
    }
}

impl RedisConfig {
    /// Structured connection parameters; credentials are passed through
    /// verbatim, so reserved URL characters need no escaping.
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: self.database,
                username: self.username.clone(),
                password: self.password.clone(),
                ..Default::default()
            },
        }
    }
}

/// Relational store connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Table holding window, blacklist and stats rows
    #[serde(default = "default_database_table")]
    pub table: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            table: default_database_table(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_limit() -> u64 {
    100
}

fn default_window_seconds() -> u64 {
    3600
}

fn default_operation_timeout_ms() -> u64 {
    500
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_purge_interval() -> u64 {
    crate::storage::DEFAULT_PURGE_INTERVAL
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_database_url() -> String {
    "sqlite://tiergate.db?mode=rwc".to_string()
}

fn default_database_table() -> String {
    "rate_limits".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl TiergateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TiergateConfig =
            serde_yaml::from_str(yaml).map_err(|e| TiergateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `TIERGATE_*` environment variables.
    ///
    /// Nested fields use a double underscore: `TIERGATE_REDIS__HOST`.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(None)
    }

    /// Same as [`from_env`](Self::from_env) but reading from the given map
    /// instead of the process environment.
    pub fn from_vars(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()
            .map_err(|e| TiergateError::Config(e.to_string()))?;

        let config: TiergateConfig = settings
            .try_deserialize()
            .map_err(|e| TiergateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.default_window_seconds == 0 {
            return Err(TiergateError::Config(
                "default_window_seconds must be greater than zero".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(TiergateError::Config(
                "operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(TiergateError::Config("key_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}
