//! Pluggable storage for window counters, blacklist records and statistics.
//!
//! Three backends implement [`StorageBackend`]:
//! - **Ephemeral**: process-local `DashMap`, single instance only
//! - **DistributedCache**: Redis, shared across instances
//! - **Relational**: SQLite table with one row per key
//!
//! The backend is chosen once by [`Storage::connect`]. If the configured
//! backend cannot be reached the handle falls back to the ephemeral store and
//! says so in the log; nothing downstream branches on the fallback.

mod cache;
mod ephemeral;
mod sql;

pub use cache::RedisStore;
pub use ephemeral::EphemeralStore;
pub use sql::SqlStore;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::clock::SharedTimeSource;
use crate::config::TiergateConfig;
use crate::error::{Result, TiergateError};

/// The closed set of storage backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Process-local maps
    #[serde(alias = "memory", alias = "session")]
    Ephemeral,
    /// Remote key/value cache
    #[default]
    #[serde(alias = "redis")]
    DistributedCache,
    /// SQL table
    #[serde(alias = "database", alias = "sqlite")]
    Relational,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Ephemeral => "ephemeral",
            StorageKind::DistributedCache => "distributed_cache",
            StorageKind::Relational => "relational",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = TiergateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ephemeral" | "memory" | "session" => Ok(StorageKind::Ephemeral),
            "distributed_cache" | "redis" => Ok(StorageKind::DistributedCache),
            "relational" | "database" | "sqlite" => Ok(StorageKind::Relational),
            other => Err(TiergateError::Config(format!(
                "Unsupported storage backend: {}",
                other
            ))),
        }
    }
}

/// Increments between two sweeps of expired entries.
pub const DEFAULT_PURGE_INTERVAL: u64 = 1000;

/// Identifies the window an increment landed in.
///
/// Only meaningful to the backend that produced it. Handing it back to
/// [`StorageBackend::decrement`] keeps an undo from reaching a newer window
/// under the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WindowId(pub i64);

/// Outcome of an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counted {
    /// Post-increment count
    pub count: u64,
    pub window: WindowId,
}

/// Capability contract shared by every storage backend.
///
/// Implementations must be safe for concurrent use by many in-flight
/// requests. Every read honors lazy expiry: an entry whose expiry lies in the
/// past behaves exactly like a missing entry, whether or not it has been
/// physically removed.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Current counter value, 0 when absent.
    async fn get_count(&self, key: &str) -> Result<u64>;

    /// Unix time at which the key expires. Absent or persistent keys report
    /// `now + window_seconds`, the reset time of a window opened now.
    async fn get_reset_time(&self, key: &str, window_seconds: u64) -> Result<i64>;

    /// Increment the counter and return the post-increment value, in one
    /// atomic step. The expiry is applied only when the increment opens a
    /// new window (or the key had none); `0` means no expiry.
    async fn increment(&self, key: &str, expiry_seconds: u64) -> Result<Counted>;

    /// Decrement a live counter, never below zero, but only while it is still
    /// in `window`. Returns whether the counter changed.
    async fn decrement(&self, key: &str, window: WindowId) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Stored value, if any. Counters read back as their decimal value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the key with `value`. `0` means no expiry.
    async fn set_with_expiry(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool>;

    /// Store `value` only if no live entry exists. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool>;

    /// Remove the key. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every key matching `pattern`. A trailing `*` matches any
    /// suffix; otherwise the pattern is an exact key.
    async fn clear_keys(&self, pattern: &str) -> Result<bool>;

    /// Seconds until the key expires. `None` if absent or persistent.
    async fn get_ttl(&self, key: &str) -> Result<Option<u64>>;

    /// Physically remove expired entries. Returns how many were removed;
    /// backends that expire keys natively return 0.
    async fn purge_expired(&self) -> Result<u64>;

    fn kind(&self) -> StorageKind;
}

/// Shared, cloneable handle to the selected backend.
///
/// Every call is bounded by the configured operation timeout; an elapsed
/// timeout surfaces as [`TiergateError::Timeout`]. Every
/// `purge_interval`-th increment also sweeps expired entries, so keys that
/// never come back do not accumulate.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
    timeout: Duration,
    purge_interval: u64,
    writes: Arc<AtomicU64>,
}

impl Storage {
    pub fn new(backend: Arc<dyn StorageBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sweep after every `interval` increments; 0 disables sweeping.
    pub fn with_purge_interval(mut self, interval: u64) -> Self {
        self.purge_interval = interval;
        self
    }

    /// A fresh process-local store.
    pub fn ephemeral(time: SharedTimeSource, timeout: Duration) -> Self {
        Self::new(Arc::new(EphemeralStore::new(time)), timeout)
    }

    /// Connect to the configured backend, falling back to the ephemeral store
    /// when the backend cannot be reached within the operation timeout.
    pub async fn connect(config: &TiergateConfig, time: SharedTimeSource) -> Self {
        let timeout = config.operation_timeout();

        let connected: Result<Arc<dyn StorageBackend>> = match config.storage {
            StorageKind::Ephemeral => {
                return Self::ephemeral(time, timeout).with_purge_interval(config.purge_interval)
            }
            StorageKind::DistributedCache => {
                bounded(timeout, RedisStore::connect(&config.redis, time.clone()))
                    .await
                    .map(|store| Arc::new(store) as Arc<dyn StorageBackend>)
            }
            StorageKind::Relational => {
                bounded(timeout, SqlStore::connect(&config.database, time.clone()))
                    .await
                    .map(|store| Arc::new(store) as Arc<dyn StorageBackend>)
            }
        };

        match connected {
            Ok(backend) => {
                info!(storage = %config.storage, "Storage backend connected");
                Self::new(backend, timeout).with_purge_interval(config.purge_interval)
            }
            Err(e) => {
                warn!(
                    storage = %config.storage,
                    error = %e,
                    unavailable = e.is_unavailable(),
                    "Storage backend unavailable, falling back to ephemeral storage"
                );
                Self::ephemeral(time, timeout).with_purge_interval(config.purge_interval)
            }
        }
    }

    /// The backend actually in use.
    pub fn kind(&self) -> StorageKind {
        self.backend.kind()
    }

    pub async fn get_count(&self, key: &str) -> Result<u64> {
        trace!(key = %key, "get_count");
        bounded(self.timeout, self.backend.get_count(key)).await
    }

    pub async fn get_reset_time(&self, key: &str, window_seconds: u64) -> Result<i64> {
        bounded(self.timeout, self.backend.get_reset_time(key, window_seconds)).await
    }

    pub async fn increment(&self, key: &str, expiry_seconds: u64) -> Result<Counted> {
        trace!(key = %key, expiry_seconds, "increment");
        let counted = bounded(self.timeout, self.backend.increment(key, expiry_seconds)).await?;
        self.maybe_purge().await;
        Ok(counted)
    }

    pub async fn decrement(&self, key: &str, window: WindowId) -> Result<bool> {
        trace!(key = %key, window = window.0, "decrement");
        bounded(self.timeout, self.backend.decrement(key, window)).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        bounded(self.timeout, self.backend.exists(key)).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        bounded(self.timeout, self.backend.get(key)).await
    }

    pub async fn set_with_expiry(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool> {
        bounded(self.timeout, self.backend.set_with_expiry(key, value, expiry_seconds)).await
    }

    pub async fn set_if_absent(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool> {
        bounded(self.timeout, self.backend.set_if_absent(key, value, expiry_seconds)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        bounded(self.timeout, self.backend.delete(key)).await
    }

    pub async fn clear_keys(&self, pattern: &str) -> Result<bool> {
        trace!(pattern = %pattern, "clear_keys");
        bounded(self.timeout, self.backend.clear_keys(pattern)).await
    }

    pub async fn get_ttl(&self, key: &str) -> Result<Option<u64>> {
        bounded(self.timeout, self.backend.get_ttl(key)).await
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        bounded(self.timeout, self.backend.purge_expired()).await
    }

    async fn maybe_purge(&self) {
        if self.purge_interval == 0 {
            return;
        }
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.purge_interval != 0 {
            return;
        }
        match self.purge_expired().await {
            Ok(removed) => debug!(removed, "Purged expired entries"),
            Err(e) => warn!(error = %e, "Failed to purge expired entries"),
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("kind", &self.kind())
            .field("timeout", &self.timeout)
            .field("purge_interval", &self.purge_interval)
            .finish()
    }
}

async fn bounded<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TiergateError::Timeout(limit))?
}

/// Match a key against a pattern with an optional trailing `*`.
pub(crate) fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}
