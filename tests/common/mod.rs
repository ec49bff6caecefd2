#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tiergate::clock::ManualTimeSource;
use tiergate::config::{DatabaseConfig, TiergateConfig};
use tiergate::error::{Result, TiergateError};
use tiergate::ratelimit::RateLimiter;
use tiergate::storage::{Counted, EphemeralStore, SqlStore, Storage, StorageBackend, StorageKind, WindowId};

pub const START: i64 = 1_700_000_000;

pub fn clock() -> Arc<ManualTimeSource> {
    Arc::new(ManualTimeSource::new(START))
}

pub fn ephemeral_limiter(config: TiergateConfig) -> (Arc<ManualTimeSource>, RateLimiter) {
    let time = clock();
    let storage = Storage::ephemeral(time.clone(), Duration::from_secs(1));
    (time.clone(), RateLimiter::with_storage(config, storage, time))
}

pub async fn sql_limiter(config: TiergateConfig) -> (Arc<ManualTimeSource>, RateLimiter) {
    let time = clock();
    let database = DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        ..Default::default()
    };
    let store = SqlStore::connect(&database, time.clone())
        .await
        .expect("in-memory sqlite");
    let storage = Storage::new(Arc::new(store), Duration::from_secs(5));
    (time.clone(), RateLimiter::with_storage(config, storage, time))
}

/// A backend whose every call fails.
pub struct FailingStore;

fn down<T>() -> Result<T> {
    Err(TiergateError::Storage("backend down".to_string()))
}

#[async_trait]
impl StorageBackend for FailingStore {
    async fn get_count(&self, _key: &str) -> Result<u64> {
        down()
    }
    async fn get_reset_time(&self, _key: &str, _window_seconds: u64) -> Result<i64> {
        down()
    }
    async fn increment(&self, _key: &str, _expiry_seconds: u64) -> Result<Counted> {
        down()
    }
    async fn decrement(&self, _key: &str, _window: WindowId) -> Result<bool> {
        down()
    }
    async fn exists(&self, _key: &str) -> Result<bool> {
        down()
    }
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        down()
    }
    async fn set_with_expiry(&self, _key: &str, _value: &str, _expiry_seconds: u64) -> Result<bool> {
        down()
    }
    async fn set_if_absent(&self, _key: &str, _value: &str, _expiry_seconds: u64) -> Result<bool> {
        down()
    }
    async fn delete(&self, _key: &str) -> Result<bool> {
        down()
    }
    async fn clear_keys(&self, _pattern: &str) -> Result<bool> {
        down()
    }
    async fn get_ttl(&self, _key: &str) -> Result<Option<u64>> {
        down()
    }
    async fn purge_expired(&self) -> Result<u64> {
        down()
    }
    fn kind(&self) -> StorageKind {
        StorageKind::DistributedCache
    }
}

/// Delegates to an ephemeral store, yielding to the scheduler before every
/// call so concurrent tasks interleave between backend round trips.
pub struct YieldingStore {
    inner: EphemeralStore,
}

impl YieldingStore {
    pub fn new(time: Arc<ManualTimeSource>) -> Self {
        Self {
            inner: EphemeralStore::new(time),
        }
    }
}

#[async_trait]
impl StorageBackend for YieldingStore {
    async fn get_count(&self, key: &str) -> Result<u64> {
        tokio::task::yield_now().await;
        self.inner.get_count(key).await
    }
    async fn get_reset_time(&self, key: &str, window_seconds: u64) -> Result<i64> {
        tokio::task::yield_now().await;
        self.inner.get_reset_time(key, window_seconds).await
    }
    async fn increment(&self, key: &str, expiry_seconds: u64) -> Result<Counted> {
        tokio::task::yield_now().await;
        self.inner.increment(key, expiry_seconds).await
    }
    async fn decrement(&self, key: &str, window: WindowId) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.decrement(key, window).await
    }
    async fn exists(&self, key: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.exists(key).await
    }
    async fn get(&self, key: &str) -> Result<Option<String>> {
        tokio::task::yield_now().await;
        self.inner.get(key).await
    }
    async fn set_with_expiry(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.set_with_expiry(key, value, expiry_seconds).await
    }
    async fn set_if_absent(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.set_if_absent(key, value, expiry_seconds).await
    }
    async fn delete(&self, key: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.delete(key).await
    }
    async fn clear_keys(&self, pattern: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        self.inner.clear_keys(pattern).await
    }
    async fn get_ttl(&self, key: &str) -> Result<Option<u64>> {
        tokio::task::yield_now().await;
        self.inner.get_ttl(key).await
    }
    async fn purge_expired(&self) -> Result<u64> {
        self.inner.purge_expired().await
    }
    fn kind(&self) -> StorageKind {
        StorageKind::Ephemeral
    }
}

/// Delegates to an ephemeral store, but the first decrement arrives late:
/// the window has rolled over and another caller has already counted a
/// request in the new one.
pub struct LateUndoStore {
    inner: EphemeralStore,
    time: Arc<ManualTimeSource>,
    rolled: AtomicBool,
}

impl LateUndoStore {
    pub fn new(time: Arc<ManualTimeSource>) -> Self {
        Self {
            inner: EphemeralStore::new(time.clone()),
            time,
            rolled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl StorageBackend for LateUndoStore {
    async fn get_count(&self, key: &str) -> Result<u64> {
        self.inner.get_count(key).await
    }
    async fn get_reset_time(&self, key: &str, window_seconds: u64) -> Result<i64> {
        self.inner.get_reset_time(key, window_seconds).await
    }
    async fn increment(&self, key: &str, expiry_seconds: u64) -> Result<Counted> {
        self.inner.increment(key, expiry_seconds).await
    }
    async fn decrement(&self, key: &str, window: WindowId) -> Result<bool> {
        if !self.rolled.swap(true, Ordering::SeqCst) {
            let ttl = self.inner.get_ttl(key).await?.unwrap_or(0);
            self.time.advance(ttl as i64);
            self.inner.increment(key, ttl.max(1)).await?;
        }
        self.inner.decrement(key, window).await
    }
    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }
    async fn set_with_expiry(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool> {
        self.inner.set_with_expiry(key, value, expiry_seconds).await
    }
    async fn set_if_absent(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool> {
        self.inner.set_if_absent(key, value, expiry_seconds).await
    }
    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }
    async fn clear_keys(&self, pattern: &str) -> Result<bool> {
        self.inner.clear_keys(pattern).await
    }
    async fn get_ttl(&self, key: &str) -> Result<Option<u64>> {
        self.inner.get_ttl(key).await
    }
    async fn purge_expired(&self) -> Result<u64> {
        self.inner.purge_expired().await
    }
    fn kind(&self) -> StorageKind {
        StorageKind::Ephemeral
    }
}

pub type ManualClock = ManualTimeSource;
