//! Process-local storage backed by a concurrent map.
//!
//! Single instance only: counters are not shared between processes. Each
//! store is an explicitly constructed value, so tests get isolated state.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use super::{matches_pattern, Counted, StorageBackend, StorageKind, WindowId};
use crate::clock::SharedTimeSource;
use crate::error::{Result, TiergateError};

#[derive(Debug, Clone)]
struct Slot {
    count: u64,
    value: Option<String>,
    /// Unix seconds; `None` never expires
    expires_at: Option<i64>,
}

impl Slot {
    fn counter(expires_at: Option<i64>) -> Self {
        Self {
            count: 1,
            value: None,
            expires_at,
        }
    }

    fn value(value: &str, expires_at: Option<i64>) -> Self {
        Self {
            count: 0,
            value: Some(value.to_string()),
            expires_at,
        }
    }

    fn is_live(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }

    /// A fresh window always expires later than the one it replaced.
    fn window(&self) -> WindowId {
        WindowId(self.expires_at.unwrap_or(0))
    }

    fn counted(&self) -> Counted {
        Counted {
            count: self.count,
            window: self.window(),
        }
    }
}

/// In-memory storage backend.
pub struct EphemeralStore {
    entries: DashMap<String, Slot>,
    time: SharedTimeSource,
}

impl EphemeralStore {
    pub fn new(time: SharedTimeSource) -> Self {
        Self {
            entries: DashMap::new(),
            time,
        }
    }

    /// Number of stored entries, live or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expiry_from(&self, now: i64, expiry_seconds: u64) -> Option<i64> {
        (expiry_seconds > 0).then(|| now + expiry_seconds as i64)
    }

    fn live(&self, key: &str) -> Option<Slot> {
        let now = self.time.now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl StorageBackend for EphemeralStore {
    async fn get_count(&self, key: &str) -> Result<u64> {
        Ok(self.live(key).map_or(0, |entry| entry.count))
    }

    async fn get_reset_time(&self, key: &str, window_seconds: u64) -> Result<i64> {
        let now = self.time.now();
        Ok(self
            .live(key)
            .and_then(|entry| entry.expires_at)
            .unwrap_or(now + window_seconds as i64))
    }

    async fn increment(&self, key: &str, expiry_seconds: u64) -> Result<Counted> {
        let now = self.time.now();
        let expires_at = self.expiry_from(now, expiry_seconds);

        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Slot {
                count: 0,
                value: None,
                expires_at,
            });

        if !entry.is_live(now) {
            *entry = Slot::counter(expires_at);
            return Ok(entry.counted());
        }

        if entry.value.is_some() {
            return Err(TiergateError::Storage(format!(
                "value at {} is not a counter",
                key
            )));
        }

        entry.count += 1;
        if entry.expires_at.is_none() {
            entry.expires_at = expires_at;
        }
        Ok(entry.counted())
    }

    async fn decrement(&self, key: &str, window: WindowId) -> Result<bool> {
        let now = self.time.now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) && entry.window() == window && entry.count > 0 => {
                entry.count -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live(key).is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .live(key)
            .map(|entry| entry.value.unwrap_or_else(|| entry.count.to_string())))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool> {
        let now = self.time.now();
        let expires_at = self.expiry_from(now, expiry_seconds);
        self.entries
            .insert(key.to_string(), Slot::value(value, expires_at));
        Ok(true)
    }

    async fn set_if_absent(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool> {
        let now = self.time.now();
        let expires_at = self.expiry_from(now, expiry_seconds);

        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(Slot::value(value, expires_at));
                Ok(true)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Slot::value(value, expires_at));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.time.now();
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, entry)| entry.is_live(now)))
    }

    async fn clear_keys(&self, pattern: &str) -> Result<bool> {
        self.entries.retain(|key, _| !matches_pattern(pattern, key));
        Ok(true)
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<u64>> {
        let now = self.time.now();
        Ok(self
            .live(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| (at - now).max(0) as u64))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = self.time.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Ephemeral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use std::sync::Arc;

    fn store() -> (Arc<ManualTimeSource>, EphemeralStore) {
        let time = Arc::new(ManualTimeSource::new(1_000));
        let store = EphemeralStore::new(time.clone());
        (time, store)
    }

    #[tokio::test]
    async fn test_increment_returns_post_value() {
        let (_, store) = store();
        let first = store.increment("k", 60).await.unwrap();
        let second = store.increment("k", 60).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert_eq!(first.window, second.window);
        assert_eq!(store.get_count("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_expiry_is_not_extended_by_traffic() {
        let (time, store) = store();
        store.increment("k", 60).await.unwrap();
        time.advance(30);
        store.increment("k", 60).await.unwrap();

        assert_eq!(store.get_reset_time("k", 60).await.unwrap(), 1_060);
        assert_eq!(store.get_ttl("k").await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn test_lazy_expiry() {
        let (time, store) = store();
        store.increment("k", 10).await.unwrap();
        store.increment("k", 10).await.unwrap();

        time.advance(10);
        // Still physically present, logically gone
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_count("k").await.unwrap(), 0);
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get_reset_time("k", 10).await.unwrap(), 1_020);

        // Next increment opens a fresh window
        assert_eq!(store.increment("k", 10).await.unwrap().count, 1);
        assert_eq!(store.get_reset_time("k", 10).await.unwrap(), 1_020);
    }

    #[tokio::test]
    async fn test_decrement_floors_at_zero() {
        let (_, store) = store();
        let window = store.increment("k", 60).await.unwrap().window;
        assert!(store.decrement("k", window).await.unwrap());
        assert!(!store.decrement("k", window).await.unwrap());
        assert_eq!(store.get_count("k").await.unwrap(), 0);
        assert!(!store.decrement("missing", window).await.unwrap());
        assert!(!store.exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_decrement_ignores_a_newer_window() {
        let (time, store) = store();
        let stale = store.increment("k", 10).await.unwrap().window;

        time.advance(10);
        let fresh = store.increment("k", 10).await.unwrap();
        assert_ne!(fresh.window, stale);

        assert!(!store.decrement("k", stale).await.unwrap());
        assert_eq!(store.get_count("k").await.unwrap(), 1);
        assert!(store.decrement("k", fresh.window).await.unwrap());
        assert_eq!(store.get_count("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_values_and_permanent_entries() {
        let (time, store) = store();
        assert!(store.set_with_expiry("perm", "v", 0).await.unwrap());
        assert!(store.set_with_expiry("temp", "t", 5).await.unwrap());

        time.advance(1_000_000);
        assert_eq!(store.get("perm").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.get_ttl("perm").await.unwrap(), None);
        assert_eq!(store.get("temp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_if_absent() {
        let (time, store) = store();
        assert!(store.set_if_absent("first", "a", 5).await.unwrap());
        assert!(!store.set_if_absent("first", "b", 5).await.unwrap());
        assert_eq!(store.get("first").await.unwrap(), Some("a".to_string()));

        time.advance(5);
        assert!(store.set_if_absent("first", "c", 0).await.unwrap());
        assert_eq!(store.get("first").await.unwrap(), Some("c".to_string()));
    }

    #[tokio::test]
    async fn test_increment_on_value_is_an_error() {
        let (_, store) = store();
        store.set_with_expiry("v", "{}", 0).await.unwrap();
        assert!(matches!(
            store.increment("v", 10).await,
            Err(TiergateError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_and_clear_keys() {
        let (_, store) = store();
        store.increment("ratelimit:a:x:hourly", 60).await.unwrap();
        store.increment("ratelimit:a:y:hourly", 60).await.unwrap();
        store.increment("ratelimit:b:x:hourly", 60).await.unwrap();

        assert!(store.delete("ratelimit:a:y:hourly").await.unwrap());
        assert!(!store.delete("ratelimit:a:y:hourly").await.unwrap());

        store.clear_keys("ratelimit:a:*").await.unwrap();
        assert!(!store.exists("ratelimit:a:x:hourly").await.unwrap());
        assert!(store.exists("ratelimit:b:x:hourly").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (time, store) = store();
        store.increment("short", 5).await.unwrap();
        store.increment("long", 500).await.unwrap();
        time.advance(10);

        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }
}
