//! Blacklist overlay.
//!
//! A live entry denies an identifier regardless of its window counters.
//! Entries live in their own key namespace, so resetting an identifier's
//! quota never touches its blacklist entry.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::SharedTimeSource;
use crate::error::Result;
use crate::ratelimit::window::escape_component;
use crate::storage::Storage;

/// A stored blacklist record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub identifier: String,
    #[serde(default)]
    pub reason: String,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds; 0 means permanent
    pub expires_at: i64,
}

impl BlacklistEntry {
    pub fn is_permanent(&self) -> bool {
        self.expires_at == 0
    }
}

/// Creates, checks and removes blacklist entries.
#[derive(Clone)]
pub struct BlacklistManager {
    storage: Storage,
    time: SharedTimeSource,
    namespace: String,
}

impl BlacklistManager {
    pub fn new(storage: Storage, time: SharedTimeSource, prefix: &str) -> Self {
        Self {
            storage,
            time,
            namespace: format!("{}_blacklist", prefix),
        }
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}:{}", self.namespace, escape_component(identifier))
    }

    pub async fn is_blacklisted(&self, identifier: &str) -> Result<bool> {
        self.storage.exists(&self.key(identifier)).await
    }

    /// Blacklist an identifier for `duration_seconds`; 0 is permanent.
    pub async fn blacklist(&self, identifier: &str, duration_seconds: u64, reason: &str) -> Result<bool> {
        let now = self.time.now();
        let entry = BlacklistEntry {
            identifier: identifier.to_string(),
            reason: reason.to_string(),
            created_at: now,
            expires_at: if duration_seconds > 0 {
                now + duration_seconds as i64
            } else {
                0
            },
        };

        let record = serde_json::to_string(&entry)?;
        let stored = self
            .storage
            .set_with_expiry(&self.key(identifier), &record, duration_seconds)
            .await?;

        info!(
            identifier = %identifier,
            duration_seconds,
            reason = %reason,
            "Identifier blacklisted"
        );
        Ok(stored)
    }

    /// Returns whether an entry was removed.
    pub async fn remove(&self, identifier: &str) -> Result<bool> {
        let removed = self.storage.delete(&self.key(identifier)).await?;
        if removed {
            info!(identifier = %identifier, "Identifier removed from blacklist");
        }
        Ok(removed)
    }

    /// The live entry, if any. Unreadable records are reported as absent.
    pub async fn entry(&self, identifier: &str) -> Result<Option<BlacklistEntry>> {
        let Some(record) = self.storage.get(&self.key(identifier)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&record) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Unreadable blacklist record");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use std::sync::Arc;
    use std::time::Duration;

    fn manager() -> (Arc<ManualTimeSource>, BlacklistManager) {
        let time = Arc::new(ManualTimeSource::new(1_000));
        let storage = Storage::ephemeral(time.clone(), Duration::from_secs(1));
        (time.clone(), BlacklistManager::new(storage, time, "ratelimit"))
    }

    #[tokio::test]
    async fn test_permanent_blacklist() {
        let (time, manager) = manager();
        assert!(manager.blacklist("abuser", 0, "scraping").await.unwrap());

        time.advance(10 * 365 * 24 * 3600);
        assert!(manager.is_blacklisted("abuser").await.unwrap());

        let entry = manager.entry("abuser").await.unwrap().unwrap();
        assert!(entry.is_permanent());
        assert_eq!(entry.reason, "scraping");
        assert_eq!(entry.created_at, 1_000);

        assert!(manager.remove("abuser").await.unwrap());
        assert!(!manager.is_blacklisted("abuser").await.unwrap());
    }

    #[tokio::test]
    async fn test_temporary_blacklist_expires() {
        let (time, manager) = manager();
        manager.blacklist("noisy", 60, "").await.unwrap();

        let entry = manager.entry("noisy").await.unwrap().unwrap();
        assert_eq!(entry.expires_at, 1_060);

        time.advance(59);
        assert!(manager.is_blacklisted("noisy").await.unwrap());
        time.advance(1);
        assert!(!manager.is_blacklisted("noisy").await.unwrap());
        assert_eq!(manager.entry("noisy").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_missing() {
        let (_, manager) = manager();
        assert!(!manager.remove("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let (_, manager) = manager();
        manager.blacklist("a", 0, "").await.unwrap();
        assert!(!manager.is_blacklisted("b").await.unwrap());
    }
}
