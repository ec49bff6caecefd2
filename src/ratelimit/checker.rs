//! Evaluation of a single fixed window against its limit.

use serde::Serialize;
use tracing::{debug, trace, warn};

use super::window::{WindowKey, WindowType};
use crate::clock::SharedTimeSource;
use crate::error::Result;
use crate::storage::{Storage, WindowId};

/// State of one window for one identifier/endpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    #[serde(serialize_with = "serialize_window")]
    pub window: WindowType,
    pub allowed: bool,
    pub limit: u64,
    /// Requests counted in the current window
    pub count: u64,
    pub remaining: u64,
    /// Unix time at which the window restarts
    pub reset_at: i64,
    /// Seconds to wait before retrying; 0 when allowed
    pub retry_after: u64,
}

fn serialize_window<S: serde::Serializer>(window: &WindowType, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&window.name())
}

impl WindowStatus {
    fn new(window: WindowType, limit: u64, count: u64, reset_at: i64, now: i64) -> Self {
        let allowed = count < limit;
        Self {
            window,
            allowed,
            limit,
            count,
            remaining: limit.saturating_sub(count),
            reset_at,
            retry_after: if allowed { 0 } else { (reset_at - now).max(0) as u64 },
        }
    }
}

/// A request counted against one window.
///
/// Carries the identity of the window it landed in, so releasing it can never
/// take a slot from a window that opened afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub status: WindowStatus,
    window_id: WindowId,
}

/// Outcome of [`WindowChecker::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    Admitted(Permit),
    Denied(WindowStatus),
}

impl Acquisition {
    pub fn status(&self) -> &WindowStatus {
        match self {
            Acquisition::Admitted(permit) => &permit.status,
            Acquisition::Denied(status) => status,
        }
    }
}

/// Checks and updates window counters in storage.
#[derive(Clone)]
pub struct WindowChecker {
    storage: Storage,
    time: SharedTimeSource,
    prefix: String,
}

impl WindowChecker {
    pub fn new(storage: Storage, time: SharedTimeSource, prefix: &str) -> Self {
        Self {
            storage,
            time,
            prefix: prefix.to_string(),
        }
    }

    pub fn key(&self, identifier: &str, endpoint: &str, window: WindowType) -> String {
        WindowKey::new(&self.prefix, identifier, endpoint, window).to_storage_key()
    }

    /// Pattern covering every window of an identifier, optionally one endpoint.
    pub fn pattern(&self, identifier: &str, endpoint: Option<&str>) -> String {
        WindowKey::pattern(&self.prefix, identifier, endpoint)
    }

    /// Read-only evaluation.
    ///
    /// A window whose reset time has passed counts as empty and reports a
    /// fresh reset time, whether or not the backing record still exists.
    pub async fn evaluate(
        &self,
        identifier: &str,
        endpoint: &str,
        window: WindowType,
        limit: u64,
    ) -> Result<WindowStatus> {
        let key = self.key(identifier, endpoint, window);
        let now = self.time.now();

        let mut count = self.storage.get_count(&key).await?;
        let mut reset_at = self.storage.get_reset_time(&key, window.seconds()).await?;
        if reset_at <= now {
            count = 0;
            reset_at = now + window.seconds() as i64;
        }

        let status = WindowStatus::new(window, limit, count, reset_at, now);
        trace!(key = %key, count, limit, allowed = status.allowed, "Evaluated window");
        Ok(status)
    }

    /// Count one request against the window. Returns the post-increment count.
    pub async fn increment(&self, identifier: &str, endpoint: &str, window: WindowType) -> Result<u64> {
        let key = self.key(identifier, endpoint, window);
        Ok(self.storage.increment(&key, window.seconds()).await?.count)
    }

    /// Increment first, then compare: the post-increment count decides.
    ///
    /// An over-limit increment is undone before returning, so a denial
    /// leaves the counter where it was. Concurrent callers can never push
    /// the admitted count past the limit. The undo only applies to the window
    /// the increment landed in; if that window has already rolled over it is
    /// a no-op.
    pub async fn acquire(
        &self,
        identifier: &str,
        endpoint: &str,
        window: WindowType,
        limit: u64,
    ) -> Result<Acquisition> {
        let key = self.key(identifier, endpoint, window);
        let counted = self.storage.increment(&key, window.seconds()).await?;
        let reset_at = self.storage.get_reset_time(&key, window.seconds()).await?;
        let now = self.time.now();
        let count = counted.count;

        if count > limit {
            let undone = self.storage.decrement(&key, counted.window).await?;
            debug!(key = %key, count, limit, undone, "Window over limit");
            // Report the count as it stands without this request
            return Ok(Acquisition::Denied(WindowStatus::new(
                window,
                limit,
                count - 1,
                reset_at,
                now,
            )));
        }

        let mut status = WindowStatus::new(window, limit, count, reset_at, now);
        // This request is inside the limit even when it used the last slot
        status.allowed = true;
        status.retry_after = 0;
        Ok(Acquisition::Admitted(Permit {
            status,
            window_id: counted.window,
        }))
    }

    /// Undo an acquired request. Failures are logged, not returned.
    pub async fn release(&self, identifier: &str, endpoint: &str, permit: &Permit) {
        let key = self.key(identifier, endpoint, permit.status.window);
        match self.storage.decrement(&key, permit.window_id).await {
            Ok(true) => {}
            Ok(false) => trace!(key = %key, "Window rolled over before release"),
            Err(e) => warn!(key = %key, error = %e, "Failed to release window slot"),
        }
    }
}
