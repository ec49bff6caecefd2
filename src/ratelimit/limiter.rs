//! Rate limiter facade.
//!
//! Orchestrates the hourly, minute and burst windows for a tier, and exposes
//! the blacklist and statistics subsystems next to it. Storage failures never
//! escape `check_limit` or `record_request`: they are logged and the call
//! degrades according to `fail_closed`.

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::checker::{Acquisition, Permit, WindowChecker, WindowStatus};
use super::tier::{TierLimits, TierPolicy};
use super::window::WindowType;
use crate::blacklist::{BlacklistEntry, BlacklistManager};
use crate::clock::{system_time, SharedTimeSource};
use crate::config::{AdmissionStrategy, TiergateConfig};
use crate::error::Result;
use crate::stats::{RequestStats, StatsRecorder};
use crate::storage::{Storage, StorageKind};

/// Decision returned by [`RateLimiter::check_limit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix time at which the reported window restarts
    pub reset_at: i64,
    /// Seconds to wait before retrying; 0 when allowed
    pub retry_after: u64,
    /// The window that denied the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
}

impl RateLimitResult {
    /// Result used when limiting is disabled.
    pub fn unlimited(now: i64) -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            reset_at: now + WindowType::Hourly.seconds() as i64,
            retry_after: 0,
            window: None,
        }
    }

    fn denied(status: &WindowStatus) -> Self {
        Self {
            allowed: false,
            limit: status.limit,
            remaining: status.remaining,
            reset_at: status.reset_at,
            retry_after: status.retry_after,
            window: Some(status.window.name()),
        }
    }

    fn admitted(status: &WindowStatus) -> Self {
        Self {
            allowed: true,
            limit: status.limit,
            remaining: status.remaining,
            reset_at: status.reset_at,
            retry_after: 0,
            window: None,
        }
    }

    /// Response headers describing this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after.to_string()));
            headers.push(("X-RateLimit-Retry-After", self.retry_after.to_string()));
        }
        headers
    }
}

/// Outcome of the combined blacklist and quota gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed(RateLimitResult),
    Limited(RateLimitResult),
    Blacklisted(Option<BlacklistEntry>),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed(_))
    }
}

/// The admission engine.
///
/// This struct is thread-safe and can be shared across tasks behind an `Arc`.
pub struct RateLimiter {
    config: TiergateConfig,
    storage: Storage,
    time: SharedTimeSource,
    checker: WindowChecker,
    tiers: RwLock<TierPolicy>,
    blacklist: BlacklistManager,
    stats: StatsRecorder,
}

impl RateLimiter {
    /// Connect the configured backend (falling back to ephemeral storage if
    /// it is unreachable) and build a limiter on the wall clock.
    pub async fn connect(config: TiergateConfig) -> Self {
        let time = system_time();
        let storage = Storage::connect(&config, time.clone()).await;
        Self::with_storage(config, storage, time)
    }

    /// Build a limiter over an already selected backend.
    pub fn with_storage(config: TiergateConfig, storage: Storage, time: SharedTimeSource) -> Self {
        let prefix = config.key_prefix.clone();
        Self {
            checker: WindowChecker::new(storage.clone(), time.clone(), &prefix),
            blacklist: BlacklistManager::new(storage.clone(), time.clone(), &prefix),
            stats: StatsRecorder::new(storage.clone(), time.clone(), &prefix),
            tiers: RwLock::new(config.tiers.clone()),
            config,
            storage,
            time,
        }
    }

    /// The backend in use after any fallback.
    pub fn storage_kind(&self) -> StorageKind {
        self.storage.kind()
    }

    pub fn tier_policy(&self) -> TierPolicy {
        self.tiers.read().clone()
    }

    /// Replace the tier table.
    pub fn set_tier_policy(&self, policy: TierPolicy) {
        *self.tiers.write() = policy;
    }

    fn tier_windows(limits: TierLimits) -> [(WindowType, u64); 3] {
        [
            (WindowType::Hourly, limits.requests_per_hour),
            (WindowType::Minute, limits.requests_per_minute),
            (WindowType::Burst, limits.burst_limit),
        ]
    }

    /// Check the hourly, minute and burst windows of `tier` and, when all
    /// pass, count the request against each of them.
    ///
    /// A denial reports the first failing window in the order hourly, minute,
    /// burst, and leaves every counter unchanged. An admission reports the
    /// hourly limit and reset time with the smallest remaining count of the
    /// three windows.
    pub async fn check_limit(&self, identifier: &str, endpoint: &str, tier: &str) -> RateLimitResult {
        let now = self.time.now();
        if !self.config.enabled {
            return RateLimitResult::unlimited(now);
        }

        let limits = self.tiers.read().limits_for(tier);
        let windows = Self::tier_windows(limits);

        let outcome = match self.config.admission {
            AdmissionStrategy::Atomic => self.admit_atomic(identifier, endpoint, &windows).await,
            AdmissionStrategy::CheckThenIncrement => {
                self.admit_check_then_increment(identifier, endpoint, &windows).await
            }
        };

        match outcome {
            Ok(result) => {
                if !result.allowed {
                    debug!(
                        identifier = %identifier,
                        endpoint = %endpoint,
                        tier = %tier,
                        window = ?result.window,
                        retry_after = result.retry_after,
                        "Rate limit exceeded"
                    );
                }
                result
            }
            Err(e) => {
                error!(
                    identifier = %identifier,
                    endpoint = %endpoint,
                    error = %e,
                    unavailable = e.is_unavailable(),
                    fail_closed = self.config.fail_closed,
                    "Rate limit check failed"
                );
                self.degraded(now, limits.requests_per_hour)
            }
        }
    }

    async fn admit_atomic(
        &self,
        identifier: &str,
        endpoint: &str,
        windows: &[(WindowType, u64)],
    ) -> Result<RateLimitResult> {
        let mut acquired: Vec<Permit> = Vec::with_capacity(windows.len());

        for &(window, limit) in windows {
            match self.checker.acquire(identifier, endpoint, window, limit).await {
                Ok(Acquisition::Admitted(permit)) => acquired.push(permit),
                Ok(Acquisition::Denied(status)) => {
                    self.release_all(identifier, endpoint, &acquired).await;
                    return Ok(RateLimitResult::denied(&status));
                }
                Err(e) => {
                    self.release_all(identifier, endpoint, &acquired).await;
                    return Err(e);
                }
            }
        }

        let statuses: Vec<WindowStatus> = acquired.iter().map(|permit| permit.status).collect();
        Ok(Self::composite(&statuses))
    }

    async fn admit_check_then_increment(
        &self,
        identifier: &str,
        endpoint: &str,
        windows: &[(WindowType, u64)],
    ) -> Result<RateLimitResult> {
        let mut passed: Vec<WindowStatus> = Vec::with_capacity(windows.len());

        for &(window, limit) in windows {
            let status = self.checker.evaluate(identifier, endpoint, window, limit).await?;
            if !status.allowed {
                return Ok(RateLimitResult::denied(&status));
            }
            passed.push(status);
        }

        // Not atomic with the reads above
        for status in passed.iter_mut() {
            let count = self.checker.increment(identifier, endpoint, status.window).await?;
            status.count = count;
            status.remaining = status.limit.saturating_sub(count);
        }

        Ok(Self::composite(&passed))
    }

    fn composite(statuses: &[WindowStatus]) -> RateLimitResult {
        let remaining = statuses.iter().map(|s| s.remaining).min().unwrap_or(0);
        match statuses.first() {
            Some(primary) => RateLimitResult {
                remaining,
                ..RateLimitResult::admitted(primary)
            },
            None => RateLimitResult {
                allowed: true,
                limit: 0,
                remaining,
                reset_at: 0,
                retry_after: 0,
                window: None,
            },
        }
    }

    async fn release_all(&self, identifier: &str, endpoint: &str, acquired: &[Permit]) {
        for permit in acquired {
            self.checker.release(identifier, endpoint, permit).await;
        }
    }

    /// Result used when storage failed mid-check.
    fn degraded(&self, now: i64, limit: u64) -> RateLimitResult {
        if self.config.fail_closed {
            let retry_after = WindowType::Burst.seconds();
            RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: now + retry_after as i64,
                retry_after,
                window: None,
            }
        } else {
            RateLimitResult {
                allowed: true,
                limit,
                remaining: limit,
                reset_at: now + WindowType::Hourly.seconds() as i64,
                retry_after: 0,
                window: None,
            }
        }
    }

    /// Blacklist gate followed by [`check_limit`](Self::check_limit).
    ///
    /// `check_limit` itself never consults the blacklist; callers that want
    /// both checks in one call use this.
    pub async fn check_request(&self, identifier: &str, endpoint: &str, tier: &str) -> Admission {
        if self.is_blacklisted(identifier).await {
            debug!(identifier = %identifier, "Blacklisted identifier denied");
            let entry = self.blacklist_entry(identifier).await;
            return Admission::Blacklisted(entry);
        }

        let result = self.check_limit(identifier, endpoint, tier).await;
        if result.allowed {
            Admission::Allowed(result)
        } else {
            Admission::Limited(result)
        }
    }

    /// Check a single fixed window, defaulting to `default_limit` and
    /// `default_window_seconds`.
    pub async fn check_custom_window(
        &self,
        identifier: &str,
        endpoint: &str,
        limit: Option<u64>,
        window_seconds: Option<u64>,
    ) -> RateLimitResult {
        let now = self.time.now();
        if !self.config.enabled {
            return RateLimitResult::unlimited(now);
        }

        let limit = limit.unwrap_or(self.config.default_limit);
        let seconds = window_seconds
            .filter(|secs| *secs > 0)
            .unwrap_or(self.config.default_window_seconds);
        let windows = [(WindowType::Custom(seconds), limit)];

        let outcome = match self.config.admission {
            AdmissionStrategy::Atomic => self.admit_atomic(identifier, endpoint, &windows).await,
            AdmissionStrategy::CheckThenIncrement => {
                self.admit_check_then_increment(identifier, endpoint, &windows).await
            }
        };

        outcome.unwrap_or_else(|e| {
            error!(identifier = %identifier, endpoint = %endpoint, error = %e, "Window check failed");
            self.degraded(now, limit)
        })
    }

    /// Read-only view of the three tier windows.
    pub async fn window_status(&self, identifier: &str, endpoint: &str, tier: &str) -> Result<Vec<WindowStatus>> {
        let limits = self.tiers.read().limits_for(tier);
        let mut statuses = Vec::with_capacity(3);
        for (window, limit) in Self::tier_windows(limits) {
            statuses.push(self.checker.evaluate(identifier, endpoint, window, limit).await?);
        }
        Ok(statuses)
    }

    /// Record the outcome of a request. Never fails.
    pub async fn record_request(&self, identifier: &str, endpoint: &str, success: bool) {
        if let Err(e) = self.stats.record(identifier, endpoint, success).await {
            warn!(identifier = %identifier, endpoint = %endpoint, error = %e, "Failed to record request");
        }
    }

    pub async fn get_stats(&self, identifier: &str, endpoint: &str) -> Result<RequestStats> {
        self.stats.get(identifier, endpoint).await
    }

    pub async fn reset_stats(&self, identifier: &str, endpoint: &str) -> bool {
        match self.stats.reset(identifier, endpoint).await {
            Ok(done) => done,
            Err(e) => {
                error!(identifier = %identifier, endpoint = %endpoint, error = %e, "Failed to reset stats");
                false
            }
        }
    }

    /// Delete every window counter of an identifier, optionally only for one
    /// endpoint.
    pub async fn reset_limits(&self, identifier: &str, endpoint: Option<&str>) -> bool {
        let pattern = self.checker.pattern(identifier, endpoint);
        match self.storage.clear_keys(&pattern).await {
            Ok(done) => {
                debug!(identifier = %identifier, endpoint = ?endpoint, "Limits reset");
                done
            }
            Err(e) => {
                error!(identifier = %identifier, endpoint = ?endpoint, error = %e, "Failed to reset limits");
                false
            }
        }
    }

    /// Seconds until the hourly window restarts.
    pub async fn get_time_until_reset(&self, identifier: &str, endpoint: &str) -> u64 {
        let key = self.checker.key(identifier, endpoint, WindowType::Hourly);
        let now = self.time.now();
        match self.storage.get_reset_time(&key, WindowType::Hourly.seconds()).await {
            Ok(reset_at) => (reset_at - now).max(0) as u64,
            Err(e) => {
                warn!(identifier = %identifier, endpoint = %endpoint, error = %e, "Failed to read reset time");
                0
            }
        }
    }

    /// Whether the identifier has a live blacklist entry. A storage failure
    /// answers `fail_closed`.
    pub async fn is_blacklisted(&self, identifier: &str) -> bool {
        match self.blacklist.is_blacklisted(identifier).await {
            Ok(listed) => listed,
            Err(e) => {
                error!(identifier = %identifier, error = %e, "Blacklist check failed");
                self.config.fail_closed
            }
        }
    }

    pub async fn blacklist(&self, identifier: &str, duration_seconds: u64, reason: &str) -> bool {
        match self.blacklist.blacklist(identifier, duration_seconds, reason).await {
            Ok(stored) => stored,
            Err(e) => {
                error!(identifier = %identifier, error = %e, "Failed to blacklist identifier");
                false
            }
        }
    }

    pub async fn remove_from_blacklist(&self, identifier: &str) -> bool {
        match self.blacklist.remove(identifier).await {
            Ok(removed) => removed,
            Err(e) => {
                error!(identifier = %identifier, error = %e, "Failed to remove blacklist entry");
                false
            }
        }
    }

    pub async fn blacklist_entry(&self, identifier: &str) -> Option<BlacklistEntry> {
        match self.blacklist.entry(identifier).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Failed to read blacklist entry");
                None
            }
        }
    }
}
