//! Time sources used for window arithmetic.
//!
//! All timestamps are unix seconds. Production code uses [`SystemTimeSource`];
//! tests drive window rollover with [`ManualTimeSource`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of the current unix time in seconds.
pub trait TimeSource: Send + Sync {
    /// Current unix timestamp in seconds.
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    time: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(initial: i64) -> Self {
        Self {
            time: AtomicI64::new(initial),
        }
    }

    pub fn advance(&self, secs: i64) {
        self.time.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, time: i64) {
        self.time.store(time, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> i64 {
        self.time.load(Ordering::SeqCst)
    }
}

/// Shared handle to a time source.
pub type SharedTimeSource = Arc<dyn TimeSource>;

/// The default shared wall clock.
pub fn system_time() -> SharedTimeSource {
    Arc::new(SystemTimeSource)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_time_source() {
        // After Jan 1, 2020
        assert!(SystemTimeSource.now() > 1_577_836_800);
    }

    #[test]
    fn test_manual_time_source() {
        let source = ManualTimeSource::new(1000);
        assert_eq!(source.now(), 1000);

        source.advance(60);
        assert_eq!(source.now(), 1060);

        source.set(5000);
        assert_eq!(source.now(), 5000);
    }
}
