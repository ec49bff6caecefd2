//! Tiered fixed-window rate limiting.

pub mod checker;
mod limiter;
pub mod tier;
pub mod window;

pub use checker::{Acquisition, Permit, WindowChecker, WindowStatus};
pub use limiter::{Admission, RateLimitResult, RateLimiter};
pub use tier::{Tier, TierLimits, TierPolicy};
pub use window::{WindowKey, WindowType, DEFAULT_ENDPOINT};
