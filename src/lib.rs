//! Tiergate - Tiered Rate Limiting Engine
//!
//! This crate admits or denies requests per identifier and endpoint using
//! three fixed windows (hourly, minute and burst) sized by a subscription
//! tier. Counters live in a pluggable storage backend: an in-process map, a
//! Redis cache shared between instances, or a SQLite table. A blacklist
//! overlay and per-endpoint request statistics sit next to the limiter.

pub mod blacklist;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod stats;
pub mod storage;
