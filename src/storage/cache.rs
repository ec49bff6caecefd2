//! Distributed cache storage backed by Redis.
//!
//! Counters are plain Redis integers. Increment and expiry run inside one Lua
//! script, so a window key can never exist without its TTL. A window is
//! identified by its absolute expiry in milliseconds, derived from server
//! time so every client agrees on it.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use super::{Counted, StorageBackend, StorageKind, WindowId};
use crate::clock::SharedTimeSource;
use crate::config::RedisConfig;
use crate::error::Result;

const WINDOW_FN: &str = r#"
local function window_of(key)
    local pttl = redis.call('PTTL', key)
    if pttl <= 0 then
        return 0
    end
    local now = redis.call('TIME')
    return tonumber(now[1]) * 1000 + math.floor(tonumber(now[2]) / 1000) + pttl
end
"#;

const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
local expiry = tonumber(ARGV[1])
if expiry > 0 and (current == 1 or redis.call('TTL', KEYS[1]) < 0) then
    redis.call('EXPIRE', KEYS[1], expiry)
end
return {current, window_of(KEYS[1])}
"#;

// Consecutive windows on one key are at least a second apart, so a drift
// under that still names the same window.
const DECREMENT_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0') or 0
local expected = tonumber(ARGV[1])
if current > 0 and math.abs(window_of(KEYS[1]) - expected) < 500 then
    redis.call('DECR', KEYS[1])
    return 1
end
return 0
"#;

/// Number of keys requested per `SCAN` round trip.
const SCAN_BATCH: usize = 500;

/// Redis storage backend.
///
/// The multiplexed connection is cheap to clone and safe to share between
/// concurrent requests.
pub struct RedisStore {
    conn: MultiplexedConnection,
    increment_script: Script,
    decrement_script: Script,
    time: SharedTimeSource,
}

impl RedisStore {
    /// Open a connection and verify it with `PING`.
    pub async fn connect(config: &RedisConfig, time: SharedTimeSource) -> Result<Self> {
        let client = redis::Client::open(config.connection_info())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(host = %config.host, port = config.port, database = config.database, "Connected to Redis");

        Ok(Self {
            conn,
            increment_script: Script::new(&format!("{}{}", WINDOW_FN, INCREMENT_SCRIPT)),
            decrement_script: Script::new(&format!("{}{}", WINDOW_FN, DECREMENT_SCRIPT)),
            time,
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl StorageBackend for RedisStore {
    async fn get_count(&self, key: &str) -> Result<u64> {
        let count: Option<u64> = self.conn().get(key).await?;
        Ok(count.unwrap_or(0))
    }

    async fn get_reset_time(&self, key: &str, window_seconds: u64) -> Result<i64> {
        let ttl: i64 = self.conn().ttl(key).await?;
        let now = self.time.now();
        // -2: missing, -1: no expiry
        Ok(if ttl > 0 { now + ttl } else { now + window_seconds as i64 })
    }

    async fn increment(&self, key: &str, expiry_seconds: u64) -> Result<Counted> {
        let mut conn = self.conn();
        let (count, window): (u64, i64) = self
            .increment_script
            .key(key)
            .arg(expiry_seconds)
            .invoke_async(&mut conn)
            .await?;
        Ok(Counted {
            count,
            window: WindowId(window),
        })
    }

    async fn decrement(&self, key: &str, window: WindowId) -> Result<bool> {
        let mut conn = self.conn();
        let changed: u64 = self
            .decrement_script
            .key(key)
            .arg(window.0)
            .invoke_async(&mut conn)
            .await?;
        Ok(changed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let exists: bool = self.conn().exists(key).await?;
        Ok(exists)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.conn().get(key).await?;
        Ok(value)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool> {
        let mut conn = self.conn();
        if expiry_seconds > 0 {
            let _: () = conn.set_ex(key, value, expiry_seconds).await?;
        } else {
            let _: () = conn.set(key, value).await?;
        }
        Ok(true)
    }

    async fn set_if_absent(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if expiry_seconds > 0 {
            cmd.arg("EX").arg(expiry_seconds);
        }
        let reply: Option<String> = cmd.query_async(&mut self.conn()).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed: u64 = self.conn().del(key).await?;
        Ok(removed > 0)
    }

    async fn clear_keys(&self, pattern: &str) -> Result<bool> {
        if !pattern.ends_with('*') {
            self.delete(pattern).await?;
            return Ok(true);
        }

        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let n: u64 = conn.del(&keys).await?;
                removed += n;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, removed, "Cleared keys");
        Ok(true)
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<u64>> {
        let ttl: i64 = self.conn().ttl(key).await?;
        Ok((ttl > 0).then_some(ttl as u64))
    }

    async fn purge_expired(&self) -> Result<u64> {
        // Redis evicts expired keys itself.
        Ok(0)
    }

    fn kind(&self) -> StorageKind {
        StorageKind::DistributedCache
    }
}
