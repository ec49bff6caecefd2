//! Relational storage: one SQLite row per key.
//!
//! Each write is a single statement. Increment is an upsert with `RETURNING`,
//! which SQLite executes atomically, so concurrent increments on the same
//! window never lose updates.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use super::{Counted, StorageBackend, StorageKind, WindowId};
use crate::clock::SharedTimeSource;
use crate::config::DatabaseConfig;
use crate::error::{Result, TiergateError};

/// SQLite storage backend.
pub struct SqlStore {
    pool: SqlitePool,
    table: String,
    time: SharedTimeSource,
}

impl SqlStore {
    /// Open the pool and create the table if needed.
    pub async fn connect(config: &DatabaseConfig, time: SharedTimeSource) -> Result<Self> {
        validate_table_name(&config.table)?;

        let options = SqliteConnectOptions::from_str(&config.url)?;
        let in_memory = config.url.contains(":memory:");

        // Every connection to `:memory:` is its own database, so keep exactly one.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };
        let pool = pool_options.connect_with(options).await?;

        let store = Self {
            pool,
            table: config.table.clone(),
            time,
        };
        store.migrate().await?;

        info!(url = %config.url, table = %config.table, "Connected to relational store");
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                rate_key TEXT PRIMARY KEY NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                value TEXT,
                expires_at INTEGER NOT NULL DEFAULT 0
            )",
            t = self.table
        );
        sqlx::query(&create).execute(&self.pool).await?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS {t}_expires_at ON {t} (expires_at)",
            t = self.table
        );
        sqlx::query(&index).execute(&self.pool).await?;
        Ok(())
    }

    fn expiry_from(&self, now: i64, expiry_seconds: u64) -> i64 {
        if expiry_seconds > 0 {
            now + expiry_seconds as i64
        } else {
            0
        }
    }

    /// Live `(count, value, expires_at)` for a key.
    async fn live_row(&self, key: &str) -> Result<Option<(i64, Option<String>, i64)>> {
        let sql = format!(
            "SELECT count, value, expires_at FROM {} \
             WHERE rate_key = ?1 AND (expires_at = 0 OR expires_at > ?2)",
            self.table
        );
        let row = sqlx::query_as::<_, (i64, Option<String>, i64)>(&sql)
            .bind(key)
            .bind(self.time.now())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl StorageBackend for SqlStore {
    async fn get_count(&self, key: &str) -> Result<u64> {
        Ok(self
            .live_row(key)
            .await?
            .map_or(0, |(count, _, _)| count.max(0) as u64))
    }

    async fn get_reset_time(&self, key: &str, window_seconds: u64) -> Result<i64> {
        let now = self.time.now();
        Ok(match self.live_row(key).await? {
            Some((_, _, expires_at)) if expires_at != 0 => expires_at,
            _ => now + window_seconds as i64,
        })
    }

    async fn increment(&self, key: &str, expiry_seconds: u64) -> Result<Counted> {
        let now = self.time.now();
        let sql = format!(
            "INSERT INTO {t} (rate_key, count, value, expires_at) VALUES (?1, 1, NULL, ?2)
             ON CONFLICT(rate_key) DO UPDATE SET
                count = CASE WHEN expires_at != 0 AND expires_at <= ?3 THEN 1 ELSE count + 1 END,
                value = CASE WHEN expires_at != 0 AND expires_at <= ?3 THEN NULL ELSE value END,
                expires_at = CASE
                    WHEN expires_at != 0 AND expires_at <= ?3 THEN excluded.expires_at
                    WHEN expires_at = 0 THEN excluded.expires_at
                    ELSE expires_at
                END
             RETURNING count, expires_at",
            t = self.table
        );
        let (count, expires_at): (i64, i64) = sqlx::query_as(&sql)
            .bind(key)
            .bind(self.expiry_from(now, expiry_seconds))
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        Ok(Counted {
            count: count.max(0) as u64,
            window: WindowId(expires_at),
        })
    }

    async fn decrement(&self, key: &str, window: WindowId) -> Result<bool> {
        // The window's expiry pins the row version the increment produced.
        let sql = format!(
            "UPDATE {} SET count = count - 1 \
             WHERE rate_key = ?1 AND count > 0 AND expires_at = ?3 \
             AND (expires_at = 0 OR expires_at > ?2)",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(key)
            .bind(self.time.now())
            .bind(window.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live_row(key).await?.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .live_row(key)
            .await?
            .map(|(count, value, _)| value.unwrap_or_else(|| count.to_string())))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool> {
        let now = self.time.now();
        let sql = format!(
            "INSERT INTO {} (rate_key, count, value, expires_at) VALUES (?1, 0, ?2, ?3)
             ON CONFLICT(rate_key) DO UPDATE SET
                count = 0, value = excluded.value, expires_at = excluded.expires_at",
            self.table
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .bind(self.expiry_from(now, expiry_seconds))
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn set_if_absent(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<bool> {
        let now = self.time.now();
        let sql = format!(
            "INSERT INTO {} (rate_key, count, value, expires_at) VALUES (?1, 0, ?2, ?3)
             ON CONFLICT(rate_key) DO UPDATE SET
                count = 0, value = excluded.value, expires_at = excluded.expires_at
             WHERE expires_at != 0 AND expires_at <= ?4",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .bind(self.expiry_from(now, expiry_seconds))
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE rate_key = ?1 \
             RETURNING CASE WHEN expires_at = 0 OR expires_at > ?2 THEN 1 ELSE 0 END",
            self.table
        );
        let was_live: Option<i64> = sqlx::query_scalar(&sql)
            .bind(key)
            .bind(self.time.now())
            .fetch_optional(&self.pool)
            .await?;
        Ok(was_live.map_or(false, |live| live != 0))
    }

    async fn clear_keys(&self, pattern: &str) -> Result<bool> {
        match pattern.strip_suffix('*') {
            Some(prefix) => {
                let sql = format!(
                    "DELETE FROM {} WHERE rate_key LIKE ?1 ESCAPE '\\'",
                    self.table
                );
                sqlx::query(&sql)
                    .bind(format!("{}%", escape_like(prefix)))
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                self.delete(pattern).await?;
            }
        }
        Ok(true)
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<u64>> {
        let now = self.time.now();
        Ok(match self.live_row(key).await? {
            Some((_, _, expires_at)) if expires_at != 0 => Some((expires_at - now).max(0) as u64),
            _ => None,
        })
    }

    async fn purge_expired(&self) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE expires_at != 0 AND expires_at <= ?1",
            self.table
        );
        let result = sqlx::query(&sql)
            .bind(self.time.now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Relational
    }
}

fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(TiergateError::Config(format!("Invalid table name: {}", table)))
    }
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
