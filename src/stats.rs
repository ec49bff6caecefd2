//! Per identifier/endpoint request statistics.
//!
//! Counters only ever grow until [`StatsRecorder::reset`] is called.
//! `first_request` is written once; later writes never replace it.

use serde::Serialize;
use tracing::debug;

use crate::clock::SharedTimeSource;
use crate::error::{Result, TiergateError};
use crate::ratelimit::window::escape_component;
use crate::storage::Storage;

/// Aggregated statistics for one identifier/endpoint pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Percentage of successful requests, 100.0 when nothing was recorded
    pub success_rate: f64,
    /// Unix seconds of the most recent request
    pub last_request: Option<i64>,
    /// Unix seconds of the first request
    pub first_request: Option<i64>,
}

impl RequestStats {
    fn new(total: u64, successful: u64, failed: u64, first: Option<i64>, last: Option<i64>) -> Self {
        let success_rate = if total == 0 {
            100.0
        } else {
            (successful as f64 / total as f64 * 10_000.0).round() / 100.0
        };
        Self {
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            success_rate,
            last_request: last,
            first_request: first,
        }
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new(0, 0, 0, None, None)
    }
}

#[derive(Clone, Copy)]
enum Field {
    Total,
    Successful,
    Failed,
    First,
    Last,
}

impl Field {
    const ALL: [Field; 5] = [Field::Total, Field::Successful, Field::Failed, Field::First, Field::Last];

    fn name(&self) -> &'static str {
        match self {
            Field::Total => "total",
            Field::Successful => "success",
            Field::Failed => "failed",
            Field::First => "first",
            Field::Last => "last",
        }
    }
}

/// Accumulates request outcomes.
#[derive(Clone)]
pub struct StatsRecorder {
    storage: Storage,
    time: SharedTimeSource,
    namespace: String,
}

impl StatsRecorder {
    pub fn new(storage: Storage, time: SharedTimeSource, prefix: &str) -> Self {
        Self {
            storage,
            time,
            namespace: format!("{}_stats", prefix),
        }
    }

    fn key(&self, identifier: &str, endpoint: &str, field: Field) -> String {
        format!(
            "{}:{}:{}:{}",
            self.namespace,
            escape_component(identifier),
            escape_component(endpoint),
            field.name()
        )
    }

    /// Record one request outcome.
    pub async fn record(&self, identifier: &str, endpoint: &str, success: bool) -> Result<()> {
        let now = self.time.now().to_string();

        self.storage
            .increment(&self.key(identifier, endpoint, Field::Total), 0)
            .await?;
        let outcome = if success { Field::Successful } else { Field::Failed };
        self.storage
            .increment(&self.key(identifier, endpoint, outcome), 0)
            .await?;

        self.storage
            .set_if_absent(&self.key(identifier, endpoint, Field::First), &now, 0)
            .await?;
        self.storage
            .set_with_expiry(&self.key(identifier, endpoint, Field::Last), &now, 0)
            .await?;

        debug!(identifier = %identifier, endpoint = %endpoint, success, "Recorded request");
        Ok(())
    }

    pub async fn get(&self, identifier: &str, endpoint: &str) -> Result<RequestStats> {
        let total = self
            .storage
            .get_count(&self.key(identifier, endpoint, Field::Total))
            .await?;
        let successful = self
            .storage
            .get_count(&self.key(identifier, endpoint, Field::Successful))
            .await?;
        let failed = self
            .storage
            .get_count(&self.key(identifier, endpoint, Field::Failed))
            .await?;
        let first = self.timestamp(identifier, endpoint, Field::First).await?;
        let last = self.timestamp(identifier, endpoint, Field::Last).await?;

        Ok(RequestStats::new(total, successful, failed, first, last))
    }

    /// Drop all statistics for the pair.
    pub async fn reset(&self, identifier: &str, endpoint: &str) -> Result<bool> {
        for field in Field::ALL {
            self.storage.delete(&self.key(identifier, endpoint, field)).await?;
        }
        Ok(true)
    }

    async fn timestamp(&self, identifier: &str, endpoint: &str, field: Field) -> Result<Option<i64>> {
        match self.storage.get(&self.key(identifier, endpoint, field)).await? {
            Some(raw) => raw
                .parse::<i64>()
                .map(Some)
                .map_err(|e| TiergateError::Storage(format!("invalid timestamp {:?}: {}", raw, e))),
            None => Ok(None),
        }
    }
}
