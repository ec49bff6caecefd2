use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tiergate::config::TiergateConfig;
use tiergate::ratelimit::{RateLimiter, TierPolicy, DEFAULT_ENDPOINT};
use tiergate::storage::StorageKind;

#[derive(Parser, Debug)]
#[command(name = "tiergate", version, about = "Tiered fixed-window rate limiting engine")]
struct Args {
    /// YAML configuration file; TIERGATE_* environment variables are used when absent
    #[arg(long, short)]
    config: Option<String>,

    /// Override the configured storage backend (ephemeral, distributed_cache, relational)
    #[arg(long)]
    storage: Option<StorageKind>,

    /// YAML file with tier limits, replacing the configured tiers
    #[arg(long)]
    tiers: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check (and count) requests for an identifier
    Check {
        identifier: String,
        #[arg(long, default_value = DEFAULT_ENDPOINT)]
        endpoint: String,
        #[arg(long, default_value = "basic")]
        tier: String,
        /// Number of consecutive checks to run
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Show request statistics
    Stats {
        identifier: String,
        #[arg(long, default_value = DEFAULT_ENDPOINT)]
        endpoint: String,
    },
    /// Clear window counters; all endpoints unless one is given
    Reset {
        identifier: String,
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Manage the blacklist
    Blacklist {
        #[command(subcommand)]
        action: BlacklistAction,
    },
}

#[derive(Subcommand, Debug)]
enum BlacklistAction {
    Add {
        identifier: String,
        /// Seconds; 0 blacklists permanently
        #[arg(long, default_value_t = 0)]
        duration: u64,
        #[arg(long, default_value = "")]
        reason: String,
    },
    Remove {
        identifier: String,
    },
    Status {
        identifier: String,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<TiergateConfig> {
    let mut config = match &args.config {
        Some(path) => TiergateConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => TiergateConfig::from_env().context("failed to load configuration from environment")?,
    };
    if let Some(kind) = args.storage {
        config.storage = kind;
    }
    if let Some(path) = &args.tiers {
        config.tiers =
            TierPolicy::from_file(path).with_context(|| format!("failed to load tiers from {}", path))?;
    }
    Ok(config)
}

/// Stats output for the CLI. A storage failure is reported in the output
/// rather than aborting the command.
async fn stats_report(limiter: &RateLimiter, identifier: &str, endpoint: &str) -> serde_json::Value {
    let reset_in = limiter.get_time_until_reset(identifier, endpoint).await;
    match limiter.get_stats(identifier, endpoint).await {
        Ok(stats) => json!({
            "identifier": identifier,
            "endpoint": endpoint,
            "stats": stats,
            "seconds_until_reset": reset_in,
        }),
        Err(e) => {
            error!(identifier = %identifier, endpoint = %endpoint, error = %e, "Failed to read stats");
            json!({
                "identifier": identifier,
                "endpoint": endpoint,
                "stats": null,
                "seconds_until_reset": reset_in,
                "error": e.to_string(),
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = load_config(&args)?;
    info!(
        storage = %config.storage,
        enabled = config.enabled,
        admission = ?config.admission,
        "Configuration loaded"
    );

    let limiter = RateLimiter::connect(config).await;
    info!(storage = %limiter.storage_kind(), "Rate limiter initialized");

    let output = match args.command {
        Command::Check {
            identifier,
            endpoint,
            tier,
            count,
        } => {
            let mut results = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let result = limiter.check_limit(&identifier, &endpoint, &tier).await;
                limiter.record_request(&identifier, &endpoint, result.allowed).await;
                results.push(result);
            }
            json!({
                "identifier": identifier,
                "endpoint": endpoint,
                "tier": tier,
                "storage": limiter.storage_kind().as_str(),
                "results": results,
            })
        }
        Command::Stats { identifier, endpoint } => stats_report(&limiter, &identifier, &endpoint).await,
        Command::Reset { identifier, endpoint } => {
            let reset = limiter.reset_limits(&identifier, endpoint.as_deref()).await;
            json!({ "identifier": identifier, "endpoint": endpoint, "reset": reset })
        }
        Command::Blacklist { action } => match action {
            BlacklistAction::Add {
                identifier,
                duration,
                reason,
            } => {
                let stored = limiter.blacklist(&identifier, duration, &reason).await;
                json!({ "identifier": identifier, "blacklisted": stored })
            }
            BlacklistAction::Remove { identifier } => {
                let removed = limiter.remove_from_blacklist(&identifier).await;
                json!({ "identifier": identifier, "removed": removed })
            }
            BlacklistAction::Status { identifier } => {
                let blacklisted = limiter.is_blacklisted(&identifier).await;
                let entry = limiter.blacklist_entry(&identifier).await;
                json!({ "identifier": identifier, "blacklisted": blacklisted, "entry": entry })
            }
        },
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tiergate::clock::ManualTimeSource;
    use tiergate::error::{Result, TiergateError};
    use tiergate::storage::{Counted, Storage, StorageBackend, WindowId};

    struct Unreachable;

    fn refused<T>() -> Result<T> {
        Err(TiergateError::Storage("connection refused".to_string()))
    }

    #[async_trait]
    impl StorageBackend for Unreachable {
        async fn get_count(&self, _key: &str) -> Result<u64> {
            refused()
        }
        async fn get_reset_time(&self, _key: &str, _window_seconds: u64) -> Result<i64> {
            refused()
        }
        async fn increment(&self, _key: &str, _expiry_seconds: u64) -> Result<Counted> {
            refused()
        }
        async fn decrement(&self, _key: &str, _window: WindowId) -> Result<bool> {
            refused()
        }
        async fn exists(&self, _key: &str) -> Result<bool> {
            refused()
        }
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            refused()
        }
        async fn set_with_expiry(&self, _key: &str, _value: &str, _expiry_seconds: u64) -> Result<bool> {
            refused()
        }
        async fn set_if_absent(&self, _key: &str, _value: &str, _expiry_seconds: u64) -> Result<bool> {
            refused()
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            refused()
        }
        async fn clear_keys(&self, _pattern: &str) -> Result<bool> {
            refused()
        }
        async fn get_ttl(&self, _key: &str) -> Result<Option<u64>> {
            refused()
        }
        async fn purge_expired(&self) -> Result<u64> {
            refused()
        }
        fn kind(&self) -> StorageKind {
            StorageKind::DistributedCache
        }
    }

    fn limiter(backend: Arc<dyn StorageBackend>) -> RateLimiter {
        let time = Arc::new(ManualTimeSource::new(1_700_000_000));
        let storage = Storage::new(backend, Duration::from_secs(1));
        RateLimiter::with_storage(TiergateConfig::default(), storage, time)
    }

    #[tokio::test]
    async fn test_stats_report_survives_storage_failure() {
        let limiter = limiter(Arc::new(Unreachable));
        let report = stats_report(&limiter, "user", DEFAULT_ENDPOINT).await;

        assert_eq!(report["identifier"], "user");
        assert!(report["stats"].is_null());
        assert!(report["error"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_stats_report() {
        let time = Arc::new(ManualTimeSource::new(1_700_000_000));
        let storage = Storage::ephemeral(time.clone(), Duration::from_secs(1));
        let limiter = RateLimiter::with_storage(TiergateConfig::default(), storage, time);
        limiter.record_request("user", DEFAULT_ENDPOINT, true).await;

        let report = stats_report(&limiter, "user", DEFAULT_ENDPOINT).await;
        assert_eq!(report["stats"]["total_requests"], 1);
        assert!(report.get("error").is_none());
    }
}
