//! Tier definitions and the limits attached to each tier.
//!
//! Tiers form a closed set. Callers name a tier by string; unknown names fall
//! back to [`Tier::Basic`]. Limits can be overridden from YAML but default to
//! the published quota table.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TiergateError};

/// A named bundle of quota limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Basic,
    Premium,
    Enterprise,
}

impl Tier {
    /// Resolve a tier name, falling back to `Basic` for anything unknown.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "basic" => Tier::Basic,
            "premium" => Tier::Premium,
            "enterprise" => Tier::Enterprise,
            other => {
                debug!(tier = %other, "Unknown tier, using basic");
                Tier::Basic
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three limits enforced for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Requests allowed per hour
    pub requests_per_hour: u64,
    /// Requests allowed per minute
    pub requests_per_minute: u64,
    /// Requests allowed per 10-second burst window
    pub burst_limit: u64,
}

impl TierLimits {
    pub const BASIC: TierLimits = TierLimits {
        requests_per_hour: 100,
        requests_per_minute: 10,
        burst_limit: 5,
    };

    pub const PREMIUM: TierLimits = TierLimits {
        requests_per_hour: 1000,
        requests_per_minute: 50,
        burst_limit: 20,
    };

    pub const ENTERPRISE: TierLimits = TierLimits {
        requests_per_hour: 10000,
        requests_per_minute: 200,
        burst_limit: 100,
    };
}

/// Static table mapping each tier to its limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    #[serde(default = "basic_limits")]
    pub basic: TierLimits,
    #[serde(default = "premium_limits")]
    pub premium: TierLimits,
    #[serde(default = "enterprise_limits")]
    pub enterprise: TierLimits,
}

fn basic_limits() -> TierLimits {
    TierLimits::BASIC
}

fn premium_limits() -> TierLimits {
    TierLimits::PREMIUM
}

fn enterprise_limits() -> TierLimits {
    TierLimits::ENTERPRISE
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            basic: TierLimits::BASIC,
            premium: TierLimits::PREMIUM,
            enterprise: TierLimits::ENTERPRISE,
        }
    }
}

impl TierPolicy {
    /// Load a tier table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading tier policy");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a tier table from a YAML string. Missing tiers keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TiergateError::Config(format!("Failed to parse tier policy: {}", e)))
    }

    pub fn limits(&self, tier: Tier) -> TierLimits {
        match tier {
            Tier::Basic => self.basic,
            Tier::Premium => self.premium,
            Tier::Enterprise => self.enterprise,
        }
    }

    /// Resolve a tier by name. Unknown names get the basic limits.
    pub fn limits_for(&self, name: &str) -> TierLimits {
        self.limits(Tier::from_name(name))
    }
}
