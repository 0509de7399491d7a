//! Governance configuration
//!
//! Tier definitions and engine-wide settings, deserializable from TOML.
//! Every field has a default so a partial config file (or none at all)
//! yields a working engine.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::breaker::BreakerConfig;
use crate::bucket::Dimension;
use crate::error::{Error, Result};
use crate::pool::PoolConfig;

/// Subscription tier assigned per user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Default tier for new users
    #[default]
    Free,
    /// Paid individual tier
    Pro,
    /// Organization tier
    Enterprise,
}

impl Tier {
    /// Stable string form used in the durable store
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    /// Parse the stored string form, falling back to Free for unknown values
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "pro" => Self::Pro,
            "enterprise" => Self::Enterprise,
            _ => Self::Free,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate and quota limits for one tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimits {
    /// Burst capacity and per-minute refill for the request bucket
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
    /// Burst capacity and per-minute refill for the token bucket
    #[serde(default = "default_tpm")]
    pub tokens_per_minute: u64,
    /// Requests allowed per UTC day
    #[serde(default = "default_daily_requests")]
    pub daily_requests: u64,
    /// Requests allowed per calendar month
    #[serde(default = "default_monthly_requests")]
    pub monthly_requests: u64,
    /// Spend ceiling per UTC day, in USD
    #[serde(default = "default_daily_cost")]
    pub daily_cost_usd: f64,
    /// Spend ceiling per calendar month, in USD
    #[serde(default = "default_monthly_cost")]
    pub monthly_cost_usd: f64,
}

fn default_rpm() -> u32 {
    5
}
fn default_tpm() -> u64 {
    10_000
}
fn default_daily_requests() -> u64 {
    50
}
fn default_monthly_requests() -> u64 {
    1_000
}
fn default_daily_cost() -> f64 {
    1.0
}
fn default_monthly_cost() -> f64 {
    20.0
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: default_rpm(),
            tokens_per_minute: default_tpm(),
            daily_requests: default_daily_requests(),
            monthly_requests: default_monthly_requests(),
            daily_cost_usd: default_daily_cost(),
            monthly_cost_usd: default_monthly_cost(),
        }
    }
}

impl TierLimits {
    /// Bucket parameters (capacity, refill per second) for a dimension.
    ///
    /// Capacity equals the per-minute allowance; refill spreads it evenly
    /// over the minute so there are no window-boundary bursts. The cost
    /// dimension spreads the daily ceiling over 24 hours.
    #[must_use]
    pub fn bucket_params(&self, dimension: Dimension) -> (f64, f64) {
        match dimension {
            Dimension::Requests => {
                let cap = f64::from(self.requests_per_minute);
                (cap, cap / 60.0)
            }
            Dimension::Tokens => {
                let cap = self.tokens_per_minute as f64;
                (cap, cap / 60.0)
            }
            Dimension::Cost => (self.daily_cost_usd, self.daily_cost_usd / 86_400.0),
        }
    }
}

/// Limits for all tiers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierTable {
    /// Free tier limits
    #[serde(default)]
    pub free: TierLimits,
    /// Pro tier limits
    #[serde(default = "default_pro")]
    pub pro: TierLimits,
    /// Enterprise tier limits
    #[serde(default = "default_enterprise")]
    pub enterprise: TierLimits,
}

fn default_pro() -> TierLimits {
    TierLimits {
        requests_per_minute: 30,
        tokens_per_minute: 100_000,
        daily_requests: 500,
        monthly_requests: 10_000,
        daily_cost_usd: 10.0,
        monthly_cost_usd: 200.0,
    }
}

fn default_enterprise() -> TierLimits {
    TierLimits {
        requests_per_minute: 120,
        tokens_per_minute: 500_000,
        daily_requests: 5_000,
        monthly_requests: 100_000,
        daily_cost_usd: 100.0,
        monthly_cost_usd: 2_000.0,
    }
}

impl TierTable {
    /// Limits for a tier
    #[must_use]
    pub fn limits(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Pro => &self.pro,
            Tier::Enterprise => &self.enterprise,
        }
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Allow requests through when the durable store is unreachable.
    ///
    /// Denying on storage failure would turn a store outage into a full
    /// platform outage, so the default is to allow and log.
    #[serde(default = "default_true")]
    pub fail_open: bool,
    /// Usage ratio at which a one-shot soft warning fires
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,
    /// Seconds between coalesced bucket/quota flushes to the store
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// Seconds between quota reset sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Per-tier limits
    #[serde(default)]
    pub tiers: TierTable,
    /// Defaults for pools created without an explicit configuration
    #[serde(default)]
    pub pool: PoolConfig,
    /// Defaults for circuit breakers
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_true() -> bool {
    true
}
fn default_warn_threshold() -> f64 {
    0.8
}
fn default_flush_interval() -> u64 {
    30
}
fn default_sweep_interval() -> u64 {
    60
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            fail_open: default_true(),
            warn_threshold: default_warn_threshold(),
            flush_interval_secs: default_flush_interval(),
            sweep_interval_secs: default_sweep_interval(),
            tiers: TierTable::default(),
            pool: PoolConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl GovernanceConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            field: path.display().to_string(),
            message: format!("cannot read config file: {}", e),
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| Error::InvalidConfig {
            field: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.warn_threshold) {
            return Err(Error::InvalidConfig {
                field: "warn_threshold".to_string(),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.flush_interval_secs == 0 {
            return Err(Error::InvalidConfig {
                field: "flush_interval_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::InvalidConfig {
                field: "sweep_interval_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
