//! Themis - Admission Control & Execution Governance
//!
//! This crate decides, for every inbound request that would trigger an
//! expensive LLM-backed agent execution, whether it may proceed now, must
//! wait, or must be rejected - and protects the platform from overload,
//! runaway cost, and cascading failure once execution is admitted:
//! - Buckets: per-user token buckets with continuous refill
//! - Quota: tiered daily/monthly policy with grace periods and suspension
//! - Limiter: the single admission decision composed from the above
//! - Pools: named bounded-concurrency executors with per-key serialization
//! - Breakers: per-operation circuit breakers for failing downstreams
//! - Cost: append-only usage ledger feeding cost-ceiling checks
//!
//! The typical flow: call [`RateLimiter::check`] before starting work, run
//! the work through [`ResourcePool::run`] and [`CircuitBreaker::run`], then
//! report the outcome with [`RateLimiter::record_request`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod breaker;
pub mod bucket;
pub mod config;
pub mod cost;
pub mod error;
pub mod governor;
pub mod limiter;
pub mod pool;
pub mod quota;
pub mod store;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerStatus, CircuitBreaker, CircuitState};
pub use bucket::{BucketStore, Dimension, TokenBucket};
pub use config::{GovernanceConfig, Tier, TierLimits, TierTable};
pub use cost::{CostSummary, CostTracker, ModelUsage, UserSpend};
pub use error::{Error, Result};
pub use governor::{Governor, GovernorStatus};
pub use limiter::{AdmissionDecision, AdmissionRequest, LimitSnapshot, RateLimiter, UserStatus};
pub use pool::{PoolConfig, PoolManager, PoolStatus, PoolSummary, ResourcePool};
pub use quota::{QuotaDecision, QuotaManager, QuotaRecord, QuotaUsage};
pub use store::Store;
