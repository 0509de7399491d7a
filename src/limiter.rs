//! Admission control orchestrator
//!
//! Composes quota policy, token buckets, and cost aggregates into a
//! single decision per inbound request. Checks short-circuit in order:
//! suspension/grace/daily/monthly quota, then the request bucket, then
//! the token bucket, then the tier's cost ceilings.
//!
//! Buckets are consumed at admission time, not after completion: a burst
//! of concurrent requests must not all pass a check-without-reserve race.
//! [`RateLimiter::record_request`] afterwards handles the post-hoc
//! accounting (ledger row, quota counters).

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::bucket::{BucketStore, Dimension};
use crate::config::{GovernanceConfig, Tier};
use crate::cost::CostTracker;
use crate::error::{Error, Result};
use crate::quota::{QuotaManager, QuotaUsage};
use crate::store::Store;

/// An inbound request asking to start an agent execution
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    /// User on whose behalf the work runs
    pub user_id: String,
    /// Originating surface ("web", "telegram", "discord", ...)
    pub interface: String,
    /// Caller's estimate of tokens the execution will consume
    pub estimated_tokens: u64,
    /// Target model, if already known
    pub model_id: Option<String>,
}

impl AdmissionRequest {
    /// Create a request with no token estimate
    #[must_use]
    pub fn new(user_id: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            interface: interface.into(),
            estimated_tokens: 0,
            model_id: None,
        }
    }

    /// Set the estimated token count
    #[must_use]
    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    /// Set the target model
    #[must_use]
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }
}

/// Point-in-time view of a user's limits, attached to decisions
#[derive(Debug, Clone, Serialize)]
pub struct LimitSnapshot {
    /// Assigned tier
    pub tier: Tier,
    /// Request-bucket tokens currently available
    pub requests_available: f64,
    /// Request-bucket capacity
    pub requests_capacity: f64,
    /// Token-bucket tokens currently available
    pub tokens_available: f64,
    /// Token-bucket capacity
    pub tokens_capacity: f64,
    /// Requests used today / allowed per day
    pub daily_used: u64,
    /// Daily request limit
    pub daily_limit: u64,
    /// Requests used this month
    pub monthly_used: u64,
    /// Monthly request limit
    pub monthly_limit: u64,
}

/// Outcome of an admission check
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Denial reason, if denied
    pub reason: Option<String>,
    /// How long to wait before retrying, if the denial is time-bounded
    pub retry_after: Option<Duration>,
    /// Limits at decision time; absent when the store was unreachable
    pub limits: Option<LimitSnapshot>,
}

impl AdmissionDecision {
    fn allowed(limits: Option<LimitSnapshot>) -> Self {
        Self {
            allowed: true,
            reason: None,
            retry_after: None,
            limits,
        }
    }

    fn denied(
        reason: impl Into<String>,
        retry_after: Option<Duration>,
        limits: Option<LimitSnapshot>,
    ) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            retry_after,
            limits,
        }
    }

    /// Convert a denial into `Err(Error::AdmissionDenied)` for callers that
    /// propagate `Result`s instead of inspecting the decision
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            return Ok(self);
        }
        Err(Error::AdmissionDenied {
            reason: self
                .reason
                .unwrap_or_else(|| "request denied".to_string()),
            retry_after: self.retry_after,
        })
    }
}

/// Full per-user status for dashboards and administration
#[derive(Debug, Clone, Serialize)]
pub struct UserStatus {
    /// Quota counters, boundaries, grace, suspension
    pub quota: QuotaUsage,
    /// Request-bucket availability
    pub requests_available: f64,
    /// Request-bucket capacity
    pub requests_capacity: f64,
    /// Token-bucket availability
    pub tokens_available: f64,
    /// Token-bucket capacity
    pub tokens_capacity: f64,
    /// Spend since UTC midnight
    pub daily_cost_usd: f64,
    /// Daily spend ceiling for the tier
    pub daily_cost_limit: f64,
    /// Spend since the first of the month
    pub monthly_cost_usd: f64,
    /// Monthly spend ceiling for the tier
    pub monthly_cost_limit: f64,
}

/// Per-request admission decisions over quota, buckets, and cost
pub struct RateLimiter {
    config: Arc<GovernanceConfig>,
    buckets: BucketStore,
    quotas: QuotaManager,
    costs: Arc<CostTracker>,
    /// Daily boundary at which each user was last soft-warned
    warned: DashMap<String, chrono::DateTime<Utc>>,
}

impl RateLimiter {
    /// Create a rate limiter over a durable store
    #[must_use]
    pub fn new(store: Arc<Store>, config: Arc<GovernanceConfig>, costs: Arc<CostTracker>) -> Self {
        Self {
            buckets: BucketStore::new(Arc::clone(&store)),
            quotas: QuotaManager::new(store, Arc::clone(&config)),
            config,
            costs,
            warned: DashMap::new(),
        }
    }

    /// Quota manager, for administrative operations
    #[must_use]
    pub fn quotas(&self) -> &QuotaManager {
        &self.quotas
    }

    /// Cost tracker backing the cost-ceiling checks
    #[must_use]
    pub fn costs(&self) -> &CostTracker {
        &self.costs
    }

    /// Decide whether a request may proceed.
    ///
    /// Never returns an error: storage failures resolve to the configured
    /// `fail_open` policy and are logged.
    pub async fn check(&self, request: &AdmissionRequest) -> AdmissionDecision {
        match self.try_check(request).await {
            Ok(decision) => decision,
            Err(e) if self.config.fail_open => {
                warn!(
                    user_id = %request.user_id,
                    interface = %request.interface,
                    error = %e,
                    "Admission check hit storage failure, failing open"
                );
                AdmissionDecision::allowed(None)
            }
            Err(e) => {
                warn!(
                    user_id = %request.user_id,
                    interface = %request.interface,
                    error = %e,
                    "Admission check hit storage failure, failing closed"
                );
                AdmissionDecision::denied("service temporarily unavailable", None, None)
            }
        }
    }

    async fn try_check(&self, request: &AdmissionRequest) -> Result<AdmissionDecision> {
        let user_id = &request.user_id;

        let quota = self.quotas.has_quota(user_id).await?;
        if !quota.allowed {
            let retry_after = quota
                .resets_at
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));
            let reason = quota.reason.unwrap_or_else(|| "quota exceeded".to_string());
            debug!(user_id = %user_id, reason = %reason, "Admission denied by quota");
            let limits = self.snapshot(user_id).await?;
            return Ok(AdmissionDecision::denied(reason, retry_after, Some(limits)));
        }

        let tier = self.quotas.tier(user_id).await?;
        let limits = self.config.tiers.limits(tier);

        let (req_cap, req_rate) = limits.bucket_params(Dimension::Requests);
        if !self
            .buckets
            .try_consume(user_id, Dimension::Requests, 1.0, req_cap, req_rate)
            .await?
        {
            let wait = self
                .buckets
                .time_until_available(user_id, Dimension::Requests, 1.0, req_cap, req_rate)
                .await?;
            debug!(user_id = %user_id, wait_ms = wait.as_millis() as u64, "Admission denied by request rate");
            let snapshot = self.snapshot(user_id).await?;
            return Ok(AdmissionDecision::denied(
                "request rate limit exceeded",
                Some(wait),
                Some(snapshot),
            ));
        }

        if request.estimated_tokens > 0 {
            let (tok_cap, tok_rate) = limits.bucket_params(Dimension::Tokens);
            let amount = request.estimated_tokens as f64;
            if !self
                .buckets
                .try_consume(user_id, Dimension::Tokens, amount, tok_cap, tok_rate)
                .await?
            {
                let wait = self
                    .buckets
                    .time_until_available(user_id, Dimension::Tokens, amount, tok_cap, tok_rate)
                    .await?;
                debug!(user_id = %user_id, tokens = request.estimated_tokens, "Admission denied by token rate");
                let snapshot = self.snapshot(user_id).await?;
                return Ok(AdmissionDecision::denied(
                    "token rate limit exceeded",
                    Some(wait),
                    Some(snapshot),
                ));
            }
        }

        let usage = self.quotas.get_usage(user_id).await?;
        let daily_cost = self.costs.daily_cost(user_id).await?;
        if daily_cost >= limits.daily_cost_usd {
            let retry_after = (usage.daily_reset_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!(user_id = %user_id, daily_cost = daily_cost, "Admission denied by daily cost ceiling");
            let snapshot = self.snapshot(user_id).await?;
            return Ok(AdmissionDecision::denied(
                "daily cost limit reached",
                Some(retry_after),
                Some(snapshot),
            ));
        }
        let monthly_cost = self.costs.monthly_cost(user_id).await?;
        if monthly_cost >= limits.monthly_cost_usd {
            let retry_after = (usage.monthly_reset_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!(user_id = %user_id, monthly_cost = monthly_cost, "Admission denied by monthly cost ceiling");
            let snapshot = self.snapshot(user_id).await?;
            return Ok(AdmissionDecision::denied(
                "monthly cost limit reached",
                Some(retry_after),
                Some(snapshot),
            ));
        }

        Ok(AdmissionDecision::allowed(Some(self.snapshot(user_id).await?)))
    }

    /// Record a completed request: append to the ledger and count it
    /// against the user's quota. Bucket consumption already happened at
    /// admission time.
    pub async fn record_request(
        &self,
        user_id: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) -> Result<()> {
        self.costs
            .record(user_id, model, input_tokens, output_tokens, cost_usd)
            .await?;
        self.quotas.increment_usage(user_id).await?;
        Ok(())
    }

    /// Soft warning when usage first crosses the configured threshold.
    ///
    /// Fires at most once per daily period per user; never blocks anything.
    pub async fn should_warn_user(&self, user_id: &str) -> Result<bool> {
        let usage = self.quotas.get_usage(user_id).await?;
        let daily_ratio = ratio(usage.daily_used, usage.daily_limit);
        let monthly_ratio = ratio(usage.monthly_used, usage.monthly_limit);
        if daily_ratio.max(monthly_ratio) < self.config.warn_threshold {
            return Ok(false);
        }

        let already = self
            .warned
            .get(user_id)
            .is_some_and(|at| *at == usage.daily_reset_at);
        if already {
            return Ok(false);
        }
        self.warned
            .insert(user_id.to_string(), usage.daily_reset_at);
        Ok(true)
    }

    /// Full status snapshot for a user
    pub async fn get_status(&self, user_id: &str) -> Result<UserStatus> {
        let usage = self.quotas.get_usage(user_id).await?;
        let limits = self.config.tiers.limits(usage.tier);

        let (req_cap, req_rate) = limits.bucket_params(Dimension::Requests);
        let (requests_available, requests_capacity) = self
            .buckets
            .peek(user_id, Dimension::Requests, req_cap, req_rate)
            .await?;
        let (tok_cap, tok_rate) = limits.bucket_params(Dimension::Tokens);
        let (tokens_available, tokens_capacity) = self
            .buckets
            .peek(user_id, Dimension::Tokens, tok_cap, tok_rate)
            .await?;

        Ok(UserStatus {
            daily_cost_usd: self.costs.daily_cost(user_id).await?,
            daily_cost_limit: limits.daily_cost_usd,
            monthly_cost_usd: self.costs.monthly_cost(user_id).await?,
            monthly_cost_limit: limits.monthly_cost_usd,
            quota: usage,
            requests_available,
            requests_capacity,
            tokens_available,
            tokens_capacity,
        })
    }

    /// Administrative escape hatch: clear a user's buckets, counters, and
    /// warning marker
    pub async fn reset_user(&self, user_id: &str) -> Result<()> {
        self.buckets.reset_user(user_id).await?;
        self.quotas.reset_quotas(user_id).await?;
        self.warned.remove(user_id);
        Ok(())
    }

    /// Flush dirty buckets and quota rows, returning total rows written
    pub async fn flush(&self) -> Result<usize> {
        let buckets = self.buckets.flush().await?;
        let quotas = self.quotas.flush().await?;
        Ok(buckets + quotas)
    }

    async fn snapshot(&self, user_id: &str) -> Result<LimitSnapshot> {
        let usage = self.quotas.get_usage(user_id).await?;
        let limits = self.config.tiers.limits(usage.tier);
        let (req_cap, req_rate) = limits.bucket_params(Dimension::Requests);
        let (requests_available, requests_capacity) = self
            .buckets
            .peek(user_id, Dimension::Requests, req_cap, req_rate)
            .await?;
        let (tok_cap, tok_rate) = limits.bucket_params(Dimension::Tokens);
        let (tokens_available, tokens_capacity) = self
            .buckets
            .peek(user_id, Dimension::Tokens, tok_cap, tok_rate)
            .await?;
        Ok(LimitSnapshot {
            tier: usage.tier,
            requests_available,
            requests_capacity,
            tokens_available,
            tokens_capacity,
            daily_used: usage.daily_used,
            daily_limit: usage.daily_limit,
            monthly_used: usage.monthly_used,
            monthly_limit: usage.monthly_limit,
        })
    }
}

fn ratio(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    used as f64 / limit as f64
}
