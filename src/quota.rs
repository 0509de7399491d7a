//! Tiered daily/monthly quota accounting
//!
//! One record per user holds request counters, reset boundaries, an
//! optional grace period, and the suspension flag. Resets are
//! advance-in-place: a boundary always moves forward by exactly one
//! period from its prior value, never recomputed from "now", so the
//! cadence is stable even when a sweep runs late.
//!
//! Counters are mutated in memory on the hot path and flushed to the
//! durable store by the periodic sweep; administrative mutations write
//! through immediately and propagate storage errors.

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{GovernanceConfig, Tier};
use crate::error::Result;
use crate::store::{QuotaRow, Store};

/// Quota state for a single user
#[derive(Debug, Clone)]
pub struct QuotaRecord {
    /// Assigned tier
    pub tier: Tier,
    /// Requests counted against the current day
    pub daily_count: u64,
    /// Requests counted against the current month
    pub monthly_count: u64,
    /// Next daily boundary (UTC midnight cadence)
    pub daily_reset_at: DateTime<Utc>,
    /// Next monthly boundary (first of month cadence)
    pub monthly_reset_at: DateTime<Utc>,
    /// Quota checks are bypassed until this instant, if set
    pub grace_until: Option<DateTime<Utc>>,
    /// Suspended users are denied regardless of counters or grace
    pub suspended: bool,
    dirty: bool,
}

impl QuotaRecord {
    /// Fresh record on the default tier with boundaries at the next
    /// day/month rollover
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            tier: Tier::default(),
            daily_count: 0,
            monthly_count: 0,
            daily_reset_at: next_day_boundary(now),
            monthly_reset_at: next_month_boundary(now),
            grace_until: None,
            suspended: false,
            dirty: true,
        }
    }

    /// Zero any counter whose boundary has passed, advancing the boundary
    /// by whole periods until it is in the future again
    pub fn roll_if_due(&mut self, now: DateTime<Utc>) {
        while now >= self.daily_reset_at {
            self.daily_count = 0;
            self.daily_reset_at += chrono::Duration::days(1);
            self.dirty = true;
        }
        while now >= self.monthly_reset_at {
            self.monthly_count = 0;
            self.monthly_reset_at = self.monthly_reset_at + Months::new(1);
            self.dirty = true;
        }
    }

    /// Whether a grace period is active at `now`
    #[must_use]
    pub fn in_grace(&self, now: DateTime<Utc>) -> bool {
        self.grace_until.is_some_and(|until| now < until)
    }

    fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn to_row(&self, user_id: &str) -> QuotaRow {
        QuotaRow {
            user_id: user_id.to_string(),
            tier: self.tier.as_str().to_string(),
            daily_requests: self.daily_count as i64,
            monthly_requests: self.monthly_count as i64,
            daily_reset_at: self.daily_reset_at,
            monthly_reset_at: self.monthly_reset_at,
            grace_period_until: self.grace_until,
            is_suspended: self.suspended,
        }
    }

    fn from_row(row: QuotaRow) -> Self {
        Self {
            tier: Tier::parse(&row.tier),
            daily_count: row.daily_requests.max(0) as u64,
            monthly_count: row.monthly_requests.max(0) as u64,
            daily_reset_at: row.daily_reset_at,
            monthly_reset_at: row.monthly_reset_at,
            grace_until: row.grace_period_until,
            suspended: row.is_suspended,
            dirty: false,
        }
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone)]
pub struct QuotaDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Denial reason, if denied
    pub reason: Option<String>,
    /// Instant the relevant counter resets, if denial is time-bounded
    pub resets_at: Option<DateTime<Utc>>,
}

impl QuotaDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            resets_at: None,
        }
    }

    fn denied(reason: impl Into<String>, resets_at: Option<DateTime<Utc>>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            resets_at,
        }
    }
}

/// Snapshot of a user's quota state for display
#[derive(Debug, Clone, Serialize)]
pub struct QuotaUsage {
    /// User id
    pub user_id: String,
    /// Assigned tier
    pub tier: Tier,
    /// Requests used today
    pub daily_used: u64,
    /// Daily request limit for the tier
    pub daily_limit: u64,
    /// Requests used this month
    pub monthly_used: u64,
    /// Monthly request limit for the tier
    pub monthly_limit: u64,
    /// Next daily boundary
    pub daily_reset_at: DateTime<Utc>,
    /// Next monthly boundary
    pub monthly_reset_at: DateTime<Utc>,
    /// Active grace period expiry, if any
    pub grace_until: Option<DateTime<Utc>>,
    /// Suspension flag
    pub suspended: bool,
}

/// Tiered quota policy engine
pub struct QuotaManager {
    records: DashMap<String, QuotaRecord>,
    store: Arc<Store>,
    config: Arc<GovernanceConfig>,
}

impl QuotaManager {
    /// Create a quota manager over a durable store
    #[must_use]
    pub fn new(store: Arc<Store>, config: Arc<GovernanceConfig>) -> Self {
        Self {
            records: DashMap::new(),
            store,
            config,
        }
    }

    /// Load the persisted record into the cache if not already present
    async fn ensure_loaded(&self, user_id: &str) -> Result<()> {
        if self.records.contains_key(user_id) {
            return Ok(());
        }
        let record = match self.store.load_quota(user_id).await? {
            Some(row) => QuotaRecord::from_row(row),
            None => QuotaRecord::new(Utc::now()),
        };
        self.records
            .entry(user_id.to_string())
            .or_insert(record);
        Ok(())
    }

    /// Check whether a user has quota remaining.
    ///
    /// Decision order: suspension, grace period, daily limit, monthly limit.
    /// A suspended user is denied even inside an active grace period.
    pub async fn has_quota(&self, user_id: &str) -> Result<QuotaDecision> {
        self.ensure_loaded(user_id).await?;
        let now = Utc::now();
        let mut record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaRecord::new(now));
        record.roll_if_due(now);

        if record.suspended {
            return Ok(QuotaDecision::denied("account is suspended", None));
        }
        if record.in_grace(now) {
            debug!(user_id = %user_id, until = ?record.grace_until, "Quota bypassed by grace period");
            return Ok(QuotaDecision::allowed());
        }

        let limits = self.config.tiers.limits(record.tier);
        if record.daily_count >= limits.daily_requests {
            return Ok(QuotaDecision::denied(
                "daily request limit reached",
                Some(record.daily_reset_at),
            ));
        }
        if record.monthly_count >= limits.monthly_requests {
            return Ok(QuotaDecision::denied(
                "monthly request limit reached",
                Some(record.monthly_reset_at),
            ));
        }
        Ok(QuotaDecision::allowed())
    }

    /// Count one completed request against the user's daily and monthly
    /// counters, rolling overdue boundaries first
    pub async fn increment_usage(&self, user_id: &str) -> Result<()> {
        self.ensure_loaded(user_id).await?;
        let now = Utc::now();
        let mut record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaRecord::new(now));
        record.roll_if_due(now);
        record.daily_count += 1;
        record.monthly_count += 1;
        record.dirty = true;
        Ok(())
    }

    /// Full usage snapshot for a user
    pub async fn get_usage(&self, user_id: &str) -> Result<QuotaUsage> {
        self.ensure_loaded(user_id).await?;
        let now = Utc::now();
        let mut record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaRecord::new(now));
        record.roll_if_due(now);
        let limits = self.config.tiers.limits(record.tier);
        Ok(QuotaUsage {
            user_id: user_id.to_string(),
            tier: record.tier,
            daily_used: record.daily_count,
            daily_limit: limits.daily_requests,
            monthly_used: record.monthly_count,
            monthly_limit: limits.monthly_requests,
            daily_reset_at: record.daily_reset_at,
            monthly_reset_at: record.monthly_reset_at,
            grace_until: record.grace_until,
            suspended: record.suspended,
        })
    }

    /// Current tier for a user
    pub async fn tier(&self, user_id: &str) -> Result<Tier> {
        self.ensure_loaded(user_id).await?;
        Ok(self
            .records
            .get(user_id)
            .map(|r| r.tier)
            .unwrap_or_default())
    }

    /// Change a user's tier (write-through)
    pub async fn update_tier(&self, user_id: &str, tier: Tier) -> Result<()> {
        let row = self
            .mutate(user_id, |record| {
                record.tier = tier;
            })
            .await?;
        self.store.upsert_quota(&row).await?;
        info!(user_id = %user_id, tier = %tier, "Tier updated");
        Ok(())
    }

    /// Grant a temporary quota bypass (write-through).
    ///
    /// Grace bypasses the daily/monthly counters only; suspension and
    /// rate-limit buckets still apply.
    pub async fn grant_grace_period(&self, user_id: &str, hours: u32) -> Result<()> {
        let until = Utc::now() + chrono::Duration::hours(i64::from(hours));
        let row = self
            .mutate(user_id, |record| {
                record.grace_until = Some(until);
            })
            .await?;
        self.store.upsert_quota(&row).await?;
        info!(user_id = %user_id, until = %until, "Grace period granted");
        Ok(())
    }

    /// Suspend a user (write-through)
    pub async fn suspend_user(&self, user_id: &str) -> Result<()> {
        let row = self
            .mutate(user_id, |record| {
                record.suspended = true;
            })
            .await?;
        self.store.upsert_quota(&row).await?;
        info!(user_id = %user_id, "User suspended");
        Ok(())
    }

    /// Lift a suspension (write-through)
    pub async fn unsuspend_user(&self, user_id: &str) -> Result<()> {
        let row = self
            .mutate(user_id, |record| {
                record.suspended = false;
            })
            .await?;
        self.store.upsert_quota(&row).await?;
        info!(user_id = %user_id, "User unsuspended");
        Ok(())
    }

    /// Zero a user's counters and clear any grace period (write-through).
    /// Boundaries keep their cadence; tier and suspension are untouched.
    pub async fn reset_quotas(&self, user_id: &str) -> Result<()> {
        let row = self
            .mutate(user_id, |record| {
                record.daily_count = 0;
                record.monthly_count = 0;
                record.grace_until = None;
            })
            .await?;
        self.store.upsert_quota(&row).await?;
        info!(user_id = %user_id, "Quotas reset");
        Ok(())
    }

    /// Apply a mutation under the record lock and return the row to persist.
    /// The lock is released before any await so the store write never blocks
    /// other users.
    async fn mutate<F>(&self, user_id: &str, apply: F) -> Result<QuotaRow>
    where
        F: FnOnce(&mut QuotaRecord),
    {
        self.ensure_loaded(user_id).await?;
        let now = Utc::now();
        let mut record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaRecord::new(now));
        record.roll_if_due(now);
        apply(&mut record);
        record.dirty = false; // write-through below counts as the flush
        Ok(record.to_row(user_id))
    }

    /// Roll every cached record past its boundary and flush dirty rows.
    /// Bounds counter staleness even for users who stopped sending requests.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        for mut entry in self.records.iter_mut() {
            entry.value_mut().roll_if_due(now);
        }
        self.flush().await
    }

    /// Flush records mutated since the last flush, returning how many rows
    /// were written. On a mid-batch failure the unwritten rows are
    /// re-marked dirty so the next flush retries them.
    pub async fn flush(&self) -> Result<usize> {
        let mut rows = Vec::new();
        for mut entry in self.records.iter_mut() {
            let user_id = entry.key().clone();
            let record = entry.value_mut();
            if record.take_dirty() {
                rows.push(record.to_row(&user_id));
            }
        }
        for (written, row) in rows.iter().enumerate() {
            if let Err(e) = self.store.upsert_quota(row).await {
                for pending in &rows[written..] {
                    if let Some(mut record) = self.records.get_mut(&pending.user_id) {
                        record.dirty = true;
                    }
                }
                return Err(e);
            }
        }
        Ok(rows.len())
    }
}

/// Next UTC midnight strictly after `now`
fn next_day_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + chrono::Days::new(1);
    let midnight = tomorrow.and_hms_opt(0, 0, 0).expect("midnight is valid");
    Utc.from_utc_datetime(&midnight)
}

/// First instant of the month after `now`
fn next_month_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = now
        .date_naive()
        .with_day(1)
        .expect("day 1 exists in every month")
        + Months::new(1);
    let midnight = first.and_hms_opt(0, 0, 0).expect("midnight is valid");
    Utc.from_utc_datetime(&midnight)
}
