//! Usage ledger and cost aggregation
//!
//! Every completed request appends one immutable ledger row; everything
//! else here is aggregation over that ledger. Daily and monthly windows
//! are calendar-aligned (UTC midnight, first of month) to match the
//! quota boundaries.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{Store, UsageRow};

/// Per-model slice of a user's spend
#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    /// Model identifier
    pub model: String,
    /// Total prompt tokens
    pub input_tokens: u64,
    /// Total completion tokens
    pub output_tokens: u64,
    /// Total spend in USD
    pub cost_usd: f64,
}

/// A user's aggregated spend
#[derive(Debug, Clone, Serialize)]
pub struct CostSummary {
    /// User id
    pub user_id: String,
    /// Spend since UTC midnight
    pub daily_usd: f64,
    /// Spend since the first of the month
    pub monthly_usd: f64,
    /// All-time spend
    pub total_usd: f64,
    /// Breakdown by model, highest spend first
    pub by_model: Vec<ModelUsage>,
}

/// One entry in the top-spenders ranking
#[derive(Debug, Clone, Serialize)]
pub struct UserSpend {
    /// User id
    pub user_id: String,
    /// All-time spend in USD
    pub total_usd: f64,
}

/// Append-only cost accounting over the usage ledger
pub struct CostTracker {
    store: Arc<Store>,
}

impl CostTracker {
    /// Create a cost tracker over a durable store
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Append one usage entry
    pub async fn record(
        &self,
        user_id: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) -> Result<()> {
        let row = UsageRow {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            model: model.to_string(),
            input_tokens: input_tokens as i64,
            output_tokens: output_tokens as i64,
            cost_usd,
            created_at: Utc::now(),
        };
        self.store.append_usage(&row).await?;
        debug!(
            user_id = %user_id,
            model = %model,
            cost_usd = cost_usd,
            "Usage recorded"
        );
        Ok(())
    }

    /// Spend since UTC midnight
    pub async fn daily_cost(&self, user_id: &str) -> Result<f64> {
        self.store.cost_since(user_id, day_start(Utc::now())).await
    }

    /// Spend since the first of the current month
    pub async fn monthly_cost(&self, user_id: &str) -> Result<f64> {
        self.store
            .cost_since(user_id, month_start(Utc::now()))
            .await
    }

    /// Full spend summary for a user
    pub async fn user_cost_summary(&self, user_id: &str) -> Result<CostSummary> {
        let now = Utc::now();
        let daily_usd = self.store.cost_since(user_id, day_start(now)).await?;
        let monthly_usd = self.store.cost_since(user_id, month_start(now)).await?;
        let total_usd = self.store.total_cost(user_id).await?;
        let by_model = self
            .store
            .model_usage(user_id)
            .await?
            .into_iter()
            .map(|row| ModelUsage {
                model: row.model,
                input_tokens: row.input_tokens.max(0) as u64,
                output_tokens: row.output_tokens.max(0) as u64,
                cost_usd: row.cost_usd,
            })
            .collect();
        Ok(CostSummary {
            user_id: user_id.to_string(),
            daily_usd,
            monthly_usd,
            total_usd,
            by_model,
        })
    }

    /// Top spenders across all users, highest first
    pub async fn top_users(&self, limit: u32) -> Result<Vec<UserSpend>> {
        let rows = self.store.top_users(limit).await?;
        Ok(rows
            .into_iter()
            .map(|(user_id, total_usd)| UserSpend { user_id, total_usd })
            .collect())
    }

    /// Delete ledger entries older than `days` days (retention pass)
    pub async fn prune_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        self.store.prune_ledger_before(cutoff).await
    }
}

/// UTC midnight of the current day
fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid");
    Utc.from_utc_datetime(&midnight)
}

/// First instant of the current month
fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = now
        .date_naive()
        .with_day(1)
        .expect("day 1 exists in every month")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid");
    Utc.from_utc_datetime(&first)
}
