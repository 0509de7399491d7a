//! Durable governance state using SQLite
//!
//! Owns the three tables this layer persists: token buckets, per-user
//! quota rows, and the append-only usage ledger. Upserts are atomic per
//! primary key (`ON CONFLICT ... DO UPDATE`, last-write-wins), so multiple
//! platform processes can safely share one database file.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;

use crate::error::{Error, Result};

/// Persisted token bucket state
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BucketRow {
    /// Owning user
    pub user_id: String,
    /// Dimension string form ("requests", "tokens", "cost")
    pub dimension: String,
    /// Tokens remaining at `last_refill`
    pub tokens: f64,
    /// Instant the bucket was last refilled/consumed
    pub last_refill: DateTime<Utc>,
    /// Burst capacity at flush time
    pub capacity: f64,
    /// Refill rate (units/second) at flush time
    pub refill_rate: f64,
}

/// Persisted quota state, one row per user
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QuotaRow {
    /// Owning user
    pub user_id: String,
    /// Tier string form ("free", "pro", "enterprise")
    pub tier: String,
    /// Requests counted against the current day
    pub daily_requests: i64,
    /// Requests counted against the current month
    pub monthly_requests: i64,
    /// Next daily boundary (UTC)
    pub daily_reset_at: DateTime<Utc>,
    /// Next monthly boundary (UTC)
    pub monthly_reset_at: DateTime<Utc>,
    /// Quota bypass expiry, if a grace period is active
    pub grace_period_until: Option<DateTime<Utc>>,
    /// Administrative suspension flag
    pub is_suspended: bool,
}

/// One append-only ledger entry
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UsageRow {
    /// Row id
    pub id: String,
    /// Owning user
    pub user_id: String,
    /// Model identifier the spend was incurred on
    pub model: String,
    /// Prompt tokens
    pub input_tokens: i64,
    /// Completion tokens
    pub output_tokens: i64,
    /// Spend in USD
    pub cost_usd: f64,
    /// When the request completed
    pub created_at: DateTime<Utc>,
}

/// Per-model aggregate over the ledger
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ModelUsageRow {
    /// Model identifier
    pub model: String,
    /// Total prompt tokens
    pub input_tokens: i64,
    /// Total completion tokens
    pub output_tokens: i64,
    /// Total spend in USD
    pub cost_usd: f64,
}

/// SQLite-backed governance store
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Create a store from a database path, creating parent directories
    /// and running migrations
    pub async fn from_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
                field: "store.path".to_string(),
                message: format!("failed to create directory: {}", e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create an in-memory store (tests, ephemeral deployments)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Close the connection pool. Queries issued afterwards fail, which
    /// exercises the caller's fail-open/fail-closed policy.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS token_buckets (
                user_id TEXT NOT NULL,
                dimension TEXT NOT NULL,
                tokens REAL NOT NULL,
                last_refill TIMESTAMP NOT NULL,
                capacity REAL NOT NULL,
                refill_rate REAL NOT NULL,
                PRIMARY KEY (user_id, dimension)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_quotas (
                user_id TEXT PRIMARY KEY,
                tier TEXT NOT NULL DEFAULT 'free',
                daily_requests INTEGER NOT NULL DEFAULT 0,
                monthly_requests INTEGER NOT NULL DEFAULT 0,
                daily_reset_at TIMESTAMP NOT NULL,
                monthly_reset_at TIMESTAMP NOT NULL,
                grace_period_until TIMESTAMP,
                is_suspended BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_ledger (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_user_time ON usage_ledger(user_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ledger_time ON usage_ledger(created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ========================================================================
    // Token buckets
    // ========================================================================

    /// Load one bucket, if persisted
    pub async fn load_bucket(&self, user_id: &str, dimension: &str) -> Result<Option<BucketRow>> {
        let row = sqlx::query_as::<_, BucketRow>(
            "SELECT user_id, dimension, tokens, last_refill, capacity, refill_rate
             FROM token_buckets WHERE user_id = ? AND dimension = ?",
        )
        .bind(user_id)
        .bind(dimension)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Insert or overwrite a bucket row (last write wins)
    pub async fn upsert_bucket(&self, row: &BucketRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO token_buckets (user_id, dimension, tokens, last_refill, capacity, refill_rate)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, dimension) DO UPDATE SET
                tokens = excluded.tokens,
                last_refill = excluded.last_refill,
                capacity = excluded.capacity,
                refill_rate = excluded.refill_rate
            "#,
        )
        .bind(&row.user_id)
        .bind(&row.dimension)
        .bind(row.tokens)
        .bind(row.last_refill)
        .bind(row.capacity)
        .bind(row.refill_rate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete all buckets for a user
    pub async fn delete_buckets(&self, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM token_buckets WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // User quotas
    // ========================================================================

    /// Load one quota row, if persisted
    pub async fn load_quota(&self, user_id: &str) -> Result<Option<QuotaRow>> {
        let row = sqlx::query_as::<_, QuotaRow>(
            "SELECT user_id, tier, daily_requests, monthly_requests, daily_reset_at,
                    monthly_reset_at, grace_period_until, is_suspended
             FROM user_quotas WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Insert or overwrite a quota row (last write wins)
    pub async fn upsert_quota(&self, row: &QuotaRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_quotas (user_id, tier, daily_requests, monthly_requests,
                                     daily_reset_at, monthly_reset_at, grace_period_until, is_suspended)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                tier = excluded.tier,
                daily_requests = excluded.daily_requests,
                monthly_requests = excluded.monthly_requests,
                daily_reset_at = excluded.daily_reset_at,
                monthly_reset_at = excluded.monthly_reset_at,
                grace_period_until = excluded.grace_period_until,
                is_suspended = excluded.is_suspended
            "#,
        )
        .bind(&row.user_id)
        .bind(&row.tier)
        .bind(row.daily_requests)
        .bind(row.monthly_requests)
        .bind(row.daily_reset_at)
        .bind(row.monthly_reset_at)
        .bind(row.grace_period_until)
        .bind(row.is_suspended)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Usage ledger
    // ========================================================================

    /// Append one ledger entry
    pub async fn append_usage(&self, row: &UsageRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_ledger (id, user_id, model, input_tokens, output_tokens, cost_usd, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.user_id)
        .bind(&row.model)
        .bind(row.input_tokens)
        .bind(row.output_tokens)
        .bind(row.cost_usd)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Total spend for a user since an instant
    pub async fn cost_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<f64> {
        let total: f64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_ledger
             WHERE user_id = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    /// All-time spend for a user
    pub async fn total_cost(&self, user_id: &str) -> Result<f64> {
        let total: f64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_ledger WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(total)
    }

    /// Per-model aggregates for a user
    pub async fn model_usage(&self, user_id: &str) -> Result<Vec<ModelUsageRow>> {
        let rows = sqlx::query_as::<_, ModelUsageRow>(
            "SELECT model,
                    COALESCE(SUM(input_tokens), 0) AS input_tokens,
                    COALESCE(SUM(output_tokens), 0) AS output_tokens,
                    COALESCE(SUM(cost_usd), 0.0) AS cost_usd
             FROM usage_ledger WHERE user_id = ?
             GROUP BY model ORDER BY cost_usd DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Top spenders across all users
    pub async fn top_users(&self, limit: u32) -> Result<Vec<(String, f64)>> {
        let rows = sqlx::query_as::<_, (String, f64)>(
            "SELECT user_id, COALESCE(SUM(cost_usd), 0.0) AS total
             FROM usage_ledger GROUP BY user_id ORDER BY total DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Delete ledger entries older than the cutoff, returning the number removed
    pub async fn prune_ledger_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM usage_ledger WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests;
