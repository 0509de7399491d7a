//! Token buckets for per-user rate limiting
//!
//! Buckets refill continuously (real-valued tokens per second) instead of
//! resetting on window boundaries, which avoids thundering herds at the
//! top of each minute. One bucket exists per (user, dimension) pair and is
//! created lazily from the user's tier limits on first use.
//!
//! Buckets are flushed to the durable store on a coalesced interval, not
//! per call; a crash loses at most one interval of consumption, which only
//! biases toward more availability.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::store::{BucketRow, Store};

/// Rate-limited dimension of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Requests per minute
    Requests,
    /// Prompt/completion tokens per minute
    Tokens,
    /// Spend in USD
    Cost,
}

impl Dimension {
    /// All dimensions, in storage order
    pub const ALL: [Dimension; 3] = [Dimension::Requests, Dimension::Tokens, Dimension::Cost];

    /// Stable string form used in the durable store
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Tokens => "tokens",
            Self::Cost => "cost",
        }
    }

    /// Parse the stored string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requests" => Some(Self::Requests),
            "tokens" => Some(Self::Tokens),
            "cost" => Some(Self::Cost),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single leaky bucket with continuous refill
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: DateTime<Utc>,
    dirty: bool,
}

impl TokenBucket {
    /// Create a full bucket
    #[must_use]
    pub fn new(capacity: f64, refill_rate: f64, now: DateTime<Utc>) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: now,
            dirty: false,
        }
    }

    /// Restore a bucket from its persisted state.
    ///
    /// Refill for the downtime since `last_refill` is not applied here; it
    /// happens naturally on the first call that computes elapsed time.
    #[must_use]
    pub fn from_persisted(
        capacity: f64,
        refill_rate: f64,
        tokens: f64,
        last_refill: DateTime<Utc>,
    ) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: tokens.clamp(0.0, capacity),
            last_refill,
            dirty: false,
        }
    }

    /// Tokens that would be available at `now`, after refill
    #[must_use]
    pub fn available(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    /// Burst capacity
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Refill-then-consume. A failed attempt leaves the bucket untouched.
    pub fn try_consume(&mut self, now: DateTime<Utc>, amount: f64) -> bool {
        let available = self.available(now);
        if available >= amount {
            self.tokens = available - amount;
            self.last_refill = now;
            self.dirty = true;
            true
        } else {
            false
        }
    }

    /// How long until `amount` tokens will be available
    #[must_use]
    pub fn time_until_available(&self, now: DateTime<Utc>, amount: f64) -> Duration {
        let deficit = amount - self.available(now);
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_millis((deficit / self.refill_rate * 1000.0).ceil() as u64)
    }

    /// Apply new tier-derived limits. Only the ceiling changes; accumulated
    /// tokens are clamped, never topped up.
    pub fn set_limits(&mut self, capacity: f64, refill_rate: f64) {
        if (self.capacity - capacity).abs() > f64::EPSILON
            || (self.refill_rate - refill_rate).abs() > f64::EPSILON
        {
            self.capacity = capacity;
            self.refill_rate = refill_rate;
            self.tokens = self.tokens.min(capacity);
            self.dirty = true;
        }
    }

    fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn to_row(&self, user_id: &str, dimension: Dimension) -> BucketRow {
        BucketRow {
            user_id: user_id.to_string(),
            dimension: dimension.as_str().to_string(),
            tokens: self.tokens,
            last_refill: self.last_refill,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
        }
    }
}

/// In-memory bucket cache backed by the durable store
pub struct BucketStore {
    buckets: DashMap<(String, Dimension), Mutex<TokenBucket>>,
    store: Arc<Store>,
}

impl BucketStore {
    /// Create a bucket store over a durable store
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            buckets: DashMap::new(),
            store,
        }
    }

    /// Load the persisted bucket into the cache if not already present.
    ///
    /// Storage errors propagate so the caller can apply its fail-open policy.
    async fn ensure_loaded(
        &self,
        user_id: &str,
        dimension: Dimension,
        capacity: f64,
        refill_rate: f64,
    ) -> Result<()> {
        let key = (user_id.to_string(), dimension);
        if self.buckets.contains_key(&key) {
            return Ok(());
        }

        let persisted = self.store.load_bucket(user_id, dimension.as_str()).await?;
        let bucket = match persisted {
            Some(row) => {
                TokenBucket::from_persisted(capacity, refill_rate, row.tokens, row.last_refill)
            }
            None => TokenBucket::new(capacity, refill_rate, Utc::now()),
        };
        // A concurrent loader may have won the race; keep whichever landed first.
        self.buckets.entry(key).or_insert_with(|| Mutex::new(bucket));
        Ok(())
    }

    /// Atomically refill and consume `amount` from a user's bucket
    pub async fn try_consume(
        &self,
        user_id: &str,
        dimension: Dimension,
        amount: f64,
        capacity: f64,
        refill_rate: f64,
    ) -> Result<bool> {
        self.ensure_loaded(user_id, dimension, capacity, refill_rate)
            .await?;
        let entry = self
            .buckets
            .entry((user_id.to_string(), dimension))
            .or_insert_with(|| Mutex::new(TokenBucket::new(capacity, refill_rate, Utc::now())));
        let mut bucket = entry.lock().unwrap();
        bucket.set_limits(capacity, refill_rate);
        Ok(bucket.try_consume(Utc::now(), amount))
    }

    /// Current availability and capacity for a user's bucket
    pub async fn peek(
        &self,
        user_id: &str,
        dimension: Dimension,
        capacity: f64,
        refill_rate: f64,
    ) -> Result<(f64, f64)> {
        self.ensure_loaded(user_id, dimension, capacity, refill_rate)
            .await?;
        let entry = self
            .buckets
            .entry((user_id.to_string(), dimension))
            .or_insert_with(|| Mutex::new(TokenBucket::new(capacity, refill_rate, Utc::now())));
        let mut bucket = entry.lock().unwrap();
        bucket.set_limits(capacity, refill_rate);
        Ok((bucket.available(Utc::now()), bucket.capacity()))
    }

    /// How long until `amount` tokens are available for a user
    pub async fn time_until_available(
        &self,
        user_id: &str,
        dimension: Dimension,
        amount: f64,
        capacity: f64,
        refill_rate: f64,
    ) -> Result<Duration> {
        self.ensure_loaded(user_id, dimension, capacity, refill_rate)
            .await?;
        let entry = self
            .buckets
            .entry((user_id.to_string(), dimension))
            .or_insert_with(|| Mutex::new(TokenBucket::new(capacity, refill_rate, Utc::now())));
        let bucket = entry.lock().unwrap();
        Ok(bucket.time_until_available(Utc::now(), amount))
    }

    /// Collect rows for buckets mutated since the last flush, clearing
    /// their dirty flags
    #[must_use]
    pub fn snapshot_dirty(&self) -> Vec<BucketRow> {
        let mut rows = Vec::new();
        for entry in self.buckets.iter() {
            let (user_id, dimension) = entry.key();
            let mut bucket = entry.value().lock().unwrap();
            if bucket.take_dirty() {
                rows.push(bucket.to_row(user_id, *dimension));
            }
        }
        rows
    }

    /// Flush all dirty buckets to the durable store, returning how many
    /// rows were written. On a mid-batch failure the unwritten rows are
    /// re-marked dirty so the next flush retries them.
    pub async fn flush(&self) -> Result<usize> {
        let rows = self.snapshot_dirty();
        for (written, row) in rows.iter().enumerate() {
            if let Err(e) = self.store.upsert_bucket(row).await {
                self.mark_dirty(&rows[written..]);
                return Err(e);
            }
        }
        Ok(rows.len())
    }

    fn mark_dirty(&self, rows: &[BucketRow]) {
        for row in rows {
            let Some(dimension) = Dimension::parse(&row.dimension) else {
                continue;
            };
            if let Some(entry) = self.buckets.get(&(row.user_id.clone(), dimension)) {
                entry.lock().unwrap().dirty = true;
            }
        }
    }

    /// Drop all of a user's buckets, in memory and in the store
    pub async fn reset_user(&self, user_id: &str) -> Result<()> {
        for dimension in Dimension::ALL {
            self.buckets.remove(&(user_id.to_string(), dimension));
        }
        self.store.delete_buckets(user_id).await
    }
}
