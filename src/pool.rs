//! Named bounded-concurrency pools
//!
//! Each pool enforces a global concurrency ceiling and an independent
//! per-key ceiling (default 1, serializing one caller's overlapping
//! requests while unrelated keys run in parallel). Waiters are FIFO per
//! key thanks to semaphore fairness. Work runs on a spawned task, so a
//! caller that stops waiting does not free the slot early; it is released
//! when the work naturally finishes.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{Error, Result};

/// Configuration for one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum tasks running concurrently in the pool
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum tasks running concurrently for one key
    #[serde(default = "default_per_key")]
    pub per_key_concurrency: usize,
    /// Queue depth cap; `None` queues without bound
    #[serde(default)]
    pub max_queued: Option<usize>,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_per_key() -> usize {
    1
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            per_key_concurrency: default_per_key(),
            max_queued: None,
        }
    }
}

impl PoolConfig {
    /// Create a config with a global concurrency ceiling
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..Self::default()
        }
    }

    /// Set the per-key concurrency ceiling
    #[must_use]
    pub fn with_per_key_concurrency(mut self, limit: usize) -> Self {
        self.per_key_concurrency = limit;
        self
    }

    /// Cap the queue depth, failing fast once exceeded
    #[must_use]
    pub fn with_max_queued(mut self, cap: usize) -> Self {
        self.max_queued = Some(cap);
        self
    }
}

/// Live counters for one pool
#[derive(Debug, Default)]
struct PoolCounters {
    active: AtomicU64,
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of one pool's state
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    /// Pool name
    pub name: String,
    /// Tasks currently running
    pub active: u64,
    /// Tasks waiting for a slot
    pub queued: u64,
    /// Tasks finished successfully since the last metrics reset
    pub completed: u64,
    /// Tasks finished with an error since the last metrics reset
    pub failed: u64,
}

/// Aggregate snapshot across all pools
#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    /// Number of pools
    pub pools: usize,
    /// Tasks currently running, all pools
    pub total_active: u64,
    /// Tasks waiting, all pools
    pub total_queued: u64,
    /// Successful completions since the last metrics reset
    pub total_completed: u64,
    /// Failures since the last metrics reset
    pub total_failed: u64,
}

/// Decrements a gauge on drop so release happens on every exit path
struct GaugeGuard {
    counters: Arc<PoolCounters>,
    queued: bool,
}

impl GaugeGuard {
    /// Reserve a queue slot; returns the guard and the gauge value prior
    /// to this reservation so callers can enforce a cap exactly
    fn queued(counters: Arc<PoolCounters>) -> (Self, u64) {
        let prior = counters.queued.fetch_add(1, Ordering::SeqCst);
        (
            Self {
                counters,
                queued: true,
            },
            prior,
        )
    }

    fn active(counters: Arc<PoolCounters>) -> Self {
        counters.active.fetch_add(1, Ordering::SeqCst);
        Self {
            counters,
            queued: false,
        }
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        if self.queued {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A bounded-concurrency executor with per-key serialization
pub struct ResourcePool {
    name: String,
    config: PoolConfig,
    global: Arc<Semaphore>,
    per_key: DashMap<String, Arc<Semaphore>>,
    counters: Arc<PoolCounters>,
}

impl ResourcePool {
    /// Create a pool
    #[must_use]
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        let global = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            name: name.into(),
            config,
            global,
            per_key: DashMap::new(),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `work` once a global slot and a slot for `key` are both free.
    ///
    /// Tasks for the same key execute in submission order. The work is
    /// spawned, so dropping the returned future abandons the result but
    /// does not cancel the work or release its slot early.
    pub async fn run<T, F>(&self, key: &str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        // Reserve first, then check the prior value: a load-then-enqueue
        // check would let two concurrent callers both slip past the cap.
        let (queue_guard, prior_queued) = GaugeGuard::queued(Arc::clone(&self.counters));
        if let Some(cap) = self.config.max_queued {
            if prior_queued as usize >= cap {
                debug!(pool = %self.name, key = %key, cap = cap, "Pool queue full");
                return Err(Error::PoolSaturated {
                    pool: self.name.clone(),
                });
            }
        }
        let key_semaphore = self
            .per_key
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_key_concurrency)))
            .clone();

        // Per-key first so same-key callers queue FIFO without holding a
        // global slot they cannot use yet.
        let key_permit = key_semaphore
            .acquire_owned()
            .await
            .expect("pool semaphore closed");
        let global_permit = self
            .global
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore closed");
        drop(queue_guard);

        let counters = Arc::clone(&self.counters);
        let handle = tokio::spawn(async move {
            let _key_permit = key_permit;
            let _global_permit = global_permit;
            let active_guard = GaugeGuard::active(Arc::clone(&counters));
            let result = work.await;
            match &result {
                Ok(_) => counters.completed.fetch_add(1, Ordering::SeqCst),
                Err(_) => counters.failed.fetch_add(1, Ordering::SeqCst),
            };
            drop(active_guard);
            result
        });

        match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                Err(Error::Task(format!("pool task aborted: {}", join_err)))
            }
        }
    }

    /// Current snapshot of this pool
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            name: self.name.clone(),
            active: self.counters.active.load(Ordering::SeqCst),
            queued: self.counters.queued.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    /// Zero the completed/failed counters. Live gauges (active, queued)
    /// track real tasks and are left alone.
    pub fn reset_metrics(&self) {
        self.counters.completed.store(0, Ordering::SeqCst);
        self.counters.failed.store(0, Ordering::SeqCst);
    }

    /// Drop per-key semaphores with no holders and no waiters
    pub fn prune_idle_keys(&self) -> usize {
        let before = self.per_key.len();
        let per_key_limit = self.config.per_key_concurrency;
        self.per_key.retain(|_, semaphore| {
            Arc::strong_count(semaphore) > 1
                || semaphore.available_permits() < per_key_limit
        });
        before - self.per_key.len()
    }
}

/// Registry of named pools
pub struct PoolManager {
    pools: DashMap<String, Arc<ResourcePool>>,
    default_config: PoolConfig,
}

impl PoolManager {
    /// Create a manager; pools requested without explicit configuration
    /// use `default_config`
    #[must_use]
    pub fn new(default_config: PoolConfig) -> Self {
        Self {
            pools: DashMap::new(),
            default_config,
        }
    }

    /// Register a pool with an explicit configuration. Existing pools keep
    /// their configuration (live permits cannot be resized).
    pub fn configure(&self, name: &str, config: PoolConfig) -> Arc<ResourcePool> {
        self.pools
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ResourcePool::new(name, config)))
            .clone()
    }

    /// Get a pool, creating it with the default configuration if needed
    pub fn pool(&self, name: &str) -> Arc<ResourcePool> {
        self.pools
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ResourcePool::new(name, self.default_config.clone())))
            .clone()
    }

    /// Snapshot of every pool
    #[must_use]
    pub fn statuses(&self) -> Vec<PoolStatus> {
        let mut statuses: Vec<_> = self.pools.iter().map(|p| p.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Aggregate snapshot across pools
    #[must_use]
    pub fn summary(&self) -> PoolSummary {
        let statuses = self.statuses();
        PoolSummary {
            pools: statuses.len(),
            total_active: statuses.iter().map(|s| s.active).sum(),
            total_queued: statuses.iter().map(|s| s.queued).sum(),
            total_completed: statuses.iter().map(|s| s.completed).sum(),
            total_failed: statuses.iter().map(|s| s.failed).sum(),
        }
    }

    /// Zero completed/failed counters on every pool
    pub fn reset_all_metrics(&self) {
        for pool in self.pools.iter() {
            pool.reset_metrics();
        }
    }

    /// Drop idle per-key semaphores on every pool
    pub fn prune_idle_keys(&self) {
        for pool in self.pools.iter() {
            pool.prune_idle_keys();
        }
    }
}
