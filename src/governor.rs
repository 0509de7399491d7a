//! Governance engine lifecycle
//!
//! Explicitly constructed and dependency-injected: the host builds a
//! [`Governor`] from a store and a config, calls `start()` to launch the
//! periodic flush and quota sweep, and `shutdown()` to cancel them and
//! write one final flush. Nothing here is a process-wide global, so tests
//! can run isolated instances side by side.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerRegistry, BreakerStatus};
use crate::config::GovernanceConfig;
use crate::cost::CostTracker;
use crate::limiter::RateLimiter;
use crate::pool::{PoolManager, PoolSummary};
use crate::store::Store;

/// Operator-facing snapshot of execution state
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStatus {
    /// Aggregate pool counters
    pub pools: PoolSummary,
    /// Every breaker's state
    pub breakers: Vec<BreakerStatus>,
}

/// The admission-control and execution-governance engine
pub struct Governor {
    config: Arc<GovernanceConfig>,
    limiter: Arc<RateLimiter>,
    pools: Arc<PoolManager>,
    breakers: Arc<BreakerRegistry>,
    costs: Arc<CostTracker>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Governor {
    /// Wire up all components over one durable store
    #[must_use]
    pub fn new(store: Store, config: GovernanceConfig) -> Self {
        let store = Arc::new(store);
        let config = Arc::new(config);
        let costs = Arc::new(CostTracker::new(Arc::clone(&store)));
        let limiter = Arc::new(RateLimiter::new(
            store,
            Arc::clone(&config),
            Arc::clone(&costs),
        ));
        let pools = Arc::new(PoolManager::new(config.pool.clone()));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        Self {
            config,
            limiter,
            pools,
            breakers,
            costs,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Admission decisions and per-user limit state
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Named execution pools
    #[must_use]
    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Per-operation circuit breakers
    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Cost accounting over the usage ledger
    #[must_use]
    pub fn costs(&self) -> &Arc<CostTracker> {
        &self.costs
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    /// Launch the periodic flush and quota sweep tasks. Calling `start`
    /// more than once is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }

        let flush_interval = Duration::from_secs(self.config.flush_interval_secs);
        let limiter = Arc::clone(&self.limiter);
        let pools = Arc::clone(&self.pools);
        let token = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match limiter.flush().await {
                            Ok(rows) if rows > 0 => debug!(rows = rows, "Governance state flushed"),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Governance flush failed"),
                        }
                        pools.prune_idle_keys();
                    }
                }
            }
        }));

        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs);
        let limiter = Arc::clone(&self.limiter);
        let token = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        match limiter.quotas().sweep().await {
                            Ok(rows) if rows > 0 => debug!(rows = rows, "Quota sweep flushed rows"),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Quota sweep failed"),
                        }
                    }
                }
            }
        }));

        info!(
            flush_interval_secs = self.config.flush_interval_secs,
            sweep_interval_secs = self.config.sweep_interval_secs,
            "Governance engine started"
        );
    }

    /// Cancel background tasks and write one final flush
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        match self.limiter.flush().await {
            Ok(rows) => info!(rows = rows, "Governance engine stopped"),
            Err(e) => warn!(error = %e, "Final governance flush failed"),
        }
    }

    /// Operator-facing snapshot of pools and breakers
    #[must_use]
    pub fn status(&self) -> GovernorStatus {
        GovernorStatus {
            pools: self.pools.summary(),
            breakers: self.breakers.states(),
        }
    }
}

#[cfg(test)]
mod tests;
