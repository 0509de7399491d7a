//! Circuit breakers for failure isolation
//!
//! One breaker per logical operation (a provider, a tool, a sub-agent
//! type), so a failing dependency does not starve unrelated ones. Three
//! states:
//! - Closed: calls pass through, outcomes land in a sliding window
//! - Open: calls fail immediately, nothing is invoked downstream
//! - HalfOpen: exactly one trial call at a time probes for recovery

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Failure rate exceeded the threshold - calls are rejected
    Open,
    /// Probing recovery - one trial call at a time
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Configuration for circuit breakers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failure rate (0.0 - 1.0) above which the circuit opens
    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: f64,
    /// Minimum outcomes in the window before the rate is evaluated,
    /// so a single early failure cannot trip the circuit
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
    /// Maximum outcomes kept in the sliding window
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    /// Outcomes older than this many seconds fall out of the window
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Seconds to stay Open before permitting a trial call
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Consecutive trial successes required to close the circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_rate() -> f64 {
    0.5
}
fn default_min_samples() -> u32 {
    5
}
fn default_max_samples() -> usize {
    50
}
fn default_window_secs() -> u64 {
    60
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_success_threshold() -> u32 {
    2
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_failure_rate(),
            min_samples: default_min_samples(),
            max_samples: default_max_samples(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl BreakerConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure rate threshold
    #[must_use]
    pub fn with_failure_rate_threshold(mut self, threshold: f64) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    /// Set the minimum sample size
    #[must_use]
    pub fn with_min_samples(mut self, samples: u32) -> Self {
        self.min_samples = samples;
        self
    }

    /// Set the cool-down before a trial call is permitted
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_secs = cooldown.as_secs();
        self
    }

    /// Set the consecutive trial successes required to close
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Sliding window duration
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Cool-down duration
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: Instant,
    ok: bool,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    outcomes: VecDeque<Outcome>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    trial_successes: u32,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            outcomes: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
            trial_successes: 0,
        }
    }

    fn prune(&mut self, now: Instant, config: &BreakerConfig) {
        let window = config.window();
        while let Some(front) = self.outcomes.front() {
            if now.duration_since(front.at) > window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
        while self.outcomes.len() > config.max_samples {
            self.outcomes.pop_front();
        }
    }

    fn failure_rate(&self) -> (usize, f64) {
        let total = self.outcomes.len();
        if total == 0 {
            return (0, 0.0);
        }
        let failures = self.outcomes.iter().filter(|o| !o.ok).count();
        (total, failures as f64 / total as f64)
    }
}

/// Kind of call admitted through the breaker
enum Permit<'a> {
    /// Normal call in the Closed state
    Normal,
    /// The single HalfOpen trial call
    Trial(TrialGuard<'a>),
}

/// Frees the half-open trial slot if the call is dropped before an
/// outcome lands (a caller that times out and stops waiting must not
/// wedge the breaker in HalfOpen forever).
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl TrialGuard<'_> {
    /// Disarm before recording the outcome; the outcome path clears
    /// `trial_in_flight` itself under the same lock
    fn complete(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.breaker.inner.lock().unwrap();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
            debug!(name = %self.breaker.name, "Circuit breaker trial abandoned, slot released");
        }
    }
}

/// Failure-isolation state machine for one operation
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BreakerConfig::default())
    }

    /// Operation name this breaker guards
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Admit or reject a call, transitioning Open to HalfOpen when the
    /// cool-down has elapsed
    fn begin_call(&self) -> Result<Permit<'_>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.prune(now, &self.config);

        match inner.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| now.duration_since(at) >= self.config.cooldown())
                    .unwrap_or(true);
                if cooled {
                    info!(name = %self.name, "Circuit breaker entering half-open state");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    inner.trial_successes = 0;
                    Ok(Permit::Trial(TrialGuard {
                        breaker: self,
                        armed: true,
                    }))
                } else {
                    Err(Error::CircuitOpen {
                        operation: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    // Only one trial at a time; concurrent callers fail fast.
                    Err(Error::CircuitOpen {
                        operation: self.name.clone(),
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::Trial(TrialGuard {
                        breaker: self,
                        armed: true,
                    }))
                }
            }
        }
    }

    fn on_success(&self, permit: Permit<'_>) {
        let trial = match permit {
            Permit::Normal => false,
            Permit::Trial(guard) => {
                guard.complete();
                true
            }
        };
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.outcomes.push_back(Outcome { at: now, ok: true });
        inner.prune(now, &self.config);

        if trial {
            inner.trial_in_flight = false;
            inner.trial_successes += 1;
            debug!(
                name = %self.name,
                successes = inner.trial_successes,
                threshold = self.config.success_threshold,
                "Circuit breaker trial succeeded"
            );
            if inner.trial_successes >= self.config.success_threshold {
                info!(name = %self.name, "Circuit breaker closed");
                inner.state = CircuitState::Closed;
                inner.outcomes.clear();
                inner.opened_at = None;
                inner.trial_successes = 0;
            }
        } else {
            // A success can still complete a window whose failure rate is
            // over the threshold.
            self.maybe_trip(&mut inner, now);
        }
    }

    fn on_failure(&self, permit: Permit<'_>) {
        let trial = match permit {
            Permit::Normal => false,
            Permit::Trial(guard) => {
                guard.complete();
                true
            }
        };
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.outcomes.push_back(Outcome { at: now, ok: false });
        inner.prune(now, &self.config);

        if trial {
            warn!(name = %self.name, "Circuit breaker trial failed, reopening");
            inner.trial_in_flight = false;
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
        } else {
            self.maybe_trip(&mut inner, now);
        }
    }

    /// Open the circuit if the window holds enough samples and the failure
    /// rate is over the threshold
    fn maybe_trip(&self, inner: &mut Inner, now: Instant) {
        if inner.state != CircuitState::Closed {
            return;
        }
        let (samples, rate) = inner.failure_rate();
        if samples >= self.config.min_samples as usize && rate > self.config.failure_rate_threshold
        {
            warn!(
                name = %self.name,
                samples = samples,
                failure_rate = rate,
                "Circuit breaker opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
        }
    }

    /// Run `work` through the breaker, recording its outcome.
    ///
    /// Fails immediately with [`Error::CircuitOpen`] when the circuit is
    /// open or another trial call is already in flight.
    pub async fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = self.begin_call()?;
        match work.await {
            Ok(value) => {
                self.on_success(permit);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(permit);
                Err(e)
            }
        }
    }

    /// Force the breaker back to Closed with a cleared window
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::new();
    }

    /// Snapshot for display
    #[must_use]
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock().unwrap();
        let failures = inner.outcomes.iter().filter(|o| !o.ok).count() as u64;
        let successes = inner.outcomes.len() as u64 - failures;
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            recent_successes: successes,
            recent_failures: failures,
        }
    }
}

/// Snapshot of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    /// Operation name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Successes currently in the window
    pub recent_successes: u64,
    /// Failures currently in the window
    pub recent_failures: u64,
}

/// Registry of per-operation breakers
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    /// Create a registry; breakers are created on first use with `config`
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Get or create the breaker for an operation
    pub fn breaker(&self, operation: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(operation.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(operation, self.config.clone())))
            .clone()
    }

    /// Run `work` through the breaker for `operation`
    pub async fn run<T, F>(&self, operation: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.breaker(operation).run(work).await
    }

    /// Snapshot of every breaker
    #[must_use]
    pub fn states(&self) -> Vec<BreakerStatus> {
        let mut states: Vec<_> = self.breakers.iter().map(|b| b.status()).collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Force every breaker back to Closed (administrative recovery)
    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
        info!(count = self.breakers.len(), "All circuit breakers reset");
    }
}

#[cfg(test)]
mod tests;
