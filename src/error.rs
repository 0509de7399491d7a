//! Error types for themis
//!
//! Admission denials, pool saturation, and open circuits are expected
//! control-flow outcomes, not faults: callers should surface them to the
//! user and must not log them as errors. Storage failures are the only
//! variants that indicate something is actually wrong.

use std::time::Duration;
use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Request rejected before execution (quota, suspension, or rate limit)
    #[error("admission denied: {reason}")]
    AdmissionDenied {
        /// Human-readable denial reason
        reason: String,
        /// How long the caller should wait before retrying, if known
        retry_after: Option<Duration>,
    },

    /// Pool queue depth cap exceeded
    #[error("pool '{pool}' saturated")]
    PoolSaturated {
        /// Pool name
        pool: String,
    },

    /// Circuit breaker is open for the requested operation
    #[error("circuit open: {operation}")]
    CircuitOpen {
        /// Operation name
        operation: String,
    },

    /// Durable store failure
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Invalid configuration
    #[error("invalid configuration: {field}")]
    InvalidConfig {
        /// Config field name
        field: String,
        /// Detailed message
        message: String,
    },

    /// Wrapped work (LLM call, tool call) failed
    #[error("task error: {0}")]
    Task(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns `true` for expected backpressure outcomes that callers
    /// should present to the user rather than treat as faults.
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            Error::AdmissionDenied { .. } | Error::PoolSaturated { .. } | Error::CircuitOpen { .. }
        )
    }

    /// Get a user-friendly message suitable for a chat reply
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Error::AdmissionDenied {
                reason,
                retry_after,
            } => {
                if let Some(wait) = retry_after {
                    format!(
                        "⏳ {}. Please wait {} seconds.",
                        reason,
                        wait.as_secs().max(1)
                    )
                } else {
                    format!("⏳ {}.", reason)
                }
            }
            Error::PoolSaturated { .. } => {
                "⏳ The assistant is busy right now. Please try again shortly.".to_string()
            }
            Error::CircuitOpen { operation } => {
                format!("🔌 '{}' is temporarily unavailable.", operation)
            }
            Error::Storage(_) => "❌ Internal storage problem.".to_string(),
            Error::InvalidConfig { field, message } => {
                format!("⚙️ Configuration error in '{}': {}", field, message)
            }
            Error::Task(msg) => format!("⚡ Execution failed: {}", msg),
        }
    }
}
