//! Retry policy for task attempts.
//!
//! A task that fails is re-invoked while `attempt < max_attempts` and the
//! error matches the policy's [`RetryOn`] predicate. Some error kinds are
//! never retried regardless of policy: routing failures, unresolved inputs
//! and cancellation.

use relay_core::{ErrorKind, TaskError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delay schedule between attempts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately
    None,
    /// Constant delay between attempts
    Fixed { delay_ms: u64 },
    /// `initial_ms * multiplier^(n-1)` after the n-th failure, capped at `max_ms`
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let millis = (*initial_ms as f64) * multiplier.powi(exponent);
                let capped = if millis.is_finite() {
                    millis.min(*max_ms as f64)
                } else {
                    *max_ms as f64
                };
                Duration::from_millis(capped.max(0.0) as u64)
            }
        }
    }

    /// Checks the schedule parameters, returning a description of the problem.
    pub fn check(&self) -> Result<(), String> {
        match self {
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err(format!("backoff multiplier {multiplier} must be >= 1.0"));
                }
                if max_ms < initial_ms {
                    return Err(format!(
                        "backoff max_ms {max_ms} is below initial_ms {initial_ms}"
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Default for Backoff {
    /// Exponential: 100 ms doubling, capped at 30 s.
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: 100,
            multiplier: 2.0,
            max_ms: 30_000,
        }
    }
}

/// Closure deciding whether an error is retryable.
pub type RetryPredicate = Arc<dyn Fn(&TaskError) -> bool + Send + Sync>;

/// Which errors a policy retries.
#[derive(Clone, Default)]
pub enum RetryOn {
    /// Timeouts and worker errors
    #[default]
    Transient,
    /// Only the listed kinds
    Kinds(Vec<ErrorKind>),
    /// Only worker errors carrying one of these codes
    WorkerCodes(Vec<String>),
    /// Nothing is retried
    Never,
    /// Custom predicate
    Predicate(RetryPredicate),
}

impl RetryOn {
    fn matches(&self, error: &TaskError) -> bool {
        match self {
            RetryOn::Transient => matches!(error.kind(), ErrorKind::Timeout | ErrorKind::Worker),
            RetryOn::Kinds(kinds) => kinds.contains(&error.kind()),
            RetryOn::WorkerCodes(codes) => error
                .worker_code()
                .is_some_and(|code| codes.iter().any(|c| c == code)),
            RetryOn::Never => false,
            RetryOn::Predicate(predicate) => predicate(error),
        }
    }
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryOn::Transient => f.write_str("Transient"),
            RetryOn::Kinds(kinds) => f.debug_tuple("Kinds").field(kinds).finish(),
            RetryOn::WorkerCodes(codes) => f.debug_tuple("WorkerCodes").field(codes).finish(),
            RetryOn::Never => f.write_str("Never"),
            RetryOn::Predicate(_) => f.write_str("Predicate(<fn>)"),
        }
    }
}

/// Retry policy of one task.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first, at least 1
    pub max_attempts: u32,
    /// Delay schedule between attempts
    pub backoff: Backoff,
    /// Retryable-error predicate
    pub retry_on: RetryOn,
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget and default backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::default(),
            retry_on: RetryOn::default(),
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            retry_on: RetryOn::Never,
        }
    }

    /// Sets the backoff schedule.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the retryable-error predicate.
    pub fn retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    /// Decides whether a failed attempt should be followed by another.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt that just failed (1-based)
    /// * `error` - Its error
    pub fn should_retry(&self, attempt: u32, error: &TaskError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match error.kind() {
            ErrorKind::NoRouteMatched | ErrorKind::UnresolvedReference | ErrorKind::Cancelled => {
                false
            }
            _ => self.retry_on.matches(error),
        }
    }

    /// Delay before the attempt following `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.delay_after(attempt)
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, exponential backoff, transient errors retried.
    fn default() -> Self {
        Self::new(3)
    }
}
