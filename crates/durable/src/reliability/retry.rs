//! Retry policy for task invocations
//!
//! The dispatcher consults the policy when a worker reports a failure or a
//! heartbeat / start-to-close deadline lapses. Intermediate attempts are never
//! written to the event log; only the final outcome is.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activity::ActivityError;
use crate::config::duration_millis;

/// How a task is retried
///
/// The wait after failed attempt `n` is
/// `min(initial_interval * backoff_coefficient^(n-1), max_interval)`,
/// optionally spread by `jitter`.
///
/// ```
/// use ledgerflow_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential().with_max_interval(Duration::from_secs(3));
///
/// assert_eq!(policy.backoff(1), Duration::from_secs(1));
/// assert_eq!(policy.backoff(2), Duration::from_secs(2));
/// assert_eq!(policy.backoff(3), Duration::from_secs(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    pub backoff_coefficient: f64,
    /// Fraction of the delay added or removed at random (0.0 keeps delays exact)
    #[serde(default)]
    pub jitter: f64,
    /// Error types that fail the task on the first occurrence
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

/// Outcome of consulting the policy after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the task claimable again after `delay`
    Retry { delay: Duration },
    /// Record `activity_failed`
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The activity marked the error as permanent
    NonRetryable,
    /// The error type is listed in `non_retryable_errors`
    ListedErrorType,
    AttemptsExhausted,
}

impl GiveUpReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GiveUpReason::NonRetryable => "non_retryable",
            GiveUpReason::ListedErrorType => "listed_error_type",
            GiveUpReason::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// 5 attempts, 1s doubling up to 60s, no jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.0,
            non_retryable_errors: Vec::new(),
        }
    }

    /// Same wait before every retry
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            ..Self::exponential()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Clamped to `0.0..=1.0`
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Decide what happens to a task whose attempt `failed_attempt` failed
    pub fn decide(&self, failed_attempt: u32, error: &ActivityError) -> RetryDecision {
        if !error.retryable {
            return RetryDecision::GiveUp(GiveUpReason::NonRetryable);
        }
        if let Some(error_type) = error.error_type.as_deref() {
            if self.non_retryable_errors.iter().any(|e| e == error_type) {
                return RetryDecision::GiveUp(GiveUpReason::ListedErrorType);
            }
        }
        if failed_attempt >= self.max_attempts {
            return RetryDecision::GiveUp(GiveUpReason::AttemptsExhausted);
        }
        RetryDecision::Retry {
            delay: self.backoff(failed_attempt),
        }
    }

    /// Wait after failed attempt `failed_attempt` (1-based)
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let spread = capped * self.jitter;
        let secs = if spread > 0.0 {
            (capped + rand::thread_rng().gen_range(-spread..=spread)).max(0.0)
        } else {
            capped
        };
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_interval)
    }
}
