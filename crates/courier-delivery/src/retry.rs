//! Exponential backoff with jitter and per-attempt timeout tiers.
//!
//! The delay before attempt `n + 1` is `min(base · 2^(n-1), max)` randomized
//! by `±jitter`. Timeout tiers are independent of the backoff: attempt `n`
//! uses `timeouts[min(n-1, len-1)]`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry timing shared by every subscription.
///
/// The attempt budget comes from each subscription's `max_retries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound on the un-jittered delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0).
    pub jitter_factor: f64,

    /// Request timeout per attempt; the last tier repeats.
    pub timeouts: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.25,
            timeouts: vec![Duration::from_secs(5), Duration::from_secs(10), Duration::from_secs(20)],
        }
    }
}

impl RetryPolicy {
    /// Jittered backoff after failed attempt `attempt` (1-based).
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, self.base_delay, self.max_delay, self.jitter_factor)
    }

    /// Request timeout for attempt `attempt` (1-based).
    pub fn timeout_for_attempt(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
        self.timeouts
            .get(index)
            .or_else(|| self.timeouts.last())
            .copied()
            .unwrap_or(Duration::from_secs(20))
    }
}

/// Retry decision context for a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt that just failed (1-based).
    pub attempt_number: u32,
    /// Attempt budget of the subscription.
    pub max_attempts: u32,
    /// Error that caused the failure.
    pub error: DeliveryError,
    /// Timestamp of the failed attempt.
    pub failed_at: DateTime<Utc>,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the delivery at the specified time.
    Retry {
        /// When the next attempt becomes due
        next_attempt_at: DateTime<Utc>,
    },
    /// Do not retry; the delivery has permanently failed.
    GiveUp {
        /// Reason why the delivery should not be retried
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed attempt.
    pub fn new(
        attempt_number: u32,
        max_attempts: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self { attempt_number, max_attempts, error, failed_at }
    }

    /// Decides whether and when to retry.
    ///
    /// Every non-2xx response is retried with backoff until the attempt
    /// budget is spent, including 4xx statuses the error taxonomy calls
    /// permanent. Errors without a response that are not retryable, such
    /// as signing failures, give up immediately.
    pub fn decide_retry(&self, policy: &RetryPolicy) -> RetryDecision {
        if !self.error.is_retryable() && self.error.http_status().is_none() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {}", self.error) };
        }

        if self.attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exhausted: {}", self.max_attempts, self.error),
            };
        }

        let delay = policy.calculate_backoff(self.attempt_number);
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp { reason: "retry delay duration out of range".to_string() };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + chrono_delay }
    }
}

/// `min(base · 2^(attempt-1), max)` with uniform jitter in `±jitter · delay`,
/// floored at zero.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration, jitter_factor: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let exponential = base.saturating_mul(2_u32.saturating_pow(exponent));
    let capped = exponential.min(max);

    apply_jitter(capped, jitter_factor)
}

/// Randomizes the delay by ±`jitter_factor` to spread retries out.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}
