//! Retry policies.
//!
//! A policy is a pure function from `(attempt, last_error)` to a
//! [`RetryDecision`]; it never sleeps, schedules, or mutates anything.
//! The engine owns the clock: it consults the policy, then either
//! defers the packet or gives up, and the reconnect loop does the same
//! for connection attempts.

use std::time::Duration;

use crate::error::TransportError;

// =============================================================================
// Constants
// =============================================================================

/// Jitter percentage for exponential backoff (±20%).
///
/// Adding randomness to retry delays prevents the "thundering herd"
/// problem where many devices reconnect simultaneously after a hub
/// restart.
const BACKOFF_JITTER_PERCENT: f64 = 0.2;

/// Minimum delay between attempts in milliseconds.
///
/// Even with jitter pulling downward, we never retry faster than this
/// to avoid overwhelming a recovering hub.
const MIN_RETRY_DELAY_MS: u64 = 100;

/// The outcome of consulting a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether another attempt should be made at all.
    pub should_retry: bool,
    /// How long to wait before that attempt.
    pub delay: Duration,
}

impl RetryDecision {
    /// Retry after the given delay.
    pub fn retry_after(delay: Duration) -> Self {
        Self {
            should_retry: true,
            delay,
        }
    }

    /// Give up.
    pub fn stop() -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Decides whether and when a failed operation is attempted again.
///
/// `current_attempt` counts failures so far: the first consultation for
/// a packet arrives with `1`, the reconnect loop starts at `0`.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    fn decide(&self, current_attempt: u32, last_error: &TransportError) -> RetryDecision;
}

/// Exponential backoff with jitter, the default policy.
///
/// Delay grows as `base * 2^(attempt-1)`, capped at `max_delay`, with
/// ±20% jitter applied and a 100 ms floor.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffWithJitter {
    /// Attempts before giving up (0 = unlimited).
    max_attempts: u32,
    /// Delay of the first retry, doubled on each subsequent one.
    base_delay: Duration,
    /// Upper bound for the un-jittered delay.
    max_delay: Duration,
}

impl ExponentialBackoffWithJitter {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }
}

impl Default for ExponentialBackoffWithJitter {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy for ExponentialBackoffWithJitter {
    fn decide(&self, current_attempt: u32, _last_error: &TransportError) -> RetryDecision {
        if self.max_attempts > 0 && current_attempt >= self.max_attempts {
            return RetryDecision::stop();
        }

        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms
            .saturating_mul(2u64.saturating_pow(current_attempt.saturating_sub(1)))
            .min(self.max_delay.as_millis() as u64);

        // Apply jitter (±BACKOFF_JITTER_PERCENT) with a hard floor
        let jitter =
            (delay_ms as f64 * BACKOFF_JITTER_PERCENT * (rand_jitter() * 2.0 - 1.0)) as i64;
        let final_ms = (delay_ms as i64 + jitter).max(MIN_RETRY_DELAY_MS as i64) as u64;

        RetryDecision::retry_after(Duration::from_millis(final_ms))
    }
}

/// A policy that never retries. Useful when the application prefers to
/// see every failure immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn decide(&self, _current_attempt: u32, _last_error: &TransportError) -> RetryDecision {
        RetryDecision::stop()
    }
}

/// Generate a random jitter value between 0.0 and 1.0.
///
/// Uses the `rand` crate's thread-local RNG for proper randomness; a
/// predictable pattern would defeat the point of jitter.
fn rand_jitter() -> f64 {
    use rand::Rng;
    rand::rng().random::<f64>()
}
