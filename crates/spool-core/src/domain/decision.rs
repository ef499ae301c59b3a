//! Retry & dead-letter policy.
//!
//! Given the envelope (whose `attempt_count` already includes the dispatch
//! that just finished) and its outcome, decide what the store should do next.
//! This is a pure function: the poll loop carries out the returned [`Action`].

use std::time::Duration;

use super::{Envelope, Outcome};

/// Reason recorded when a task runs out of attempts.
pub const MAX_ATTEMPTS_EXCEEDED: &str = "max attempts exceeded";

/// The resolution for a dispatched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Remove from staging for good.
    Acknowledge,

    /// Put back at the tail of the pending queue after `delay`.
    Restage(Duration),

    /// Move to the dead-letter location with a reason.
    DeadLetter(String),
}

/// Attempt budget plus exponential backoff.
///
/// Example with base_delay=2s, multiplier=2.0, max_delay=30s:
/// - after attempt 1: 2s
/// - after attempt 2: 4s
/// - after attempt 3: 8s
/// - after attempt 4: 16s
/// - after attempt 5: 30s (capped)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Default policy: 5 attempts, 2s base, 5 minute cap.
    pub fn default_v1() -> Self {
        Self::new(5, Duration::from_secs(2), Duration::from_secs(300))
    }

    /// Delay before the next try, given how many dispatches already happened
    /// (1-indexed): `base_delay * multiplier^(attempts - 1)`, capped at
    /// `max_delay`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        if !delay_secs.is_finite() || delay_secs >= max_secs {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }

    pub fn decide(&self, envelope: &Envelope, outcome: &Outcome) -> Action {
        match outcome {
            Outcome::Success => Action::Acknowledge,
            Outcome::FatalFailure(reason) => Action::DeadLetter(reason.clone()),
            Outcome::RetryableFailure(_) if envelope.attempt_count >= self.max_attempts => {
                Action::DeadLetter(MAX_ATTEMPTS_EXCEEDED.to_string())
            }
            Outcome::RetryableFailure(_) => {
                Action::Restage(self.next_delay(envelope.attempt_count))
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_v1()
    }
}
