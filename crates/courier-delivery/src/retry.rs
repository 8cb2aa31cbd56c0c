//! Exponential backoff for failed deliveries.
//!
//! The worker consults the policy after every failed attempt. Each prior
//! attempt doubles the delay: with the defaults a message is retried after
//! 1s, 2s, 4s, 8s and 16s, and the sixth failure dead-letters it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated before dead-lettering. A message whose attempt
    /// count has reached this value is not retried again.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0). Zero keeps delays exact.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
        }
    }
}

/// What to do with a message after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park the message until `next_attempt_at`.
    Retry {
        /// When the scheduler may re-enqueue the message
        next_attempt_at: DateTime<Utc>,
        /// Delay that produced `next_attempt_at`
        delay: Duration,
    },
    /// Dead-letter the message.
    GiveUp {
        /// Reason why the delivery should not be retried
        reason: String,
    },
}

impl RetryPolicy {
    /// Decides the fate of a message that just failed.
    ///
    /// `attempt_count` is the number of attempts performed *before* the one
    /// that just failed.
    pub fn decide(&self, attempt_count: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if attempt_count >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.max_attempts),
            };
        }

        let delay = self.backoff_delay(attempt_count);
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: failed_at + chrono_delay, delay }
    }

    /// Delay before the next attempt, given the number of prior attempts.
    ///
    /// `base_delay * 2^attempt_count`, capped at `max_delay`, then jittered.
    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt_count.min(31));
        let exponential = self.base_delay.saturating_mul(multiplier);
        let capped = exponential.min(self.max_delay);

        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }
}

/// Randomizes a delay by up to ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_doubles_from_one_second() {
        let policy = RetryPolicy::default();

        let delays: Vec<u64> = (0..5).map(|n| policy.backoff_delay(n).as_secs()).collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn gives_up_once_budget_is_spent() {
        let policy = RetryPolicy::default();

        assert!(matches!(policy.decide(4, Utc::now()), RetryDecision::Retry { .. }));
        match policy.decide(5, Utc::now()) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("sixth failure must not retry"),
        }
    }

    #[test]
    fn retry_time_is_failure_time_plus_delay() {
        let policy = RetryPolicy::default();
        let failed_at = Utc::now();

        let RetryDecision::Retry { next_attempt_at, delay } = policy.decide(3, failed_at) else {
            unreachable!("attempt 3 is within budget");
        };

        assert_eq!(delay, Duration::from_secs(8));
        assert_eq!(next_attempt_at - failed_at, chrono::Duration::seconds(8));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 100,
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };

        assert_eq!(policy.backoff_delay(10), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(64), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy { jitter_factor: 0.25, ..RetryPolicy::default() };

        for _ in 0..100 {
            let delay = policy.backoff_delay(3).as_secs_f64();
            assert!((6.0..=10.0).contains(&delay), "delay {delay} out of range");
        }
    }
}
