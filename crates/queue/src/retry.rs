//! Retry policy applied when a job handler fails.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay schedule between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `delay`, `2 * delay`, `4 * delay`, ...
    Exponential { delay: Duration },
}

impl Backoff {
    /// Delay before the retry that follows `attempts_made` failed attempts.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { delay } => {
                let exponent = attempts_made.saturating_sub(1).min(20);
                delay.saturating_mul(2u32.pow(exponent))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total deliveries allowed per job, the first one included.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                delay: Duration::from_millis(1_000),
            },
        }
    }
}

impl RetryPolicy {
    /// `Some(delay)` when another attempt is allowed after `attempts_made`
    /// failures, `None` once the job is exhausted.
    pub fn next_delay(&self, attempts_made: u32) -> Option<Duration> {
        if attempts_made >= self.max_attempts {
            None
        } else {
            Some(self.backoff.delay_after(attempts_made))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_from_base() {
        let backoff = Backoff::Exponential { delay: Duration::from_millis(1_000) };
        assert_eq!(backoff.delay_after(1), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_after(2), Duration::from_millis(2_000));
        assert_eq!(backoff.delay_after(3), Duration::from_millis(4_000));
    }

    #[test]
    fn exponential_does_not_overflow() {
        let backoff = Backoff::Exponential { delay: Duration::from_secs(u64::MAX / 2) };
        assert_eq!(backoff.delay_after(40), Duration::MAX);
    }

    #[test]
    fn fixed_is_constant() {
        let backoff = Backoff::Fixed { delay: Duration::from_millis(250) };
        assert_eq!(backoff.delay_after(1), backoff.delay_after(7));
    }

    #[test]
    fn policy_stops_at_max_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(3), None);
    }
}
