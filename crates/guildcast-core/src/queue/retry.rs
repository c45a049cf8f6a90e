//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff, capped at `max_delay`, with optional random jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay (before jitter).
    pub max_delay: Duration,

    /// Up to this much is added at random to each delay. Zero disables jitter.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    /// 2s, 4s, 8s, ... capped at 5 minutes, no jitter.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Handy for tests and drain runs.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before the next attempt, given how many attempts already failed
    /// (1-indexed): `base_delay * multiplier^(failed_attempts - 1)`.
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - 1 failure: 2s
    /// - 2 failures: 4s
    /// - 3 failures: 8s
    pub fn next_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = i32::try_from(failed_attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let delay = Duration::try_from_secs_f64(delay_secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        delay + self.random_jitter()
    }

    fn random_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_millis))
    }
}
