//! Retry policy for backend calls, independent of the circuit breaker.

use std::time::Duration;

use rand::Rng;

/// Attempt cap plus exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Reads: one call plus up to two retries on timeout/network errors.
    pub fn reads() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }

    /// Writes: at most two tries; the breaker handles anything beyond that.
    pub fn writes() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }

    /// Delay before retry number `attempt` (1-based count of failures so
    /// far): exponential, capped, with up to 50% added jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(6);
        let exp = self.base_delay.saturating_mul(1 << shift);
        let capped = exp.min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
        capped + Duration::from_millis(jitter_ms)
    }
}
