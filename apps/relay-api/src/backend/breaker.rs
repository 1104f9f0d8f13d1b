//! Circuit breaker guarding backend writes.
//!
//! A plain state machine: closed until `threshold` consecutive qualifying
//! failures, then open for `cooldown`, after which the next attempt probes
//! the backend again. Retry policy lives elsewhere ([`super::retry`]); the
//! breaker only counts call-level outcomes.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Outcome of asking the breaker whether a write may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    ShortCircuit,
}

struct BreakerState {
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// Process-wide breaker shared by every write path.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState {
                failure_count: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a write attempt may reach the network right now.
    ///
    /// An open breaker whose cooldown has elapsed closes here, so exactly
    /// the next attempt probes the backend.
    pub fn check(&self) -> BreakerDecision {
        let mut state = self.state.lock();
        match state.opened_at {
            Some(at) if at.elapsed() < self.cooldown => BreakerDecision::ShortCircuit,
            Some(_) => {
                state.opened_at = None;
                state.failure_count = 0;
                BreakerDecision::Allow
            }
            None => BreakerDecision::Allow,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.failure_count = 0;
        state.opened_at = None;
    }

    /// Record one call-level failure (after retry exhaustion). Crossing the
    /// threshold opens the breaker from this moment.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count += 1;
        if state.failure_count >= self.threshold {
            state.opened_at = Some(Instant::now());
        }
    }

    /// Current state, for logging and the metrics summary.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        matches!(state.opened_at, Some(at) if at.elapsed() < self.cooldown)
    }
}
