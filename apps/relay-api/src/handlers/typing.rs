//! Rate limiter for "started typing" relays.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use banter_common::scope::normalize_username;

/// Entries past this size trigger a prune of stale keys.
const PRUNE_THRESHOLD: usize = 4096;

/// Per-(scope, user) limiter. "Started" relays pass at most once per
/// interval; "stopped" never consults this.
pub struct TypingLimiter {
    min_interval: Duration,
    last: Mutex<HashMap<(String, String), Instant>>,
}

impl TypingLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow_started(&self, scope_id: &str, username: &str) -> bool {
        let mut last = self.last.lock();
        if last.len() > PRUNE_THRESHOLD {
            let cutoff = Instant::now() - self.min_interval * 8;
            last.retain(|_, at| *at > cutoff);
        }

        let key = (scope_id.to_string(), normalize_username(username));
        let now = Instant::now();
        match last.get(&key) {
            Some(at) if now.duration_since(*at) < self.min_interval => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }
}
