//! In-memory per-user presence, derived from activity timestamps.
//!
//! Presence is per-user, not per-connection. Activity pings (throttled
//! client-side to ~800ms) keep a user present; the inactivity sweep takes
//! idle users offline even while their socket stays up — backgrounded tabs
//! never send a socket-level disconnect. Real socket loss goes through the
//! registry's grace window instead; the two thresholds are independent.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use banter_common::scope::normalize_username;

struct Activity {
    last_active: Instant,
    online: bool,
}

/// Process-wide presence tracker.
pub struct PresenceTracker {
    inner: DashMap<String, Activity>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Record activity. Returns true exactly once per absent/offline →
    /// present transition, so the caller broadcasts "online" at most once.
    pub fn mark_active(&self, username: &str) -> bool {
        let mut entry = self
            .inner
            .entry(normalize_username(username))
            .or_insert_with(|| Activity {
                last_active: Instant::now(),
                online: false,
            });
        entry.last_active = Instant::now();
        let transitioned = !entry.online;
        entry.online = true;
        transitioned
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.inner
            .get(&normalize_username(username))
            .map(|entry| entry.online)
            .unwrap_or(false)
    }

    /// Take users idle past `threshold` offline. Returns the usernames
    /// that just transitioned so the caller can broadcast; users already
    /// offline are never returned twice.
    pub fn sweep_idle(&self, threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut went_offline = Vec::new();
        for mut entry in self.inner.iter_mut() {
            if entry.online && now.duration_since(entry.last_active) > threshold {
                entry.online = false;
                went_offline.push(entry.key().clone());
            }
        }
        went_offline
    }

    /// Drop the record entirely (confirmed disconnect). Returns true when
    /// the user was online, so the caller knows an offline broadcast is due.
    pub fn remove(&self, username: &str) -> bool {
        self.inner
            .remove(&normalize_username(username))
            .map(|(_, entry)| entry.online)
            .unwrap_or(false)
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-interval inactivity sweep. Runs for the life of the process and
/// announces each online→offline transition once.
pub async fn run_inactivity_sweeper(state: crate::AppState) {
    let threshold = Duration::from_millis(state.config.idle_threshold_ms);
    let mut interval =
        tokio::time::interval(Duration::from_millis(state.config.sweep_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        for username in state.presence.sweep_idle(threshold) {
            tracing::debug!(%username, "idle past threshold, marking offline");
            state.broadcast.global(
                super::events::EventName::PRESENCE_OFFLINE,
                serde_json::json!({ "username": username }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_transition_fires_exactly_once() {
        let presence = PresenceTracker::new();
        assert!(presence.mark_active("Alice"));
        assert!(!presence.mark_active("alice"));
        assert!(!presence.mark_active("ALICE"));
        assert!(presence.is_online("alice"));
    }

    #[test]
    fn sweep_takes_idle_users_offline_once() {
        let presence = PresenceTracker::new();
        presence.mark_active("alice");
        presence.mark_active("bob");

        // Nobody is past a generous threshold.
        assert!(presence.sweep_idle(Duration::from_secs(30)).is_empty());

        // With a zero threshold everyone idles out, exactly once.
        let mut gone = presence.sweep_idle(Duration::ZERO);
        gone.sort();
        assert_eq!(gone, vec!["alice", "bob"]);
        assert!(presence.sweep_idle(Duration::ZERO).is_empty());
        assert!(!presence.is_online("alice"));
    }

    #[test]
    fn activity_after_sweep_transitions_again() {
        let presence = PresenceTracker::new();
        presence.mark_active("alice");
        presence.sweep_idle(Duration::ZERO);
        assert!(presence.mark_active("alice"));
        assert!(presence.is_online("alice"));
    }

    #[test]
    fn remove_reports_whether_user_was_online() {
        let presence = PresenceTracker::new();
        presence.mark_active("alice");
        assert!(presence.remove("alice"));
        assert!(!presence.remove("alice"));
        assert!(!presence.is_online("alice"));
    }
}
