//! Connection registry: the canonical map of live connections, plus the
//! pending-disconnect table and its grace timers.
//!
//! Invariants are enforced at this boundary only: at most one pending
//! entry per username, and a reconnect inside the grace window is one
//! atomic check-and-cancel with no public leave/offline.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;

use banter_common::scope::normalize_username;

use super::session::Session;

/// Grace-window bookkeeping for a user whose socket(s) dropped.
struct PendingDisconnect {
    at: Instant,
    connection_ids: Vec<String>,
    /// Union of scopes across the dropped connections; leave notices come
    /// from here at finalization.
    scopes: HashSet<String>,
    abort: AbortHandle,
}

/// What the grace timer found when it fired.
pub struct FinalizedDisconnect {
    /// Scopes that lost their last live session for this user.
    pub leave_scopes: Vec<String>,
    /// True when no live session remains anywhere for this user.
    pub last_session_gone: bool,
}

/// Shared registry of all gateway sessions.
pub struct ConnectionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    pending: DashMap<String, PendingDisconnect>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Upsert a session. A re-identify on a known connection merges
    /// membership rather than overwriting; a reconnect under a username
    /// with a pending disconnect cancels that disconnect atomically.
    pub fn register(&self, session: Arc<Session>) -> Arc<Session> {
        self.cancel_pending(&session.normalized_username());
        match self.sessions.entry(session.connection_id.clone()) {
            Entry::Occupied(existing) => {
                let current = existing.get().clone();
                current.merge_membership(&session.group_ids(), &session.dm_id_list());
                current
            }
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                session
            }
        }
    }

    /// Cancel a pending disconnect, if any: abort its timer and drop the
    /// dead sessions silently (no leave, no offline). Returns true when
    /// something was cancelled.
    pub fn cancel_pending(&self, username: &str) -> bool {
        if let Some((_, entry)) = self.pending.remove(username) {
            entry.abort.abort();
            for connection_id in &entry.connection_ids {
                self.sessions.remove(connection_id);
            }
            tracing::debug!(%username, "pending disconnect cancelled by reconnect");
            true
        } else {
            false
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(connection_id).map(|s| s.clone())
    }

    /// All non-pending sessions for a user.
    pub fn sessions_for_user(&self, username: &str) -> Vec<Arc<Session>> {
        let wanted = normalize_username(username);
        self.sessions
            .iter()
            .filter(|entry| {
                !entry.value().is_pending() && entry.value().normalized_username() == wanted
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn has_live_session(&self, username: &str) -> bool {
        let wanted = normalize_username(username);
        self.sessions
            .iter()
            .any(|entry| !entry.value().is_pending() && entry.value().normalized_username() == wanted)
    }

    pub fn user_in_scope(&self, username: &str, scope_id: &str) -> bool {
        let wanted = normalize_username(username);
        self.sessions.iter().any(|entry| {
            let session = entry.value();
            !session.is_pending()
                && session.normalized_username() == wanted
                && session.is_member(scope_id)
        })
    }

    /// Non-pending member sessions of a scope.
    pub fn members_of(&self, scope_id: &str) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().is_pending() && entry.value().is_member(scope_id))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Distinct normalized usernames currently live in a scope.
    pub fn usernames_in_scope(&self, scope_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut usernames = Vec::new();
        for session in self.members_of(scope_id) {
            if seen.insert(session.normalized_username()) {
                usernames.push(session.username.clone());
            }
        }
        usernames
    }

    /// Flag a connection pending and record its grace entry. A second
    /// dropped connection for the same user folds into the existing entry,
    /// whose old timer is aborted, keeping the one-entry-per-user
    /// invariant. Returns false (and aborts the timer) when the connection
    /// is unknown or already pending.
    pub fn begin_pending(&self, connection_id: &str, abort: AbortHandle) -> bool {
        let Some(session) = self.get(connection_id) else {
            abort.abort();
            return false;
        };
        if session.mark_pending() {
            abort.abort();
            return false;
        }

        let username = session.normalized_username();
        let scopes: HashSet<String> = session.scopes().into_iter().collect();
        match self.pending.entry(username) {
            Entry::Occupied(mut existing) => {
                let entry = existing.get_mut();
                entry.abort.abort();
                entry.abort = abort;
                entry.at = Instant::now();
                entry.connection_ids.push(connection_id.to_string());
                entry.scopes.extend(scopes);
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingDisconnect {
                    at: Instant::now(),
                    connection_ids: vec![connection_id.to_string()],
                    scopes,
                    abort,
                });
            }
        }
        true
    }

    /// Timer body: remove the pending entry and its dead sessions, and
    /// report which scopes lost the user entirely. Returns `None` when the
    /// entry was already cancelled.
    pub fn finalize_pending(&self, username: &str) -> Option<FinalizedDisconnect> {
        let (_, entry) = self.pending.remove(username)?;
        tracing::debug!(
            %username,
            connections = entry.connection_ids.len(),
            waited_ms = entry.at.elapsed().as_millis() as u64,
            "finalizing disconnect"
        );
        for connection_id in &entry.connection_ids {
            self.sessions.remove(connection_id);
        }
        let last_session_gone = !self.has_live_session(username);
        let leave_scopes = entry
            .scopes
            .iter()
            .filter(|scope| !self.user_in_scope(username, scope))
            .cloned()
            .collect();
        Some(FinalizedDisconnect {
            leave_scopes,
            last_session_gone,
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Abort every scheduled grace timer (teardown).
    pub fn clear_pending(&self) {
        self.pending.retain(|_, entry| {
            entry.abort.abort();
            false
        });
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;

    fn make_session(connection_id: &str, username: &str, groups: &[&str]) -> Arc<Session> {
        let (session, _rx) = Session::new(
            connection_id.to_string(),
            format!("usr_{username}"),
            username.to_string(),
            None,
            None,
            groups.iter().map(|g| g.to_string()).collect(),
            HashSet::new(),
        );
        session
    }

    fn dummy_abort() -> AbortHandle {
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
        .abort_handle()
    }

    #[tokio::test]
    async fn at_most_one_pending_entry_per_username() {
        let registry = ConnectionRegistry::new();
        registry.register(make_session("c1", "alice", &["general"]));
        registry.register(make_session("c2", "alice", &["random"]));

        assert!(registry.begin_pending("c1", dummy_abort()));
        assert!(registry.begin_pending("c2", dummy_abort()));
        assert_eq!(registry.pending_count(), 1);

        // Both dropped connections finalize together, with their scopes
        // folded into one entry.
        let finalized = registry.finalize_pending("alice").unwrap();
        assert!(finalized.last_session_gone);
        let mut scopes = finalized.leave_scopes;
        scopes.sort();
        assert_eq!(scopes, vec!["general", "random"]);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn begin_pending_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.register(make_session("c1", "alice", &["general"]));

        assert!(registry.begin_pending("c1", dummy_abort()));
        assert!(!registry.begin_pending("c1", dummy_abort()));
        assert!(!registry.begin_pending("unknown", dummy_abort()));
        assert_eq!(registry.pending_count(), 1);
    }

    #[tokio::test]
    async fn reconnect_cancels_pending_and_removes_dead_session() {
        let registry = ConnectionRegistry::new();
        registry.register(make_session("c1", "alice", &["general"]));
        assert!(registry.begin_pending("c1", dummy_abort()));

        // Reconnect under the same username, new connection.
        registry.register(make_session("c2", "Alice", &["general"]));
        assert_eq!(registry.pending_count(), 0);
        assert!(registry.get("c1").is_none());
        assert!(registry.get("c2").is_some());

        // Nothing left to finalize.
        assert!(registry.finalize_pending("alice").is_none());
    }

    #[tokio::test]
    async fn finalize_skips_scopes_still_covered_by_another_session() {
        let registry = ConnectionRegistry::new();
        registry.register(make_session("c1", "alice", &["general", "random"]));
        registry.register(make_session("c2", "alice", &["general"]));

        assert!(registry.begin_pending("c1", dummy_abort()));
        let finalized = registry.finalize_pending("alice").unwrap();

        // c2 still covers "general"; only "random" lost the user.
        assert!(!finalized.last_session_gone);
        assert_eq!(finalized.leave_scopes, vec!["random"]);
    }

    #[tokio::test]
    async fn pending_sessions_stop_counting_toward_deliverability() {
        let registry = ConnectionRegistry::new();
        registry.register(make_session("c1", "alice", &["general"]));
        registry.register(make_session("c2", "bob", &["general"]));

        assert_eq!(registry.members_of("general").len(), 2);
        assert!(registry.begin_pending("c1", dummy_abort()));
        assert_eq!(registry.members_of("general").len(), 1);
        assert!(!registry.has_live_session("alice"));
        assert!(registry.sessions_for_user("alice").is_empty());
    }

    #[tokio::test]
    async fn register_merges_membership_on_reidentify() {
        let registry = ConnectionRegistry::new();
        let first = registry.register(make_session("c1", "alice", &["general"]));
        let merged = registry.register(make_session("c1", "alice", &["random"]));

        assert!(Arc::ptr_eq(&first, &merged));
        assert!(merged.in_group("general"));
        assert!(merged.in_group("random"));
        assert_eq!(registry.session_count(), 1);
    }
}
