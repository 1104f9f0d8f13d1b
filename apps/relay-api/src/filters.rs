//! Per-viewer, per-scope mute rules.
//!
//! A cache re-synced from the backend on refresh, never authoritative.
//! Suppression is always per-viewer: one member muting an author never
//! affects what anyone else receives.

use std::collections::HashMap;

use banter_common::model::{FilterRule, StoredMessage};
use banter_common::scope::normalize_username;

use crate::backend::BackendGateway;
use crate::gateway::session::Session;

/// One viewer's mute rules: scope id → muted author → effective-since ms.
///
/// `None` for the effective-since of a malformed legacy rule; those
/// suppress unconditionally rather than leak.
#[derive(Debug, Clone, Default)]
pub struct ScopeFilters {
    by_scope: HashMap<String, HashMap<String, Option<i64>>>,
}

impl ScopeFilters {
    pub fn from_rules(rules: Vec<FilterRule>) -> Self {
        let mut by_scope: HashMap<String, HashMap<String, Option<i64>>> = HashMap::new();
        for rule in rules {
            by_scope
                .entry(rule.scope_id)
                .or_default()
                .insert(normalize_username(&rule.muted_username), rule.effective_since_ms);
        }
        Self { by_scope }
    }

    pub fn is_empty(&self) -> bool {
        self.by_scope.is_empty()
    }

    /// Whether this viewer hides a message by `author` in `scope_id` with
    /// the given effective timestamp. An unresolvable timestamp on either
    /// side suppresses conservatively (privacy over delivery).
    pub fn suppresses(&self, scope_id: &str, author: &str, timestamp_ms: Option<i64>) -> bool {
        let Some(scope) = self.by_scope.get(scope_id) else {
            return false;
        };
        let Some(since) = scope.get(&normalize_username(author)) else {
            return false;
        };
        match (since, timestamp_ms) {
            (Some(since), Some(ts)) => ts >= *since,
            _ => true,
        }
    }

    /// Filter a history page for this viewer before initial delivery.
    /// System messages are exempt; deleted rows never ship.
    pub fn apply_to_history(
        &self,
        scope_id: &str,
        messages: Vec<StoredMessage>,
    ) -> Vec<StoredMessage> {
        messages
            .into_iter()
            .filter(|m| {
                !m.deleted
                    && (m.system
                        || !self.suppresses(scope_id, &m.username, Some(m.timestamp_ms)))
            })
            .collect()
    }

    /// Payload for the `filters:snapshot` event.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&self.by_scope).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Re-sync a session's filter cache from the backend and return the
/// snapshot payload. Backend failure degrades to the empty rule set via
/// the gateway's read fallback.
pub async fn refresh(backend: &BackendGateway, session: &Session) -> serde_json::Value {
    let rules = backend.message_filters(&session.user_id).await;
    let filters = ScopeFilters::from_rules(rules);
    let snapshot = filters.snapshot();
    session.replace_filters(filters);
    snapshot
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn rules() -> Vec<FilterRule> {
        vec![FilterRule {
            scope_id: "general".to_string(),
            muted_username: "Troll".to_string(),
            effective_since_ms: Some(1_000),
        }]
    }

    fn msg(username: &str, ts: i64, system: bool) -> StoredMessage {
        StoredMessage {
            id: format!("msg-{username}-{ts}"),
            scope_id: "general".to_string(),
            user_id: None,
            username: username.to_string(),
            timestamp_ms: ts,
            text: Some("hi".to_string()),
            media_url: None,
            audio_url: None,
            reply_to: None,
            reactions: BTreeMap::new(),
            deleted: false,
            system,
        }
    }

    #[test]
    fn suppression_is_scoped_and_effective_from_timestamp() {
        let filters = ScopeFilters::from_rules(rules());

        // At and after the effective timestamp: hidden.
        assert!(filters.suppresses("general", "troll", Some(1_000)));
        assert!(filters.suppresses("general", "TROLL", Some(5_000)));
        // Before it: visible.
        assert!(!filters.suppresses("general", "troll", Some(999)));
        // Other authors and other scopes: visible.
        assert!(!filters.suppresses("general", "alice", Some(5_000)));
        assert!(!filters.suppresses("random", "troll", Some(5_000)));
    }

    #[test]
    fn unresolvable_timestamps_suppress_conservatively() {
        let filters = ScopeFilters::from_rules(rules());
        assert!(filters.suppresses("general", "troll", None));

        let no_since = ScopeFilters::from_rules(vec![FilterRule {
            scope_id: "general".to_string(),
            muted_username: "troll".to_string(),
            effective_since_ms: None,
        }]);
        assert!(no_since.suppresses("general", "troll", Some(0)));
    }

    #[test]
    fn history_filtering_spares_system_messages() {
        let filters = ScopeFilters::from_rules(rules());
        let mut deleted = msg("alice", 2_500, false);
        deleted.deleted = true;
        let page = vec![
            msg("troll", 500, false),   // before the mute: kept
            msg("troll", 2_000, false), // muted
            msg("alice", 2_000, false), // other author: kept
            msg("troll", 3_000, true),  // system: exempt
            deleted,                    // tombstone: dropped
        ];

        let visible = filters.apply_to_history("general", page);
        let ids: Vec<&str> = visible.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["msg-troll-500", "msg-alice-2000", "msg-troll-3000"]
        );
    }
}
