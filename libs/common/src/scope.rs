//! Scope-id grammar shared by the relay and its clients.
//!
//! A scope is a room identifier: either an opaque group id or a DM composite
//! id of the form `dm:{user_a}|{user_b}` with both usernames lowercased and
//! sorted, so either participant can derive the same id without coordination.

use std::fmt;

/// Prefix reserved for DM composite ids. Group ids must never start with it.
pub const DM_PREFIX: &str = "dm:";

/// Separator between the two participants inside a DM id.
const DM_SEPARATOR: char = '|';

/// The two families of scope ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Group,
    Dm,
}

/// Error returned when a scope id does not match the grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidScopeId {
    pub scope_id: String,
    pub reason: &'static str,
}

impl fmt::Display for InvalidScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid scope id {:?}: {}", self.scope_id, self.reason)
    }
}

impl std::error::Error for InvalidScopeId {}

/// Lowercases and trims a username for use as a map key or DM participant.
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

/// Builds the canonical DM scope id for a pair of users.
///
/// Both usernames are normalized and sorted, so `dm_scope_id("Bob", "alice")`
/// and `dm_scope_id("alice", "bob")` produce the same id.
pub fn dm_scope_id(user_a: &str, user_b: &str) -> String {
    let a = normalize_username(user_a);
    let b = normalize_username(user_b);
    if a <= b {
        format!("{DM_PREFIX}{a}{DM_SEPARATOR}{b}")
    } else {
        format!("{DM_PREFIX}{b}{DM_SEPARATOR}{a}")
    }
}

/// Extracts the two participants from a canonical DM scope id.
///
/// Returns `None` unless the id is exactly in canonical form: prefixed,
/// two non-empty lowercase participants, sorted, single separator.
pub fn dm_participants(scope_id: &str) -> Option<(String, String)> {
    let rest = scope_id.strip_prefix(DM_PREFIX)?;
    let mut parts = rest.split(DM_SEPARATOR);
    let a = parts.next()?;
    let b = parts.next()?;
    if parts.next().is_some() || a.is_empty() || b.is_empty() {
        return None;
    }
    if a != normalize_username(a) || b != normalize_username(b) || a > b {
        return None;
    }
    Some((a.to_string(), b.to_string()))
}

/// Validates a scope id's shape and classifies it.
///
/// Group ids are opaque but must be non-empty and must not carry the DM
/// prefix; DM ids must be fully canonical.
pub fn validate_scope_id(scope_id: &str) -> Result<ScopeKind, InvalidScopeId> {
    if scope_id.trim().is_empty() {
        return Err(InvalidScopeId {
            scope_id: scope_id.to_string(),
            reason: "scope id is empty",
        });
    }
    if scope_id.starts_with(DM_PREFIX) {
        if dm_participants(scope_id).is_none() {
            return Err(InvalidScopeId {
                scope_id: scope_id.to_string(),
                reason: "DM id is not in canonical dm:{a}|{b} form",
            });
        }
        return Ok(ScopeKind::Dm);
    }
    Ok(ScopeKind::Group)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dm_id_is_order_independent() {
        assert_eq!(dm_scope_id("alice", "bob"), "dm:alice|bob");
        assert_eq!(dm_scope_id("bob", "alice"), "dm:alice|bob");
        assert_eq!(dm_scope_id("Bob", " Alice "), "dm:alice|bob");
    }

    #[test]
    fn dm_participants_roundtrip() {
        let id = dm_scope_id("Carol", "dave");
        assert_eq!(
            dm_participants(&id),
            Some(("carol".to_string(), "dave".to_string()))
        );
    }

    #[test]
    fn dm_participants_rejects_non_canonical() {
        // Wrong order.
        assert!(dm_participants("dm:bob|alice").is_none());
        // Uppercase.
        assert!(dm_participants("dm:Alice|bob").is_none());
        // Missing or extra separators.
        assert!(dm_participants("dm:alice").is_none());
        assert!(dm_participants("dm:a|b|c").is_none());
        // Empty participant.
        assert!(dm_participants("dm:|bob").is_none());
    }

    #[test]
    fn group_ids_never_dm_prefixed() {
        assert_eq!(validate_scope_id("general"), Ok(ScopeKind::Group));
        assert_eq!(validate_scope_id("dm:alice|bob"), Ok(ScopeKind::Dm));
        assert!(validate_scope_id("dm:not-canonical").is_err());
        assert!(validate_scope_id("").is_err());
        assert!(validate_scope_id("   ").is_err());
    }

    #[test]
    fn same_user_pair_is_allowed_only_once() {
        // Self-DM canonicalizes to the same participant twice; callers reject
        // it at the participant check, the grammar itself keeps it parseable.
        let id = dm_scope_id("alice", "alice");
        assert_eq!(id, "dm:alice|alice");
        assert!(dm_participants(&id).is_some());
    }
}
