//! Group join/leave: history delivery, live membership, and the
//! first-join persistence + aggregation hook.

use serde_json::json;

use banter_common::scope::{validate_scope_id, ScopeKind};

use crate::aggregator::NoticeKind;
use crate::error::RelayError;
use crate::gateway::events::{EventName, JoinPayload, LeavePayload};
use crate::gateway::session::Session;
use crate::AppState;

pub async fn join(
    state: &AppState,
    session: &Session,
    payload: JoinPayload,
) -> Result<(), RelayError> {
    let scope_id = payload.scope_id;
    let kind = validate_scope_id(&scope_id)
        .map_err(|err| RelayError::from(err).with_op("join"))?;
    if kind != ScopeKind::Group {
        return Err(RelayError::invalid_scope("expected a group id")
            .with_op("join")
            .with_scope(&scope_id));
    }

    // First-ever join: the scope is in neither this session's declared
    // membership nor any other live session of the user.
    let first_join = !session.in_group(&scope_id)
        && !state.registry.user_in_scope(&session.username, &scope_id);

    session.add_group(&scope_id);
    session.set_active_group(&scope_id);

    let history = state
        .backend
        .latest_messages(&scope_id, state.config.history_count)
        .await;
    let visible = session.filter_history(&scope_id, history);
    session.send(
        EventName::GROUP_HISTORY,
        json!({ "group_id": scope_id, "messages": visible }),
    );
    session.send(
        EventName::GROUP_MEMBERS,
        json!({
            "group_id": scope_id,
            "members": state.registry.usernames_in_scope(&scope_id),
        }),
    );

    if first_join {
        // Membership persistence is best-effort; the notice flows regardless.
        if let Err(err) = state
            .backend
            .add_group_member(&scope_id, &session.username)
            .await
        {
            tracing::warn!(%err, group_id = %scope_id, "failed to persist group membership");
        }
        state
            .aggregator
            .record(&scope_id, NoticeKind::Join, &session.username);
    }
    Ok(())
}

pub async fn leave(
    state: &AppState,
    session: &Session,
    payload: LeavePayload,
) -> Result<(), RelayError> {
    let scope_id = payload.scope_id;
    let kind = validate_scope_id(&scope_id)
        .map_err(|err| RelayError::from(err).with_op("leave"))?;
    if kind != ScopeKind::Group {
        return Err(RelayError::invalid_scope("expected a group id")
            .with_op("leave")
            .with_scope(&scope_id));
    }
    if !session.in_group(&scope_id) {
        return Err(RelayError::not_participant("not a member of this group")
            .with_op("leave")
            .with_scope(&scope_id));
    }

    // Membership is per-user: every live session of the user drops the scope.
    for user_session in state.registry.sessions_for_user(&session.username) {
        user_session.remove_group(&scope_id);
    }
    session.remove_group(&scope_id);

    if let Err(err) = state
        .backend
        .remove_group_member(&scope_id, &session.username)
        .await
    {
        tracing::warn!(%err, group_id = %scope_id, "failed to persist group leave");
    }
    state
        .aggregator
        .record(&scope_id, NoticeKind::Leave, &session.username);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use banter_common::model::StoredMessage;

    use crate::backend::memory::MemoryBackend;
    use crate::config::Config;
    use crate::error::ErrorCode;
    use crate::gateway::session::OutboundEvent;

    use super::*;

    fn test_state() -> (AppState, Arc<MemoryBackend>) {
        let memory = Arc::new(MemoryBackend::new());
        let config = Config {
            aggregation_window_ms: 60,
            ..Config::default()
        };
        let state = AppState::new(config, memory.clone());
        (state, memory)
    }

    fn make_session(
        state: &AppState,
        connection_id: &str,
        username: &str,
        groups: &[&str],
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (session, rx) = Session::new(
            connection_id.to_string(),
            format!("usr_{username}"),
            username.to_string(),
            None,
            None,
            groups.iter().map(|g| g.to_string()).collect::<HashSet<_>>(),
            HashSet::new(),
        );
        let session = state.registry.register(session);
        (session, rx)
    }

    fn old_message(scope_id: &str, username: &str, ts: i64, text: &str) -> StoredMessage {
        StoredMessage {
            id: format!("msg-{ts}"),
            scope_id: scope_id.to_string(),
            user_id: None,
            username: username.to_string(),
            timestamp_ms: ts,
            text: Some(text.to_string()),
            media_url: None,
            audio_url: None,
            reply_to: None,
            reactions: Default::default(),
            deleted: false,
            system: false,
        }
    }

    #[tokio::test]
    async fn join_delivers_filtered_history_and_membership() {
        let (state, memory) = test_state();
        memory.insert_message(old_message("general", "bob", 1_000, "early"));
        memory.insert_message(old_message("general", "troll", 2_000, "noise"));

        let (alice, mut rx) = make_session(&state, "c1", "alice", &[]);
        alice.replace_filters(crate::filters::ScopeFilters::from_rules(vec![
            banter_common::model::FilterRule {
                scope_id: "general".to_string(),
                muted_username: "troll".to_string(),
                effective_since_ms: Some(0),
            },
        ]));

        join(
            &state,
            &alice,
            JoinPayload {
                scope_id: "general".to_string(),
            },
        )
        .await
        .unwrap();

        let history = rx.recv().await.unwrap();
        assert_eq!(history.event_name, EventName::GROUP_HISTORY);
        let messages = history.data["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["username"], "bob");

        let members = rx.recv().await.unwrap();
        assert_eq!(members.event_name, EventName::GROUP_MEMBERS);
        assert_eq!(members.data["members"], serde_json::json!(["alice"]));
    }

    #[tokio::test]
    async fn first_join_persists_membership_and_aggregates() {
        let (state, memory) = test_state();
        let mut broadcasts = state.broadcast.subscribe();
        let (alice, _rx) = make_session(&state, "c1", "alice", &[]);

        join(
            &state,
            &alice,
            JoinPayload {
                scope_id: "general".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(memory.group_members("general").contains("alice"));

        // Rejoining an already-held group is quiet.
        join(
            &state,
            &alice,
            JoinPayload {
                scope_id: "general".to_string(),
            },
        )
        .await
        .unwrap();

        let notice = timeout(Duration::from_secs(1), broadcasts.recv())
            .await
            .expect("aggregated notice")
            .expect("broadcast open");
        assert_eq!(notice.event_name, EventName::SYSTEM_MESSAGE);
        assert_eq!(notice.data["text"], "alice joined");
    }

    #[tokio::test]
    async fn declared_membership_never_renotifies() {
        let (state, memory) = test_state();
        let mut broadcasts = state.broadcast.subscribe();
        let (alice, _rx) = make_session(&state, "c1", "alice", &["general"]);

        join(
            &state,
            &alice,
            JoinPayload {
                scope_id: "general".to_string(),
            },
        )
        .await
        .unwrap();

        assert!(!memory.group_members("general").contains("alice"));
        assert!(timeout(Duration::from_millis(150), broadcasts.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn join_rejects_dm_shaped_ids() {
        let (state, _memory) = test_state();
        let (alice, _rx) = make_session(&state, "c1", "alice", &[]);

        let err = join(
            &state,
            &alice,
            JoinPayload {
                scope_id: "dm:alice|bob".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidScope);

        let err = join(
            &state,
            &alice,
            JoinPayload {
                scope_id: "".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidScope);
    }

    #[tokio::test]
    async fn leave_drops_membership_everywhere_and_aggregates() {
        let (state, memory) = test_state();
        let mut broadcasts = state.broadcast.subscribe();
        let (alice_desktop, _rx1) = make_session(&state, "c1", "alice", &["general"]);
        let (alice_phone, _rx2) = make_session(&state, "c2", "alice", &["general"]);

        leave(
            &state,
            &alice_desktop,
            LeavePayload {
                scope_id: "general".to_string(),
            },
        )
        .await
        .unwrap();

        assert!(!alice_desktop.in_group("general"));
        assert!(!alice_phone.in_group("general"));
        assert!(!memory.group_members("general").contains("alice"));

        let notice = timeout(Duration::from_secs(1), broadcasts.recv())
            .await
            .expect("leave notice")
            .expect("broadcast open");
        assert_eq!(notice.data["text"], "alice left");
    }
}
