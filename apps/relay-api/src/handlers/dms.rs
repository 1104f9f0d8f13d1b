//! DM join: participant validation against the canonical composite id,
//! then filtered history delivery.

use serde_json::json;

use banter_common::scope::{dm_participants, validate_scope_id, ScopeKind};

use crate::error::RelayError;
use crate::gateway::events::{EventName, JoinPayload};
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
    if kind != ScopeKind::Dm {
        return Err(RelayError::invalid_scope("expected a DM id")
            .with_op("join")
            .with_scope(&scope_id));
    }

    // Either participant derives the same id; anyone else is an outsider.
    let me = session.normalized_username();
    match dm_participants(&scope_id) {
        Some((a, b)) if me == a || me == b => {}
        _ => {
            return Err(RelayError::not_participant("not part of this conversation")
                .with_op("join")
                .with_scope(&scope_id));
        }
    }

    session.add_dm(&scope_id);
    session.set_active_dm(&scope_id);

    let history = state
        .backend
        .latest_messages(&scope_id, state.config.history_count)
        .await;
    let visible = session.filter_history(&scope_id, history);
    session.send(
        EventName::DM_HISTORY,
        json!({ "dm_id": scope_id, "messages": visible }),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::backend::memory::MemoryBackend;
    use crate::config::Config;
    use crate::error::ErrorCode;
    use crate::gateway::session::OutboundEvent;

    use super::*;

    fn test_state() -> AppState {
        AppState::new(Config::default(), Arc::new(MemoryBackend::new()))
    }

    fn make_session(
        state: &AppState,
        connection_id: &str,
        username: &str,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (session, rx) = Session::new(
            connection_id.to_string(),
            format!("usr_{username}"),
            username.to_string(),
            None,
            None,
            HashSet::new(),
            HashSet::new(),
        );
        let session = state.registry.register(session);
        (session, rx)
    }

    #[tokio::test]
    async fn participant_joins_and_receives_history() {
        let state = test_state();
        let (alice, mut rx) = make_session(&state, "c1", "Alice");

        join(
            &state,
            &alice,
            JoinPayload {
                scope_id: "dm:alice|bob".to_string(),
            },
        )
        .await
        .unwrap();

        assert!(alice.is_member("dm:alice|bob"));
        let history = rx.recv().await.unwrap();
        assert_eq!(history.event_name, EventName::DM_HISTORY);
        assert_eq!(history.data["dm_id"], "dm:alice|bob");
    }

    #[tokio::test]
    async fn outsiders_and_malformed_ids_are_rejected() {
        let state = test_state();
        let (carol, _rx) = make_session(&state, "c1", "carol");

        let err = join(
            &state,
            &carol,
            JoinPayload {
                scope_id: "dm:alice|bob".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotParticipant);

        // Non-canonical composite (wrong order) fails shape validation.
        let err = join(
            &state,
            &carol,
            JoinPayload {
                scope_id: "dm:carol|alice".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidScope);

        // Group-shaped id on the DM surface.
        let err = join(
            &state,
            &carol,
            JoinPayload {
                scope_id: "general".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidScope);
    }
}
