//! Command dispatch: one parsed client command in, events out.

pub mod dms;
pub mod groups;
pub mod likes;
pub mod messages;
pub mod typing;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use banter_common::model::FilterRule;
use banter_common::scope::{normalize_username, validate_scope_id};

use crate::error::RelayError;
use crate::filters;
use crate::gateway::events::{ClientCommand, EventName, MutePayload, ScopeFamily};
use crate::gateway::session::Session;
use crate::AppState;

/// Record activity; announce "online" exactly on the absent→present edge.
pub fn mark_active(state: &AppState, username: &str) {
    if state.presence.mark_active(username) {
        state.broadcast.global(
            EventName::PRESENCE_ONLINE,
            json!({ "username": normalize_username(username) }),
        );
    }
}

/// Run one parsed command to completion. Failures become named, scoped
/// error events on the requesting connection; no command failure is fatal
/// to the connection, let alone the process.
pub async fn dispatch(state: AppState, session: Arc<Session>, command: ClientCommand) {
    let (error_event, result) = match command {
        ClientCommand::Join(family, payload) => (
            family.error_event(),
            match family {
                ScopeFamily::Group => groups::join(&state, &session, payload).await,
                ScopeFamily::Dm => dms::join(&state, &session, payload).await,
            },
        ),
        ClientCommand::Leave(payload) => (
            EventName::GROUP_ERROR,
            groups::leave(&state, &session, payload).await,
        ),
        ClientCommand::Send(family, payload) => (
            family.error_event(),
            messages::send(&state, &session, family, payload).await,
        ),
        ClientCommand::Edit(family, payload) => (
            family.error_event(),
            messages::edit(&state, &session, family, payload).await,
        ),
        ClientCommand::Delete(family, payload) => (
            family.error_event(),
            messages::delete(&state, &session, family, payload).await,
        ),
        ClientCommand::React(family, payload) => (
            family.error_event(),
            messages::react(&state, &session, family, payload).await,
        ),
        ClientCommand::Typing(family, payload) => (
            family.error_event(),
            messages::typing(&state, &session, family, payload).await,
        ),
        ClientCommand::FiltersRefresh => (
            EventName::FILTERS_ERROR,
            refresh_filters(&state, &session).await,
        ),
        ClientCommand::FiltersMute(payload) => (
            EventName::FILTERS_ERROR,
            set_filter(&state, &session, payload, true).await,
        ),
        ClientCommand::FiltersUnmute(payload) => (
            EventName::FILTERS_ERROR,
            set_filter(&state, &session, payload, false).await,
        ),
        ClientCommand::LikeSend(payload) => (
            EventName::LIKE_ERROR,
            likes::send(&state, &session, payload).await,
        ),
        ClientCommand::LikeRemove(payload) => (
            EventName::LIKE_ERROR,
            likes::remove(&state, &session, payload).await,
        ),
        ClientCommand::ProfileBroadcast => (
            EventName::LIKE_ERROR,
            likes::profile_broadcast(&state, &session).await,
        ),
        ClientCommand::Ping => {
            mark_active(&state, &session.username);
            return;
        }
    };

    if let Err(err) = result {
        tracing::debug!(
            code = ?err.code,
            connection_id = %session.connection_id,
            "command rejected"
        );
        let data = serde_json::to_value(&err).unwrap_or_default();
        session.send(error_event, data);
    }
}

async fn refresh_filters(state: &AppState, session: &Session) -> Result<(), RelayError> {
    let snapshot = filters::refresh(&state.backend, session).await;
    session.send(EventName::FILTERS_SNAPSHOT, snapshot);
    Ok(())
}

/// Persist a mute/unmute, then re-sync the cache from the backend; the
/// cache is never authoritative.
async fn set_filter(
    state: &AppState,
    session: &Session,
    payload: MutePayload,
    mute: bool,
) -> Result<(), RelayError> {
    let op = if mute { "mute" } else { "unmute" };
    validate_scope_id(&payload.scope_id).map_err(|err| RelayError::from(err).with_op(op))?;
    let muted = normalize_username(&payload.username);
    if muted.is_empty() {
        return Err(RelayError::validation("username is required").with_op(op));
    }

    let result = if mute {
        state
            .backend
            .add_message_filter(
                &session.user_id,
                FilterRule {
                    scope_id: payload.scope_id.clone(),
                    muted_username: muted,
                    effective_since_ms: Some(Utc::now().timestamp_millis()),
                },
            )
            .await
    } else {
        state
            .backend
            .remove_message_filter(&session.user_id, &payload.scope_id, &muted)
            .await
    };
    result.map_err(|err| {
        RelayError::server_error(err.to_string())
            .with_op(op)
            .with_scope(&payload.scope_id)
    })?;

    refresh_filters(state, session).await
}
