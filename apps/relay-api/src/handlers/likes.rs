//! Relationship relay: like/unlike pass-through with profile enrichment,
//! and canonical profile fan-out.

use serde_json::json;

use banter_common::model::ProfileSummary;

use crate::error::RelayError;
use crate::gateway::events::{EventName, LikePayload};
use crate::gateway::session::Session;
use crate::AppState;

pub async fn send(
    state: &AppState,
    session: &Session,
    payload: LikePayload,
) -> Result<(), RelayError> {
    let target = payload.username.trim().to_string();
    if target.is_empty() {
        return Err(RelayError::validation("target username is required").with_op("like"));
    }

    state
        .backend
        .post_like(&session.username, &target)
        .await
        .map_err(|err| {
            RelayError::server_error(err.to_string())
                .with_op("like")
                .with_echo(json!({ "username": target }))
        })?;

    // Enrich with the liker's freshly fetched profile; degrade to the bare
    // username when the fetch fails.
    let profile = state
        .backend
        .profiles(vec![session.username.clone()])
        .await
        .into_iter()
        .next()
        .unwrap_or_else(|| ProfileSummary::bare(&session.username));

    for target_session in state.registry.sessions_for_user(&target) {
        target_session.send(
            EventName::LIKE_RECEIVED,
            json!({ "from": session.username, "profile": profile }),
        );
    }
    Ok(())
}

pub async fn remove(
    state: &AppState,
    session: &Session,
    payload: LikePayload,
) -> Result<(), RelayError> {
    let target = payload.username.trim().to_string();
    if target.is_empty() {
        return Err(RelayError::validation("target username is required").with_op("unlike"));
    }

    state
        .backend
        .delete_like(&session.username, &target)
        .await
        .map_err(|err| {
            RelayError::server_error(err.to_string())
                .with_op("unlike")
                .with_echo(json!({ "username": target }))
        })?;

    for target_session in state.registry.sessions_for_user(&target) {
        target_session.send(
            EventName::LIKE_REMOVED,
            json!({ "from": session.username }),
        );
    }
    Ok(())
}

/// Fan out a profile change. The client body is never trusted or relayed;
/// only the canonical profile re-fetched from the backend goes out, which
/// keeps stale or spoofed updates from propagating.
pub async fn profile_broadcast(state: &AppState, session: &Session) -> Result<(), RelayError> {
    match state
        .backend
        .profiles(vec![session.username.clone()])
        .await
        .into_iter()
        .next()
    {
        Some(profile) => {
            state
                .broadcast
                .global(EventName::PROFILE_UPDATE, json!({ "profile": profile }));
        }
        None => {
            tracing::warn!(
                username = %session.username,
                "canonical profile unavailable, skipping profile fan-out"
            );
        }
    }
    Ok(())
}
