//! Message lifecycle shared by the group and DM surfaces: send, edit,
//! delete, react, typing.
//!
//! Targets resolve from the scope's recency window with one widening
//! retry; mutations authorize against the stored owner; relays preserve
//! the addressing shape of the request so client-side reconciliation
//! stays symmetric.

use chrono::Utc;
use serde_json::{json, Value};

use banter_common::id::{prefix, prefixed_ulid};
use banter_common::model::{MessageRef, ReplySummary, StoredMessage};
use banter_common::scope::{dm_participants, normalize_username, validate_scope_id};

use crate::error::RelayError;
use crate::gateway::events::{
    DeletePayload, EditPayload, ReactPayload, ScopeFamily, SendPayload, TypingPayload,
};
use crate::gateway::fanout::FilterContext;
use crate::gateway::session::Session;
use crate::AppState;

/// Default typing expiry when the caller suggests none.
const DEFAULT_TYPING_TTL_MS: u64 = 5_000;

/// Validate the scope id against the command surface and the requester's
/// standing in it.
pub fn ensure_participant(
    session: &Session,
    family: ScopeFamily,
    scope_id: &str,
) -> Result<(), RelayError> {
    let kind = validate_scope_id(scope_id)?;
    if kind != family.kind() {
        let expected = match family {
            ScopeFamily::Group => "a group id",
            ScopeFamily::Dm => "a DM id",
        };
        return Err(
            RelayError::invalid_scope(format!("expected {expected}")).with_scope(scope_id)
        );
    }
    match family {
        ScopeFamily::Group => {
            if !session.in_group(scope_id) {
                return Err(RelayError::not_participant("join the group first")
                    .with_scope(scope_id));
            }
        }
        ScopeFamily::Dm => {
            let me = session.normalized_username();
            match dm_participants(scope_id) {
                Some((a, b)) if me == a || me == b => {}
                _ => {
                    return Err(RelayError::not_participant(
                        "not part of this conversation",
                    )
                    .with_scope(scope_id));
                }
            }
        }
    }
    Ok(())
}

/// Resolve a target message from the scope's cached recency window,
/// widening the lookup once before giving up.
pub async fn resolve_target(
    state: &AppState,
    scope_id: &str,
    target: &MessageRef,
) -> Option<StoredMessage> {
    let recent = state
        .backend
        .latest_messages(scope_id, state.config.history_count)
        .await;
    if let Some(found) = recent.iter().rev().find(|m| target.matches(m)) {
        return Some(found.clone());
    }
    let widened = state
        .backend
        .latest_messages(scope_id, state.config.widened_history_count)
        .await;
    widened.iter().rev().find(|m| target.matches(m)).cloned()
}

/// Merge the scope key and any extras into a message's JSON form.
fn message_data(family: ScopeFamily, scope_id: &str, stored: &StoredMessage) -> Value {
    let mut data = serde_json::to_value(stored).unwrap_or_default();
    if let Value::Object(map) = &mut data {
        map.insert(family.scope_key().to_string(), json!(scope_id));
    }
    data
}

pub async fn send(
    state: &AppState,
    session: &Session,
    family: ScopeFamily,
    payload: SendPayload,
) -> Result<(), RelayError> {
    let scope_id = payload.scope_id.clone();
    let echo = json!({ "scope_id": scope_id, "local_id": payload.local_id });
    let decorate =
        |err: RelayError| err.with_op("send").with_scope(&scope_id).with_echo(echo.clone());

    ensure_participant(session, family, &scope_id).map_err(decorate)?;

    let text = payload
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from);
    if text.is_none() && payload.media_url.is_none() && payload.audio_url.is_none() {
        return Err(decorate(RelayError::validation(
            "a message needs text, media, or audio",
        )));
    }

    // Resolve the optional reply; an unresolvable reference is dropped and
    // the send proceeds.
    let reply_to = match &payload.reply_to {
        Some(reference) => {
            let resolved = resolve_target(state, &scope_id, reference).await;
            if resolved.is_none() {
                tracing::debug!(%scope_id, "reply target not found, dropping reference");
            }
            resolved
                .filter(|m| !m.deleted)
                .map(|m| ReplySummary::from_message(&m))
        }
        None => None,
    };

    let message = StoredMessage {
        id: prefixed_ulid(prefix::MESSAGE),
        scope_id: scope_id.clone(),
        user_id: Some(session.user_id.clone()),
        username: session.username.clone(),
        timestamp_ms: Utc::now().timestamp_millis(),
        text,
        media_url: payload.media_url.clone(),
        audio_url: payload.audio_url.clone(),
        reply_to,
        reactions: Default::default(),
        deleted: false,
        system: false,
    };

    let stored = state
        .backend
        .post_message(&scope_id, message)
        .await
        .map_err(|err| decorate(RelayError::server_error(err.to_string())))?;

    let mut data = message_data(family, &scope_id, &stored);
    if let (Value::Object(map), Some(local_id)) = (&mut data, &payload.local_id) {
        map.insert("local_id".to_string(), json!(local_id));
    }

    let filter = FilterContext {
        author: stored.username.clone(),
        timestamp_ms: Some(stored.timestamp_ms),
    };
    state
        .broadcast
        .scope(&scope_id, family.message_event(), data.clone(), Some(filter));

    // A DM also reaches the peer's other live sessions directly; the peer
    // may not have joined the thread client-side yet.
    if family == ScopeFamily::Dm {
        if let Some((a, b)) = dm_participants(&scope_id) {
            let me = session.normalized_username();
            let peer = if me == a { b } else { a };
            for peer_session in state.registry.sessions_for_user(&peer) {
                if peer_session.is_member(&scope_id) {
                    continue; // Covered by the scope broadcast.
                }
                if peer_session.suppresses(
                    &scope_id,
                    &stored.username,
                    Some(stored.timestamp_ms),
                ) {
                    continue;
                }
                peer_session.send(family.message_event(), data.clone());
            }
        }
    }
    Ok(())
}

pub async fn edit(
    state: &AppState,
    session: &Session,
    family: ScopeFamily,
    payload: EditPayload,
) -> Result<(), RelayError> {
    let scope_id = payload.scope_id.clone();
    let echo = json!({ "scope_id": scope_id, "target": payload.target });
    let decorate =
        |err: RelayError| err.with_op("edit").with_scope(&scope_id).with_echo(echo.clone());

    ensure_participant(session, family, &scope_id).map_err(decorate)?;

    let new_text = payload.text.trim();
    if new_text.is_empty() {
        return Err(decorate(RelayError::validation("new text must not be empty")));
    }

    let target = resolve_target(state, &scope_id, &payload.target)
        .await
        .filter(|m| !m.deleted)
        .ok_or_else(|| decorate(RelayError::not_found("message not found")))?;
    if !target.owned_by(&session.user_id, &session.username) {
        return Err(decorate(RelayError::not_allowed(
            "only the author can edit a message",
        )));
    }

    let stored = state
        .backend
        .put_message(&scope_id, &target.id, new_text)
        .await
        .map_err(|err| decorate(RelayError::server_error(err.to_string())))?;

    // Relay addressed the way the request was, id or legacy alike.
    let data = json!({
        (family.scope_key()): scope_id,
        "target": payload.target,
        "text": stored.text,
    });
    let filter = FilterContext {
        author: target.username.clone(),
        timestamp_ms: Some(target.timestamp_ms),
    };
    state
        .broadcast
        .scope(&scope_id, family.edit_event(), data, Some(filter));
    Ok(())
}

pub async fn delete(
    state: &AppState,
    session: &Session,
    family: ScopeFamily,
    payload: DeletePayload,
) -> Result<(), RelayError> {
    let scope_id = payload.scope_id.clone();
    let echo = json!({ "scope_id": scope_id, "target": payload.target });
    let decorate = |err: RelayError| {
        err.with_op("delete").with_scope(&scope_id).with_echo(echo.clone())
    };

    ensure_participant(session, family, &scope_id).map_err(decorate)?;

    let target = resolve_target(state, &scope_id, &payload.target)
        .await
        .filter(|m| !m.deleted)
        .ok_or_else(|| decorate(RelayError::not_found("message not found")))?;
    if !target.owned_by(&session.user_id, &session.username) {
        return Err(decorate(RelayError::not_allowed(
            "only the author can delete a message",
        )));
    }

    state
        .backend
        .delete_message(&scope_id, &target.id)
        .await
        .map_err(|err| decorate(RelayError::server_error(err.to_string())))?;

    let data = json!({
        (family.scope_key()): scope_id,
        "target": payload.target,
    });
    let filter = FilterContext {
        author: target.username.clone(),
        timestamp_ms: Some(target.timestamp_ms),
    };
    state
        .broadcast
        .scope(&scope_id, family.delete_event(), data, Some(filter));
    Ok(())
}

pub async fn react(
    state: &AppState,
    session: &Session,
    family: ScopeFamily,
    payload: ReactPayload,
) -> Result<(), RelayError> {
    let scope_id = payload.scope_id.clone();
    let echo = json!({ "scope_id": scope_id, "target": payload.target });
    let decorate =
        |err: RelayError| err.with_op("react").with_scope(&scope_id).with_echo(echo.clone());

    ensure_participant(session, family, &scope_id).map_err(decorate)?;

    // Legacy clients name the reacting user; it must be the requester.
    if let Some(claimed) = &payload.username {
        if normalize_username(claimed) != session.normalized_username() {
            return Err(decorate(RelayError::not_allowed(
                "a reaction can only be toggled by its owner",
            )));
        }
    }

    // Reacting to a deleted message is disallowed.
    let target = resolve_target(state, &scope_id, &payload.target)
        .await
        .filter(|m| !m.deleted)
        .ok_or_else(|| decorate(RelayError::not_found("message not found")))?;

    // One reaction per user: same emoji clears, a different one replaces.
    let me = session.normalized_username();
    let mut reactions = target.reactions.clone();
    let next = match reactions.get(&me) {
        Some(current) if *current == payload.emoji => {
            reactions.remove(&me);
            None
        }
        _ => {
            reactions.insert(me.clone(), payload.emoji.clone());
            Some(payload.emoji.clone())
        }
    };

    state
        .backend
        .post_reaction(&scope_id, &target.id, &session.username, next.as_deref())
        .await
        .map_err(|err| decorate(RelayError::server_error(err.to_string())))?;

    // Relay the full resulting map, not a delta.
    let data = json!({
        (family.scope_key()): scope_id,
        "target": payload.target,
        "reactions": reactions,
    });
    let filter = FilterContext {
        author: target.username.clone(),
        timestamp_ms: Some(target.timestamp_ms),
    };
    state
        .broadcast
        .scope(&scope_id, family.react_event(), data, Some(filter));
    Ok(())
}

pub async fn typing(
    state: &AppState,
    session: &Session,
    family: ScopeFamily,
    payload: TypingPayload,
) -> Result<(), RelayError> {
    let scope_id = payload.scope_id.clone();
    ensure_participant(session, family, &scope_id)
        .map_err(|err| err.with_op("typing").with_scope(&scope_id))?;

    // "Started" is rate-limited per (scope, user); a suppressed relay is
    // dropped, not an error. "Stopped" always goes through.
    if payload.is_typing && !state.typing.allow_started(&scope_id, &session.username) {
        return Ok(());
    }

    let ttl_ms = payload
        .ttl_ms
        .unwrap_or(DEFAULT_TYPING_TTL_MS)
        .min(state.config.typing_ttl_cap_ms);
    let data = json!({
        (family.scope_key()): scope_id,
        "username": session.username,
        "is_typing": payload.is_typing,
        "ttl_ms": ttl_ms,
    });
    let filter = FilterContext {
        author: session.username.clone(),
        timestamp_ms: Some(Utc::now().timestamp_millis()),
    };
    state
        .broadcast
        .scope(&scope_id, family.typing_event(), data, Some(filter));
    Ok(())
}
