//! WebSocket upgrade handler and per-connection event loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time;

use banter_common::id::{prefix, prefixed_ulid};
use banter_common::scope::{validate_scope_id, ScopeKind};

use crate::aggregator::NoticeKind;
use crate::filters;
use crate::handlers;
use crate::AppState;

use super::events::{
    parse_command, ClientMessage, EventName, GatewayMessage, HeartbeatPayload, IdentifyPayload,
    OP_DISPATCH, OP_HEARTBEAT, OP_IDENTIFY,
};
use super::fanout::{Audience, BroadcastPayload};
use super::session::{OutboundEvent, Session};

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Step 1: wait for IDENTIFY within the handshake timeout.
    let identify_result = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during identify");
                    return Err("read error");
                }
            };

            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => return Err("client closed"),
                Message::Ping(_) | Message::Pong(_) => continue,
                _ => continue,
            };

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(_) => {
                    let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                    return Err("invalid json");
                }
            };

            match client_msg.op {
                OP_IDENTIFY => {
                    let payload: IdentifyPayload = serde_json::from_value(client_msg.d)
                        .map_err(|_| "invalid identify payload")?;
                    return Ok(payload);
                }
                _ => {
                    let _ =
                        send_close(&mut ws_tx, CLOSE_NOT_AUTHENTICATED, "Expected IDENTIFY").await;
                    return Err("expected identify");
                }
            }
        }
        Err("connection closed before identify")
    })
    .await;

    let payload = match identify_result {
        Ok(Ok(payload)) => payload,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "identify handshake failed");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, reason).await;
            return;
        }
        Err(_timeout) => {
            let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    let (session, outbox_rx, ready_msg) = match handle_identify(&state, payload).await {
        Ok(result) => result,
        Err(reason) => {
            tracing::debug!(%reason, "identify rejected");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, reason).await;
            return;
        }
    };

    tracing::info!(
        connection_id = %session.connection_id,
        user = %session.username,
        "gateway session established"
    );

    // Subscribe before READY goes out so nothing dispatched concurrently is
    // missed.
    let broadcast_rx = state.broadcast.subscribe();

    let ready_json = serde_json::to_string(&ready_msg).unwrap();
    if ws_tx.send(Message::Text(ready_json.into())).await.is_err() {
        handle_disconnect(&state, &session);
        return;
    }

    run_session(
        state.clone(),
        session.clone(),
        ws_tx,
        ws_rx,
        broadcast_rx,
        outbox_rx,
    )
    .await;

    handle_disconnect(&state, &session);

    tracing::info!(
        connection_id = %session.connection_id,
        user = %session.username,
        "gateway session ended"
    );
}

/// Register the session, warm its filter cache, and build READY.
///
/// The relay trusts the caller-supplied identity; malformed scope ids in
/// the declared membership are dropped at this boundary.
async fn handle_identify(
    state: &AppState,
    payload: IdentifyPayload,
) -> Result<
    (
        Arc<Session>,
        mpsc::UnboundedReceiver<OutboundEvent>,
        GatewayMessage,
    ),
    &'static str,
> {
    let user_id = payload.user_id.trim().to_string();
    let username = payload.username.trim().to_string();
    if user_id.is_empty() || username.is_empty() {
        return Err("user_id and username are required");
    }

    let groups: HashSet<String> = payload
        .groups
        .into_iter()
        .filter(|g| matches!(validate_scope_id(g), Ok(ScopeKind::Group)))
        .collect();
    let dm_ids: HashSet<String> = payload
        .dm_ids
        .into_iter()
        .filter(|d| matches!(validate_scope_id(d), Ok(ScopeKind::Dm)))
        .collect();

    let (session, outbox_rx) = Session::new(
        prefixed_ulid(prefix::CONNECTION),
        user_id,
        username,
        payload.avatar,
        payload.bubble_color,
        groups,
        dm_ids,
    );
    // Registration atomically cancels a pending disconnect for this user;
    // reconnecting inside the grace window stays publicly invisible.
    let session = state.registry.register(session);

    // Supplement DM membership from the backend when the client declared
    // none (fresh devices know nothing about existing threads).
    if session.dm_id_list().is_empty() {
        let threads: Vec<String> = state
            .backend
            .dm_threads(&session.username)
            .await
            .into_iter()
            .filter(|t| matches!(validate_scope_id(t), Ok(ScopeKind::Dm)))
            .collect();
        session.merge_membership(&[], &threads);
    }

    let filters_snapshot = filters::refresh(&state.backend, &session).await;
    handlers::mark_active(state, &session.username);

    let ready_data = json!({
        "connection_id": session.connection_id,
        "user": {
            "user_id": session.user_id,
            "username": session.username,
            "avatar": session.avatar,
            "bubble_color": session.bubble_color,
        },
        "groups": session.group_ids(),
        "dm_ids": session.dm_id_list(),
        "filters": filters_snapshot,
        "heartbeat_interval_ms": state.config.heartbeat_interval_ms,
    });
    let seq = session.next_seq();
    let ready_msg = GatewayMessage::dispatch(EventName::READY, seq, ready_data);

    Ok((session, outbox_rx, ready_msg))
}

/// Main session loop: client frames, broadcast fan-in, direct outbox,
/// heartbeat deadline.
async fn run_session(
    state: AppState,
    session: Arc<Session>,
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut ws_rx: futures_util::stream::SplitStream<WebSocket>,
    mut broadcast_rx: broadcast::Receiver<Arc<BroadcastPayload>>,
    mut outbox_rx: mpsc::UnboundedReceiver<OutboundEvent>,
) {
    // Client must heartbeat within 3x the advertised interval.
    let heartbeat_deadline =
        Duration::from_millis(state.config.heartbeat_interval_ms.saturating_mul(3));
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us a frame.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Invalid JSON").await;
                                break;
                            }
                        };

                        match client_msg.op {
                            OP_HEARTBEAT => {
                                got_heartbeat = true;
                                let payload: HeartbeatPayload =
                                    serde_json::from_value(client_msg.d).unwrap_or(HeartbeatPayload { seq: 0 });
                                let ack = GatewayMessage::heartbeat_ack(payload.seq);
                                let ack_json = serde_json::to_string(&ack).unwrap();
                                if ws_tx.send(Message::Text(ack_json.into())).await.is_err() {
                                    break;
                                }
                            }
                            OP_IDENTIFY => {
                                // Re-identify merges membership rather than
                                // overwriting; switching identities does not.
                                match serde_json::from_value::<IdentifyPayload>(client_msg.d) {
                                    Ok(p) if p.user_id == session.user_id => {
                                        session.merge_membership(&p.groups, &p.dm_ids);
                                    }
                                    _ => {
                                        let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
                                        break;
                                    }
                                }
                            }
                            OP_DISPATCH => {
                                let Some(event) = client_msg.t.as_deref() else {
                                    let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Dispatch without event").await;
                                    break;
                                };
                                match parse_command(event, client_msg.d) {
                                    Ok(command) => {
                                        // Handlers run detached: a slow backend
                                        // call never stalls heartbeats, and an
                                        // in-flight write survives disconnect.
                                        tokio::spawn(handlers::dispatch(
                                            state.clone(),
                                            session.clone(),
                                            command,
                                        ));
                                    }
                                    Err(err) => {
                                        session.send(
                                            error_event_for(event),
                                            serde_json::to_value(&err).unwrap_or_default(),
                                        );
                                    }
                                }
                            }
                            _ => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %session.connection_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Broadcast event from the fanout hub.
            result = broadcast_rx.recv() => {
                match result {
                    Ok(payload) => {
                        match &payload.audience {
                            Audience::Global => {}
                            Audience::Scope(scope_id) => {
                                if !session.is_member(scope_id) {
                                    continue;
                                }
                                // This viewer's own mute rules; system events
                                // carry no filter context and always pass.
                                if let Some(filter) = &payload.filter {
                                    if session.suppresses(scope_id, &filter.author, filter.timestamp_ms) {
                                        continue;
                                    }
                                }
                            }
                        }

                        let seq = session.next_seq();
                        let msg = GatewayMessage::dispatch(payload.event_name, seq, payload.data.clone());
                        let msg_json = serde_json::to_string(&msg).unwrap();
                        if ws_tx.send(Message::Text(msg_json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            connection_id = %session.connection_id,
                            skipped = n,
                            "gateway session lagged behind broadcast"
                        );
                        // Continue — we just drop the missed events.
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }

            // Direct event queued for this connection (history pages,
            // errors, DM peer pushes, like notifications).
            event = outbox_rx.recv() => {
                let Some(event) = event else { break };
                let seq = session.next_seq();
                let msg = GatewayMessage::dispatch(event.event_name, seq, event.data);
                let msg_json = serde_json::to_string(&msg).unwrap();
                if ws_tx.send(Message::Text(msg_json.into())).await.is_err() {
                    break;
                }
            }

            // Heartbeat timeout check.
            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        connection_id = %session.connection_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Start the disconnect grace window. Idempotent; a reconnect before the
/// timer fires cancels everything with no public leave/offline.
fn handle_disconnect(state: &AppState, session: &Arc<Session>) {
    let username = session.normalized_username();
    let grace = Duration::from_millis(state.config.disconnect_grace_ms);
    let timer_state = state.clone();
    let timer_username = username.clone();
    let task = tokio::spawn(async move {
        time::sleep(grace).await;
        finalize_disconnect(timer_state, timer_username).await;
    });
    if state
        .registry
        .begin_pending(&session.connection_id, task.abort_handle())
    {
        tracing::debug!(
            connection_id = %session.connection_id,
            user = %username,
            "disconnect pending"
        );
    }
}

/// Grace timer body: confirmed disconnect. Emits one leave notice per
/// scope plus a single global offline, only when no other live session
/// remains for the user.
async fn finalize_disconnect(state: AppState, username: String) {
    let Some(finalized) = state.registry.finalize_pending(&username) else {
        return;
    };
    if !finalized.last_session_gone {
        return;
    }

    for scope_id in &finalized.leave_scopes {
        state
            .aggregator
            .record(scope_id, NoticeKind::Leave, &username);
    }
    if state.presence.remove(&username) {
        state
            .broadcast
            .global(EventName::PRESENCE_OFFLINE, json!({ "username": username }));
    }
}

/// Pick the error surface for a frame that failed to parse.
fn error_event_for(event: &str) -> &'static str {
    if event.starts_with("dm:") {
        EventName::DM_ERROR
    } else if event.starts_with("like:") {
        EventName::LIKE_ERROR
    } else if event.starts_with("filters:") {
        EventName::FILTERS_ERROR
    } else {
        EventName::GROUP_ERROR
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
