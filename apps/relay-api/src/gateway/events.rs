//! Gateway opcodes, event names, and wire-format messages.
//!
//! Connection control is op-coded (IDENTIFY, HEARTBEAT); domain traffic
//! rides DISPATCH frames with a named event in `t` and a typed payload in
//! `d`, validated here before it reaches any handler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use banter_common::model::MessageRef;
use banter_common::scope::ScopeKind;

use crate::error::RelayError;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_HEARTBEAT_ACK: u8 = 6;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, seq: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: Some(seq),
            d: data,
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
}

/// IDENTIFY payload. The relay trusts caller-supplied identity; session
/// issuance happens upstream.
#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bubble_color: Option<String>,
    /// Durable group memberships known to the client.
    #[serde(default)]
    pub groups: Vec<String>,
    /// DM threads known to the client; supplemented from the backend when
    /// empty.
    #[serde(default)]
    pub dm_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// Dispatch event names
// ---------------------------------------------------------------------------

/// Event names dispatched to clients.
pub struct EventName;

impl EventName {
    pub const READY: &'static str = "ready";
    pub const PRESENCE_ONLINE: &'static str = "presence:online";
    pub const PRESENCE_OFFLINE: &'static str = "presence:offline";
    pub const GROUP_HISTORY: &'static str = "group:history";
    pub const GROUP_MEMBERS: &'static str = "group:members";
    pub const GROUP_MESSAGE: &'static str = "group:message";
    pub const GROUP_EDIT: &'static str = "group:edit";
    pub const GROUP_DELETE: &'static str = "group:delete";
    pub const GROUP_REACT: &'static str = "group:react";
    pub const GROUP_TYPING: &'static str = "group:typing";
    pub const GROUP_ERROR: &'static str = "group:error";
    pub const DM_HISTORY: &'static str = "dm:history";
    pub const DM_MESSAGE: &'static str = "dm:message";
    pub const DM_EDIT: &'static str = "dm:edit";
    pub const DM_DELETE: &'static str = "dm:delete";
    pub const DM_REACT: &'static str = "dm:react";
    pub const DM_TYPING: &'static str = "dm:typing";
    pub const DM_ERROR: &'static str = "dm:error";
    pub const SYSTEM_MESSAGE: &'static str = "system:message";
    pub const SYSTEM_RECONCILE: &'static str = "system:reconcile";
    pub const FILTERS_SNAPSHOT: &'static str = "filters:snapshot";
    pub const FILTERS_ERROR: &'static str = "filters:error";
    pub const LIKE_RECEIVED: &'static str = "like:received";
    pub const LIKE_REMOVED: &'static str = "like:removed";
    pub const LIKE_ERROR: &'static str = "like:error";
    pub const PROFILE_UPDATE: &'static str = "profile:update";
}

// ---------------------------------------------------------------------------
// Scope families
// ---------------------------------------------------------------------------

/// Which command surface a request came in on. The scope id must agree
/// (`dm:send` on a group id is an invalid-scope error, and vice versa).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeFamily {
    Group,
    Dm,
}

impl ScopeFamily {
    pub fn kind(self) -> ScopeKind {
        match self {
            Self::Group => ScopeKind::Group,
            Self::Dm => ScopeKind::Dm,
        }
    }

    /// JSON key the scope id travels under in this family's payloads.
    pub fn scope_key(self) -> &'static str {
        match self {
            Self::Group => "group_id",
            Self::Dm => "dm_id",
        }
    }

    pub fn error_event(self) -> &'static str {
        match self {
            Self::Group => EventName::GROUP_ERROR,
            Self::Dm => EventName::DM_ERROR,
        }
    }

    pub fn history_event(self) -> &'static str {
        match self {
            Self::Group => EventName::GROUP_HISTORY,
            Self::Dm => EventName::DM_HISTORY,
        }
    }

    pub fn message_event(self) -> &'static str {
        match self {
            Self::Group => EventName::GROUP_MESSAGE,
            Self::Dm => EventName::DM_MESSAGE,
        }
    }

    pub fn edit_event(self) -> &'static str {
        match self {
            Self::Group => EventName::GROUP_EDIT,
            Self::Dm => EventName::DM_EDIT,
        }
    }

    pub fn delete_event(self) -> &'static str {
        match self {
            Self::Group => EventName::GROUP_DELETE,
            Self::Dm => EventName::DM_DELETE,
        }
    }

    pub fn react_event(self) -> &'static str {
        match self {
            Self::Group => EventName::GROUP_REACT,
            Self::Dm => EventName::DM_REACT,
        }
    }

    pub fn typing_event(self) -> &'static str {
        match self {
            Self::Group => EventName::GROUP_TYPING,
            Self::Dm => EventName::DM_TYPING,
        }
    }
}

// ---------------------------------------------------------------------------
// Client command payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct JoinPayload {
    pub scope_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LeavePayload {
    pub scope_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendPayload {
    pub scope_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub audio_url: Option<String>,
    /// Client-generated id echoed back for optimistic reconciliation.
    #[serde(default)]
    pub local_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<MessageRef>,
}

#[derive(Debug, Deserialize)]
pub struct EditPayload {
    pub scope_id: String,
    pub target: MessageRef,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct DeletePayload {
    pub scope_id: String,
    pub target: MessageRef,
}

#[derive(Debug, Deserialize)]
pub struct ReactPayload {
    pub scope_id: String,
    pub target: MessageRef,
    pub emoji: String,
    /// Legacy clients name the reacting user explicitly; it must match the
    /// requester's identity.
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TypingPayload {
    pub scope_id: String,
    pub is_typing: bool,
    /// Caller-suggested expiry for receivers, capped server-side.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct MutePayload {
    pub scope_id: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct LikePayload {
    pub username: String,
}

// ---------------------------------------------------------------------------
// Parsed client commands
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ClientCommand {
    Join(ScopeFamily, JoinPayload),
    Leave(LeavePayload),
    Send(ScopeFamily, SendPayload),
    Edit(ScopeFamily, EditPayload),
    Delete(ScopeFamily, DeletePayload),
    React(ScopeFamily, ReactPayload),
    Typing(ScopeFamily, TypingPayload),
    FiltersRefresh,
    FiltersMute(MutePayload),
    FiltersUnmute(MutePayload),
    LikeSend(LikePayload),
    LikeRemove(LikePayload),
    ProfileBroadcast,
    Ping,
}

/// Parse a DISPATCH frame's event name and payload into a typed command.
pub fn parse_command(event: &str, data: Value) -> Result<ClientCommand, RelayError> {
    use ScopeFamily::{Dm, Group};

    fn payload<T: serde::de::DeserializeOwned>(
        event: &str,
        data: Value,
    ) -> Result<T, RelayError> {
        serde_json::from_value(data)
            .map_err(|err| RelayError::validation(format!("invalid {event} payload: {err}")))
    }

    let command = match event {
        "group:join" => ClientCommand::Join(Group, payload(event, data)?),
        "group:leave" => ClientCommand::Leave(payload(event, data)?),
        "group:send" => ClientCommand::Send(Group, payload(event, data)?),
        "group:edit" => ClientCommand::Edit(Group, payload(event, data)?),
        "group:delete" => ClientCommand::Delete(Group, payload(event, data)?),
        "group:react" => ClientCommand::React(Group, payload(event, data)?),
        "group:typing" => ClientCommand::Typing(Group, payload(event, data)?),
        "dm:join" => ClientCommand::Join(Dm, payload(event, data)?),
        "dm:send" => ClientCommand::Send(Dm, payload(event, data)?),
        "dm:edit" => ClientCommand::Edit(Dm, payload(event, data)?),
        "dm:delete" => ClientCommand::Delete(Dm, payload(event, data)?),
        "dm:react" => ClientCommand::React(Dm, payload(event, data)?),
        "dm:typing" => ClientCommand::Typing(Dm, payload(event, data)?),
        "filters:refresh" => ClientCommand::FiltersRefresh,
        "filters:mute" => ClientCommand::FiltersMute(payload(event, data)?),
        "filters:unmute" => ClientCommand::FiltersUnmute(payload(event, data)?),
        "like:send" => ClientCommand::LikeSend(payload(event, data)?),
        "like:remove" => ClientCommand::LikeRemove(payload(event, data)?),
        "profile:broadcast" => ClientCommand::ProfileBroadcast,
        "presence:ping" => ClientCommand::Ping,
        _ => {
            return Err(RelayError::validation(format!("unknown event {event:?}")));
        }
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_with_reply_ref() {
        let data = serde_json::json!({
            "scope_id": "general",
            "text": "hi",
            "local_id": "loc-1",
            "reply_to": { "username": "bob", "timestamp_ms": 42 },
        });
        let command = parse_command("group:send", data).unwrap();
        match command {
            ClientCommand::Send(ScopeFamily::Group, payload) => {
                assert_eq!(payload.scope_id, "general");
                assert_eq!(payload.local_id.as_deref(), Some("loc-1"));
                assert_eq!(
                    payload.reply_to,
                    Some(MessageRef::Legacy {
                        username: "bob".to_string(),
                        timestamp_ms: 42,
                    })
                );
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_event() {
        let err = parse_command("group:frobnicate", serde_json::json!({})).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ValidationError);
    }

    #[test]
    fn rejects_malformed_payload() {
        let err = parse_command("group:edit", serde_json::json!({"scope_id": "general"}))
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ValidationError);
    }
}
