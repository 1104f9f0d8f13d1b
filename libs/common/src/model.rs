//! Wire models shared by the relay and its persistence backend client.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::scope::normalize_username;

/// A message as the relay sees it. The backend owns durable storage; the
/// relay only inspects, relays, and patches these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub scope_id: String,
    /// Durable author id; legacy rows predate user ids and only carry a name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub username: String,
    /// Unix milliseconds; doubles as the legacy addressing component.
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySummary>,
    /// One reaction per reacting user, keyed by normalized username.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, String>,
    #[serde(default)]
    pub deleted: bool,
    /// Relay-synthesized notices (join/leave aggregates). Never filtered.
    #[serde(default)]
    pub system: bool,
}

impl StoredMessage {
    /// Ownership check for edit/delete/react authorization: the durable
    /// user id wins when the row has one, otherwise the legacy username.
    pub fn owned_by(&self, user_id: &str, username: &str) -> bool {
        match &self.user_id {
            Some(owner) => owner == user_id,
            None => normalize_username(&self.username) == normalize_username(username),
        }
    }

    /// True when the message carries something deliverable.
    pub fn has_content(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
            || self.media_url.is_some()
            || self.audio_url.is_some()
    }
}

/// How clients address a message: by durable id, or by the legacy
/// (username, timestamp) composite for rows that predate durable ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageRef {
    Id { id: String },
    Legacy { username: String, timestamp_ms: i64 },
}

impl MessageRef {
    pub fn matches(&self, msg: &StoredMessage) -> bool {
        match self {
            MessageRef::Id { id } => msg.id == *id,
            MessageRef::Legacy {
                username,
                timestamp_ms,
            } => {
                msg.timestamp_ms == *timestamp_ms
                    && normalize_username(&msg.username) == normalize_username(username)
            }
        }
    }
}

/// Condensed view of a replied-to message carried inside the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub username: String,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ReplySummary {
    pub fn from_message(msg: &StoredMessage) -> Self {
        Self {
            id: Some(msg.id.clone()),
            username: msg.username.clone(),
            timestamp_ms: msg.timestamp_ms,
            text: msg.text.clone(),
        }
    }
}

/// Profile summary attached to like notifications and profile fan-outs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bubble_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tagline: Option<String>,
}

impl ProfileSummary {
    /// Degraded summary used when the profile fetch fails.
    pub fn bare(username: &str) -> Self {
        Self {
            username: username.to_string(),
            display_name: None,
            avatar: None,
            bubble_color: None,
            tagline: None,
        }
    }
}

/// One mute rule as stored by the backend: hide `muted_username`'s messages
/// in `scope_id` from `effective_since_ms` onward, for the owning viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub scope_id: String,
    pub muted_username: String,
    /// Missing on malformed legacy rows; the relay then suppresses
    /// unconditionally rather than leak.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_since_ms: Option<i64>,
}
