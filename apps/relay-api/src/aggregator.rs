//! Debounces join/leave churn into single system notices.
//!
//! One bucket per (scope, kind) with one timer; later same-kind events in
//! the window add names without resetting it. The notice is broadcast
//! optimistically with a local id, persisted asynchronously, and
//! reconciled if the backend assigns a different id.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;

use banter_common::id::{prefix, prefixed_ulid};
use banter_common::model::StoredMessage;
use banter_common::scope::normalize_username;

use crate::backend::BackendGateway;
use crate::gateway::events::EventName;
use crate::gateway::fanout::GatewayBroadcast;

/// Author recorded on relay-synthesized notices.
const SYSTEM_USERNAME: &str = "system";

/// Which churn a bucket collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    Join,
    Leave,
}

impl NoticeKind {
    fn verb(self) -> &'static str {
        match self {
            Self::Join => "joined",
            Self::Leave => "left",
        }
    }
}

struct Bucket {
    /// Display-cased names in arrival order, deduplicated by normalized form.
    usernames: Vec<String>,
    abort: AbortHandle,
}

pub struct SystemMessageAggregator {
    window: Duration,
    buckets: DashMap<(String, NoticeKind), Bucket>,
    broadcast: GatewayBroadcast,
    backend: Arc<BackendGateway>,
}

impl SystemMessageAggregator {
    pub fn new(
        window: Duration,
        broadcast: GatewayBroadcast,
        backend: Arc<BackendGateway>,
    ) -> Arc<Self> {
        Arc::new(Self {
            window,
            buckets: DashMap::new(),
            broadcast,
            backend,
        })
    }

    /// Record one join/leave. The first event for a (scope, kind) opens the
    /// bucket and starts its window; the window never resets.
    pub fn record(self: &Arc<Self>, scope_id: &str, kind: NoticeKind, username: &str) {
        let key = (scope_id.to_string(), kind);
        match self.buckets.entry(key) {
            Entry::Occupied(mut bucket) => {
                let names = &mut bucket.get_mut().usernames;
                let wanted = normalize_username(username);
                if !names.iter().any(|n| normalize_username(n) == wanted) {
                    names.push(username.to_string());
                }
            }
            Entry::Vacant(slot) => {
                let aggregator = self.clone();
                let scope = scope_id.to_string();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(aggregator.window).await;
                    aggregator.fire(&scope, kind).await;
                });
                slot.insert(Bucket {
                    usernames: vec![username.to_string()],
                    abort: task.abort_handle(),
                });
            }
        }
    }

    /// Timer body: emit exactly one notice naming everyone collected, then
    /// drop the bucket so a later event opens a fresh one.
    async fn fire(&self, scope_id: &str, kind: NoticeKind) {
        let Some((_, bucket)) = self.buckets.remove(&(scope_id.to_string(), kind)) else {
            return;
        };

        let text = format!("{} {}", format_names(&bucket.usernames), kind.verb());
        let local = StoredMessage {
            id: prefixed_ulid(prefix::SYSTEM_MESSAGE),
            scope_id: scope_id.to_string(),
            user_id: None,
            username: SYSTEM_USERNAME.to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
            text: Some(text),
            media_url: None,
            audio_url: None,
            reply_to: None,
            reactions: Default::default(),
            deleted: false,
            system: true,
        };

        // Optimistic broadcast first; system messages are exempt from
        // per-viewer filters.
        let data = serde_json::to_value(&local).unwrap_or_default();
        self.broadcast
            .scope(scope_id, EventName::SYSTEM_MESSAGE, data, None);

        match self.backend.post_message(scope_id, local.clone()).await {
            Ok(stored) if stored.id != local.id => {
                self.broadcast.scope(
                    scope_id,
                    EventName::SYSTEM_RECONCILE,
                    serde_json::json!({
                        "scope_id": scope_id,
                        "local_id": local.id,
                        "id": stored.id,
                    }),
                    None,
                );
            }
            Ok(_) => {}
            Err(err) => {
                // Already broadcast; reconciled after the fact, never rolled back.
                tracing::warn!(%err, scope_id, "failed to persist system notice");
            }
        }
    }

    /// Abort every pending window (teardown).
    pub fn clear(&self) {
        self.buckets.retain(|_, bucket| {
            bucket.abort.abort();
            false
        });
    }
}

/// "A", "A and B", "A, B and C".
fn format_names(names: &[String]) -> String {
    match names {
        [] => String::new(),
        [only] => only.clone(),
        [first, second] => format!("{first} and {second}"),
        [head @ .., last] => format!("{} and {last}", head.join(", ")),
    }
}
