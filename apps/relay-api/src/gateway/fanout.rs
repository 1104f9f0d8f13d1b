//! Broadcast hub for dispatching gateway events to connected sessions.
//!
//! One `tokio::sync::broadcast` channel; each session subscribes and
//! filters locally by scope membership and by its own mute rules. Direct
//! per-connection delivery (history pages, errors, DM peer pushes) goes
//! through session outboxes instead.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel. Slow receivers that fall behind will
/// skip messages (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 4096;

/// Who an event is for.
#[derive(Debug, Clone)]
pub enum Audience {
    /// Members of one scope.
    Scope(String),
    /// Every connected session (presence, profile fan-outs).
    Global,
}

/// Author context a receiving session needs for its own mute check.
/// Absent on system and presence events, which are exempt.
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub author: String,
    pub timestamp_ms: Option<i64>,
}

/// A payload broadcast to all connected gateway sessions.
#[derive(Debug, Clone)]
pub struct BroadcastPayload {
    pub audience: Audience,
    pub event_name: &'static str,
    pub data: Value,
    pub filter: Option<FilterContext>,
}

/// The global broadcast hub. Cloneable — store in AppState.
#[derive(Clone)]
pub struct GatewayBroadcast {
    sender: broadcast::Sender<Arc<BroadcastPayload>>,
}

impl GatewayBroadcast {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    /// Subscribe to the broadcast channel. Each gateway session should call
    /// this once to get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.sender.subscribe()
    }

    /// Dispatch an event to a scope's members, carrying the author context
    /// each receiver needs for its own mute check.
    pub fn scope(
        &self,
        scope_id: &str,
        event_name: &'static str,
        data: Value,
        filter: Option<FilterContext>,
    ) {
        self.dispatch(BroadcastPayload {
            audience: Audience::Scope(scope_id.to_string()),
            event_name,
            data,
            filter,
        });
    }

    /// Dispatch an event to every connected session.
    pub fn global(&self, event_name: &'static str, data: Value) {
        self.dispatch(BroadcastPayload {
            audience: Audience::Global,
            event_name,
            data,
            filter: None,
        });
    }

    pub fn dispatch(&self, payload: BroadcastPayload) {
        // send() returns Err if there are no receivers — that's fine.
        let _ = self.sender.send(Arc::new(payload));
    }
}

impl Default for GatewayBroadcast {
    fn default() -> Self {
        Self::new()
    }
}
