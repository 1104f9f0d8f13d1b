//! Per-connection session state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use banter_common::scope::normalize_username;

use crate::filters::ScopeFilters;

/// Event queued for one connection. The session loop assigns the sequence
/// number when it writes the frame.
#[derive(Debug)]
pub struct OutboundEvent {
    pub event_name: &'static str,
    pub data: Value,
}

/// State for a single WebSocket connection. Exclusively owned by the
/// registry; handlers reach it through `Arc`.
pub struct Session {
    /// Unique connection identifier (`conn_` prefixed ULID).
    pub connection_id: String,
    pub user_id: String,
    /// Display-cased username as identified; map keys use the normalized form.
    pub username: String,
    pub avatar: Option<String>,
    pub bubble_color: Option<String>,
    groups: Mutex<HashSet<String>>,
    dm_ids: Mutex<HashSet<String>>,
    active_group: Mutex<Option<String>>,
    active_dm: Mutex<Option<String>>,
    /// Set the moment the socket drops; the session stops counting toward
    /// deliverability while its grace timer runs.
    pending_disconnect: AtomicBool,
    filters: Mutex<ScopeFilters>,
    filters_fetched_at: Mutex<Option<Instant>>,
    outbox: mpsc::UnboundedSender<OutboundEvent>,
    seq: AtomicU64,
}

impl Session {
    pub fn new(
        connection_id: String,
        user_id: String,
        username: String,
        avatar: Option<String>,
        bubble_color: Option<String>,
        groups: HashSet<String>,
        dm_ids: HashSet<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            connection_id,
            user_id,
            username,
            avatar,
            bubble_color,
            groups: Mutex::new(groups),
            dm_ids: Mutex::new(dm_ids),
            active_group: Mutex::new(None),
            active_dm: Mutex::new(None),
            pending_disconnect: AtomicBool::new(false),
            filters: Mutex::new(ScopeFilters::default()),
            filters_fetched_at: Mutex::new(None),
            outbox,
            seq: AtomicU64::new(0),
        });
        (session, outbox_rx)
    }

    pub fn normalized_username(&self) -> String {
        normalize_username(&self.username)
    }

    /// Get the next sequence number for a dispatch event.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Queue an event for this connection. A closed outbox (socket already
    /// gone) is not an error; late results are simply dropped here while
    /// still reaching the scope's remaining members via the broadcast hub.
    pub fn send(&self, event_name: &'static str, data: Value) {
        let _ = self.outbox.send(OutboundEvent { event_name, data });
    }

    pub fn is_member(&self, scope_id: &str) -> bool {
        self.groups.lock().contains(scope_id) || self.dm_ids.lock().contains(scope_id)
    }

    pub fn in_group(&self, group_id: &str) -> bool {
        self.groups.lock().contains(group_id)
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.groups.lock().iter().cloned().collect()
    }

    pub fn dm_id_list(&self) -> Vec<String> {
        self.dm_ids.lock().iter().cloned().collect()
    }

    /// Every scope this connection belongs to (groups and DM threads).
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.groups.lock().iter().cloned().collect();
        scopes.extend(self.dm_ids.lock().iter().cloned());
        scopes
    }

    pub fn add_group(&self, group_id: &str) {
        self.groups.lock().insert(group_id.to_string());
    }

    pub fn remove_group(&self, group_id: &str) {
        self.groups.lock().remove(group_id);
        let mut active = self.active_group.lock();
        if active.as_deref() == Some(group_id) {
            *active = None;
        }
    }

    pub fn add_dm(&self, dm_id: &str) {
        self.dm_ids.lock().insert(dm_id.to_string());
    }

    pub fn set_active_group(&self, group_id: &str) {
        *self.active_group.lock() = Some(group_id.to_string());
    }

    pub fn active_group(&self) -> Option<String> {
        self.active_group.lock().clone()
    }

    pub fn set_active_dm(&self, dm_id: &str) {
        *self.active_dm.lock() = Some(dm_id.to_string());
    }

    pub fn active_dm(&self) -> Option<String> {
        self.active_dm.lock().clone()
    }

    /// Merge membership from a re-identify rather than overwriting.
    pub fn merge_membership(&self, groups: &[String], dm_ids: &[String]) {
        self.groups.lock().extend(groups.iter().cloned());
        self.dm_ids.lock().extend(dm_ids.iter().cloned());
    }

    /// Flag the session as pending disconnect. Returns the previous value,
    /// making the disconnect path idempotent.
    pub fn mark_pending(&self) -> bool {
        self.pending_disconnect.swap(true, Ordering::SeqCst)
    }

    pub fn is_pending(&self) -> bool {
        self.pending_disconnect.load(Ordering::SeqCst)
    }

    pub fn replace_filters(&self, filters: ScopeFilters) {
        *self.filters.lock() = filters;
        *self.filters_fetched_at.lock() = Some(Instant::now());
    }

    /// Age of the cached filter set; `None` before the first re-sync.
    pub fn filters_age(&self) -> Option<std::time::Duration> {
        self.filters_fetched_at.lock().map(|at| at.elapsed())
    }

    /// This viewer's own mute check, used at broadcast delivery time.
    pub fn suppresses(&self, scope_id: &str, author: &str, timestamp_ms: Option<i64>) -> bool {
        self.filters.lock().suppresses(scope_id, author, timestamp_ms)
    }

    /// Filter a history page with this viewer's rules.
    pub fn filter_history(
        &self,
        scope_id: &str,
        messages: Vec<banter_common::model::StoredMessage>,
    ) -> Vec<banter_common::model::StoredMessage> {
        self.filters.lock().apply_to_history(scope_id, messages)
    }
}
