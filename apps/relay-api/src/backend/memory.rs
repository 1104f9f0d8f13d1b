//! In-memory [`BackendApi`] implementation for tests and local development.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use banter_common::model::{FilterRule, ProfileSummary, StoredMessage};
use banter_common::scope::normalize_username;

use super::api::{BackendApi, BackendError, BackendResult};

#[derive(Default)]
pub struct MemoryBackend {
    messages: Mutex<HashMap<String, Vec<StoredMessage>>>,
    filters: Mutex<HashMap<String, Vec<FilterRule>>>,
    members: Mutex<HashMap<String, HashSet<String>>>,
    profiles: Mutex<HashMap<String, ProfileSummary>>,
    likes: Mutex<HashSet<(String, String)>>,
    threads: Mutex<HashMap<String, Vec<String>>>,
    next_id: AtomicU64,
    fail_writes: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write calls fail with a network error.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    pub fn insert_profile(&self, profile: ProfileSummary) {
        self.profiles
            .lock()
            .unwrap()
            .insert(normalize_username(&profile.username), profile);
    }

    pub fn insert_message(&self, message: StoredMessage) {
        self.messages
            .lock()
            .unwrap()
            .entry(message.scope_id.clone())
            .or_default()
            .push(message);
    }

    pub fn group_members(&self, group_id: &str) -> HashSet<String> {
        self.members
            .lock()
            .unwrap()
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_like(&self, from: &str, to: &str) -> bool {
        self.likes
            .lock()
            .unwrap()
            .contains(&(normalize_username(from), normalize_username(to)))
    }

    fn take_write_failure(&self) -> BackendResult<()> {
        let remaining = self.fail_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Network("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendApi for MemoryBackend {
    async fn latest_messages(
        &self,
        scope_id: &str,
        count: usize,
    ) -> BackendResult<Vec<StoredMessage>> {
        let messages = self.messages.lock().unwrap();
        let scope = messages.get(scope_id).cloned().unwrap_or_default();
        let start = scope.len().saturating_sub(count);
        Ok(scope[start..].to_vec())
    }

    async fn message_page(
        &self,
        scope_id: &str,
        before_ms: i64,
        limit: usize,
    ) -> BackendResult<Vec<StoredMessage>> {
        let messages = self.messages.lock().unwrap();
        let mut page: Vec<StoredMessage> = messages
            .get(scope_id)
            .map(|scope| {
                scope
                    .iter()
                    .filter(|m| m.timestamp_ms < before_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let start = page.len().saturating_sub(limit);
        page = page[start..].to_vec();
        Ok(page)
    }

    async fn post_message(
        &self,
        scope_id: &str,
        message: &StoredMessage,
    ) -> BackendResult<StoredMessage> {
        self.take_write_failure()?;
        let mut stored = message.clone();
        // The backend assigns the durable id; the relay's local id is a
        // placeholder.
        stored.id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        stored.scope_id = scope_id.to_string();
        self.messages
            .lock()
            .unwrap()
            .entry(scope_id.to_string())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn put_message(
        &self,
        scope_id: &str,
        message_id: &str,
        text: &str,
    ) -> BackendResult<StoredMessage> {
        self.take_write_failure()?;
        let mut messages = self.messages.lock().unwrap();
        let scope = messages
            .get_mut(scope_id)
            .ok_or(BackendError::Status(404))?;
        let msg = scope
            .iter_mut()
            .find(|m| m.id == message_id && !m.deleted)
            .ok_or(BackendError::Status(404))?;
        msg.text = Some(text.to_string());
        Ok(msg.clone())
    }

    async fn delete_message(&self, scope_id: &str, message_id: &str) -> BackendResult<()> {
        self.take_write_failure()?;
        let mut messages = self.messages.lock().unwrap();
        let scope = messages
            .get_mut(scope_id)
            .ok_or(BackendError::Status(404))?;
        let msg = scope
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(BackendError::Status(404))?;
        msg.deleted = true;
        Ok(())
    }

    async fn post_reaction(
        &self,
        scope_id: &str,
        message_id: &str,
        username: &str,
        emoji: Option<&str>,
    ) -> BackendResult<()> {
        self.take_write_failure()?;
        let mut messages = self.messages.lock().unwrap();
        let scope = messages
            .get_mut(scope_id)
            .ok_or(BackendError::Status(404))?;
        let msg = scope
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or(BackendError::Status(404))?;
        let key = normalize_username(username);
        match emoji {
            Some(e) => {
                msg.reactions.insert(key, e.to_string());
            }
            None => {
                msg.reactions.remove(&key);
            }
        }
        Ok(())
    }

    async fn message_filters(&self, user_id: &str) -> BackendResult<Vec<FilterRule>> {
        Ok(self
            .filters
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_message_filter(&self, user_id: &str, rule: &FilterRule) -> BackendResult<()> {
        self.take_write_failure()?;
        let mut filters = self.filters.lock().unwrap();
        let rules = filters.entry(user_id.to_string()).or_default();
        rules.retain(|r| {
            !(r.scope_id == rule.scope_id && r.muted_username == rule.muted_username)
        });
        rules.push(rule.clone());
        Ok(())
    }

    async fn remove_message_filter(
        &self,
        user_id: &str,
        scope_id: &str,
        muted_username: &str,
    ) -> BackendResult<()> {
        self.take_write_failure()?;
        if let Some(rules) = self.filters.lock().unwrap().get_mut(user_id) {
            rules.retain(|r| !(r.scope_id == scope_id && r.muted_username == muted_username));
        }
        Ok(())
    }

    async fn add_group_member(&self, group_id: &str, username: &str) -> BackendResult<()> {
        self.take_write_failure()?;
        self.members
            .lock()
            .unwrap()
            .entry(group_id.to_string())
            .or_default()
            .insert(normalize_username(username));
        Ok(())
    }

    async fn remove_group_member(&self, group_id: &str, username: &str) -> BackendResult<()> {
        self.take_write_failure()?;
        if let Some(members) = self.members.lock().unwrap().get_mut(group_id) {
            members.remove(&normalize_username(username));
        }
        Ok(())
    }

    async fn profiles(&self, usernames: &[String]) -> BackendResult<Vec<ProfileSummary>> {
        let profiles = self.profiles.lock().unwrap();
        Ok(usernames
            .iter()
            .filter_map(|u| profiles.get(&normalize_username(u)).cloned())
            .collect())
    }

    async fn post_like(&self, from: &str, to: &str) -> BackendResult<()> {
        self.take_write_failure()?;
        self.likes
            .lock()
            .unwrap()
            .insert((normalize_username(from), normalize_username(to)));
        Ok(())
    }

    async fn delete_like(&self, from: &str, to: &str) -> BackendResult<()> {
        self.take_write_failure()?;
        self.likes
            .lock()
            .unwrap()
            .remove(&(normalize_username(from), normalize_username(to)));
        Ok(())
    }

    async fn dm_threads(&self, username: &str) -> BackendResult<Vec<String>> {
        Ok(self
            .threads
            .lock()
            .unwrap()
            .get(&normalize_username(username))
            .cloned()
            .unwrap_or_default())
    }
}
