//! Read-with-fallback and breaker-guarded write orchestration.
//!
//! Composes the raw [`BackendApi`] with the [`CircuitBreaker`], the
//! [`RetryPolicy`], and the per-class stats windows. Reads never surface
//! errors to callers; writes surface them after the breaker has had its
//! say. A degraded backend degrades the relay gracefully instead of
//! cascading into connection-handling stalls.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use banter_common::model::{FilterRule, ProfileSummary, StoredMessage};

use crate::config::Config;

use super::api::{BackendApi, BackendError, BackendResult};
use super::breaker::{BreakerDecision, CircuitBreaker};
use super::retry::RetryPolicy;
use super::stats::{BackendStats, CallStats};

pub struct BackendGateway {
    api: Arc<dyn BackendApi>,
    breaker: CircuitBreaker,
    read_retry: RetryPolicy,
    write_retry: RetryPolicy,
    stats: Arc<BackendStats>,
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

impl BackendGateway {
    pub fn new(api: Arc<dyn BackendApi>, config: &Config) -> Self {
        Self {
            api,
            breaker: CircuitBreaker::new(
                config.breaker_threshold,
                Duration::from_millis(config.breaker_cooldown_ms),
            ),
            read_retry: RetryPolicy::reads(),
            write_retry: RetryPolicy::writes(),
            stats: Arc::new(BackendStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<BackendStats> {
        self.stats.clone()
    }

    pub fn breaker_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// Run a read with retries; on exhaustion return `fallback`.
    async fn read<T, F, Fut>(
        &self,
        what: &'static str,
        stats: Option<&CallStats>,
        fallback: T,
        call: F,
    ) -> T
    where
        F: Fn() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            match call().await {
                Ok(value) => {
                    if let Some(stats) = stats {
                        stats.record(elapsed_ms(started), true);
                    }
                    return value;
                }
                Err(err) if err.is_retriable_read() && attempt < self.read_retry.max_attempts => {
                    if let Some(stats) = stats {
                        stats.record(elapsed_ms(started), false);
                    }
                    tracing::debug!(%err, what, attempt, "backend read failed, retrying");
                    sleep(self.read_retry.backoff(attempt)).await;
                }
                Err(err) => {
                    if let Some(stats) = stats {
                        stats.record(elapsed_ms(started), false);
                    }
                    tracing::warn!(%err, what, "backend read failed, serving fallback");
                    return fallback;
                }
            }
        }
    }

    /// Run a write behind the breaker. Only network errors, timeouts, and
    /// 5xx retry and count toward the breaker; 4xx are terminal.
    async fn write<T, F, Fut>(
        &self,
        what: &'static str,
        stats: Option<&CallStats>,
        call: F,
    ) -> BackendResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        if self.breaker.check() == BreakerDecision::ShortCircuit {
            if let Some(stats) = stats {
                stats.record(0, false);
            }
            tracing::debug!(what, "write short-circuited, breaker open");
            return Err(BackendError::CircuitOpen);
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            match call().await {
                Ok(value) => {
                    self.breaker.record_success();
                    if let Some(stats) = stats {
                        stats.record(elapsed_ms(started), true);
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retriable_write() && attempt < self.write_retry.max_attempts => {
                    if let Some(stats) = stats {
                        stats.record(elapsed_ms(started), false);
                    }
                    tracing::debug!(%err, what, attempt, "backend write failed, retrying");
                    sleep(self.write_retry.backoff(attempt)).await;
                }
                Err(err) => {
                    if let Some(stats) = stats {
                        stats.record(elapsed_ms(started), false);
                    }
                    // One count per exhausted call, not per attempt.
                    if err.is_retriable_write() {
                        self.breaker.record_failure();
                    }
                    tracing::warn!(%err, what, "backend write failed");
                    return Err(err);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Reads (never fail; explicit fallback per call site)
    // -----------------------------------------------------------------

    pub async fn latest_messages(&self, scope_id: &str, count: usize) -> Vec<StoredMessage> {
        let api = self.api.clone();
        let scope = scope_id.to_string();
        self.read("latest_messages", None, Vec::new(), move || {
            let api = api.clone();
            let scope = scope.clone();
            async move { api.latest_messages(&scope, count).await }
        })
        .await
    }

    pub async fn message_page(
        &self,
        scope_id: &str,
        before_ms: i64,
        limit: usize,
    ) -> Vec<StoredMessage> {
        let api = self.api.clone();
        let scope = scope_id.to_string();
        self.read("message_page", None, Vec::new(), move || {
            let api = api.clone();
            let scope = scope.clone();
            async move { api.message_page(&scope, before_ms, limit).await }
        })
        .await
    }

    pub async fn message_filters(&self, user_id: &str) -> Vec<FilterRule> {
        let api = self.api.clone();
        let user_id = user_id.to_string();
        self.read("message_filters", None, Vec::new(), move || {
            let api = api.clone();
            let user_id = user_id.clone();
            async move { api.message_filters(&user_id).await }
        })
        .await
    }

    pub async fn profiles(&self, usernames: Vec<String>) -> Vec<ProfileSummary> {
        let api = self.api.clone();
        self.read(
            "profiles",
            Some(&self.stats.reads),
            Vec::new(),
            move || {
                let api = api.clone();
                let usernames = usernames.clone();
                async move { api.profiles(&usernames).await }
            },
        )
        .await
    }

    pub async fn dm_threads(&self, username: &str) -> Vec<String> {
        let api = self.api.clone();
        let username = username.to_string();
        self.read("dm_threads", None, Vec::new(), move || {
            let api = api.clone();
            let username = username.clone();
            async move { api.dm_threads(&username).await }
        })
        .await
    }

    // -----------------------------------------------------------------
    // Writes (breaker-guarded; errors surface to the handler)
    // -----------------------------------------------------------------

    pub async fn post_message(
        &self,
        scope_id: &str,
        message: StoredMessage,
    ) -> BackendResult<StoredMessage> {
        let api = self.api.clone();
        let scope = scope_id.to_string();
        self.write("post_message", Some(&self.stats.writes), move || {
            let api = api.clone();
            let scope = scope.clone();
            let message = message.clone();
            async move { api.post_message(&scope, &message).await }
        })
        .await
    }

    pub async fn put_message(
        &self,
        scope_id: &str,
        message_id: &str,
        text: &str,
    ) -> BackendResult<StoredMessage> {
        let api = self.api.clone();
        let scope = scope_id.to_string();
        let message_id = message_id.to_string();
        let text = text.to_string();
        self.write("put_message", Some(&self.stats.writes), move || {
            let api = api.clone();
            let scope = scope.clone();
            let message_id = message_id.clone();
            let text = text.clone();
            async move { api.put_message(&scope, &message_id, &text).await }
        })
        .await
    }

    pub async fn delete_message(&self, scope_id: &str, message_id: &str) -> BackendResult<()> {
        let api = self.api.clone();
        let scope = scope_id.to_string();
        let message_id = message_id.to_string();
        self.write("delete_message", Some(&self.stats.writes), move || {
            let api = api.clone();
            let scope = scope.clone();
            let message_id = message_id.clone();
            async move { api.delete_message(&scope, &message_id).await }
        })
        .await
    }

    pub async fn post_reaction(
        &self,
        scope_id: &str,
        message_id: &str,
        username: &str,
        emoji: Option<&str>,
    ) -> BackendResult<()> {
        let api = self.api.clone();
        let scope = scope_id.to_string();
        let message_id = message_id.to_string();
        let username = username.to_string();
        let emoji = emoji.map(|e| e.to_string());
        self.write("post_reaction", Some(&self.stats.writes), move || {
            let api = api.clone();
            let scope = scope.clone();
            let message_id = message_id.clone();
            let username = username.clone();
            let emoji = emoji.clone();
            async move {
                api.post_reaction(&scope, &message_id, &username, emoji.as_deref())
                    .await
            }
        })
        .await
    }

    pub async fn add_message_filter(&self, user_id: &str, rule: FilterRule) -> BackendResult<()> {
        let api = self.api.clone();
        let user_id = user_id.to_string();
        self.write("add_message_filter", None, move || {
            let api = api.clone();
            let user_id = user_id.clone();
            let rule = rule.clone();
            async move { api.add_message_filter(&user_id, &rule).await }
        })
        .await
    }

    pub async fn remove_message_filter(
        &self,
        user_id: &str,
        scope_id: &str,
        muted_username: &str,
    ) -> BackendResult<()> {
        let api = self.api.clone();
        let user_id = user_id.to_string();
        let scope = scope_id.to_string();
        let muted = muted_username.to_string();
        self.write("remove_message_filter", None, move || {
            let api = api.clone();
            let user_id = user_id.clone();
            let scope = scope.clone();
            let muted = muted.clone();
            async move { api.remove_message_filter(&user_id, &scope, &muted).await }
        })
        .await
    }

    pub async fn add_group_member(&self, group_id: &str, username: &str) -> BackendResult<()> {
        let api = self.api.clone();
        let group = group_id.to_string();
        let username = username.to_string();
        self.write("add_group_member", None, move || {
            let api = api.clone();
            let group = group.clone();
            let username = username.clone();
            async move { api.add_group_member(&group, &username).await }
        })
        .await
    }

    pub async fn remove_group_member(&self, group_id: &str, username: &str) -> BackendResult<()> {
        let api = self.api.clone();
        let group = group_id.to_string();
        let username = username.to_string();
        self.write("remove_group_member", None, move || {
            let api = api.clone();
            let group = group.clone();
            let username = username.clone();
            async move { api.remove_group_member(&group, &username).await }
        })
        .await
    }

    pub async fn post_like(&self, from: &str, to: &str) -> BackendResult<()> {
        let api = self.api.clone();
        let from = from.to_string();
        let to = to.to_string();
        self.write("post_like", None, move || {
            let api = api.clone();
            let from = from.clone();
            let to = to.clone();
            async move { api.post_like(&from, &to).await }
        })
        .await
    }

    pub async fn delete_like(&self, from: &str, to: &str) -> BackendResult<()> {
        let api = self.api.clone();
        let from = from.to_string();
        let to = to.to_string();
        self.write("delete_like", None, move || {
            let api = api.clone();
            let from = from.clone();
            let to = to.clone();
            async move { api.delete_like(&from, &to).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::super::http::HttpBackend;
    use super::super::memory::MemoryBackend;
    use super::*;

    fn test_message(scope_id: &str) -> StoredMessage {
        StoredMessage {
            id: "msg_local".to_string(),
            scope_id: scope_id.to_string(),
            user_id: Some("usr_1".to_string()),
            username: "alice".to_string(),
            timestamp_ms: 1_700_000_000_000,
            text: Some("hello".to_string()),
            media_url: None,
            audio_url: None,
            reply_to: None,
            reactions: BTreeMap::new(),
            deleted: false,
            system: false,
        }
    }

    fn test_config() -> Config {
        Config {
            breaker_threshold: 3,
            breaker_cooldown_ms: 200,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn write_failures_open_breaker_then_probe_after_cooldown() {
        let memory = Arc::new(MemoryBackend::new());
        let gateway = BackendGateway::new(memory.clone(), &test_config());

        // Three exhausted calls (two attempts each) cross the threshold.
        memory.fail_next_writes(6);
        for _ in 0..3 {
            let result = gateway.post_message("general", test_message("general")).await;
            assert!(matches!(result, Err(BackendError::Network(_))));
        }
        assert!(gateway.breaker_open());

        // Fourth call short-circuits without touching the backend.
        let started = Instant::now();
        let result = gateway.post_message("general", test_message("general")).await;
        assert!(matches!(result, Err(BackendError::CircuitOpen)));
        assert!(started.elapsed() < Duration::from_millis(100));

        // After the cooldown, exactly the next attempt reaches the network.
        sleep(Duration::from_millis(250)).await;
        let result = gateway.post_message("general", test_message("general")).await;
        assert!(result.is_ok());
        assert!(!gateway.breaker_open());
    }

    #[tokio::test]
    async fn short_circuit_and_attempts_are_recorded() {
        let memory = Arc::new(MemoryBackend::new());
        let gateway = BackendGateway::new(memory.clone(), &test_config());

        memory.fail_next_writes(6);
        for _ in 0..3 {
            let _ = gateway.post_message("general", test_message("general")).await;
        }
        let _ = gateway.post_message("general", test_message("general")).await;

        // 3 calls x 2 attempts + 1 short-circuit.
        let summary = gateway.stats().writes.summary();
        assert_eq!(summary.count, 7);
        assert_eq!(summary.success_rate, 0.0);
    }

    #[tokio::test]
    async fn terminal_4xx_does_not_count_toward_breaker() {
        let memory = Arc::new(MemoryBackend::new());
        let gateway = BackendGateway::new(memory.clone(), &test_config());

        // Editing a message that does not exist yields 404 every time.
        for _ in 0..5 {
            let result = gateway.put_message("general", "missing", "text").await;
            assert!(matches!(result, Err(BackendError::Status(404))));
        }
        assert!(!gateway.breaker_open());
        let result = gateway.post_message("general", test_message("general")).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unreachable_backend_reads_return_fallback() {
        // Nothing listens on this port; connect fails immediately.
        let http = Arc::new(HttpBackend::new(
            "http://127.0.0.1:9",
            Duration::from_millis(500),
            Duration::from_millis(500),
        ));
        let gateway = BackendGateway::new(http, &test_config());

        let messages = gateway.latest_messages("general", 50).await;
        assert!(messages.is_empty());

        let profiles = gateway.profiles(vec!["alice".to_string()]).await;
        assert!(profiles.is_empty());
    }

    #[tokio::test]
    async fn unreachable_backend_writes_open_breaker() {
        let http = Arc::new(HttpBackend::new(
            "http://127.0.0.1:9",
            Duration::from_millis(500),
            Duration::from_millis(500),
        ));
        let gateway = BackendGateway::new(http, &test_config());

        for _ in 0..3 {
            let result = gateway.post_message("general", test_message("general")).await;
            assert!(matches!(result, Err(BackendError::Network(_))));
        }

        let started = Instant::now();
        let result = gateway.post_message("general", test_message("general")).await;
        assert!(matches!(result, Err(BackendError::CircuitOpen)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
