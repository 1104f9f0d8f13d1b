//! Abstraction over the persistence backend.
//!
//! Backed by HTTP in production and an in-memory map in tests. Each method
//! is a single attempt; retries, the circuit breaker, and fallbacks live in
//! [`super::gateway::BackendGateway`].

use async_trait::async_trait;

use banter_common::model::{FilterRule, ProfileSummary, StoredMessage};

/// Failure of one backend attempt.
#[derive(Debug, Clone)]
pub enum BackendError {
    Timeout,
    Network(String),
    Status(u16),
    Decode(String),
    /// The write gateway refused to attempt the call (breaker open).
    CircuitOpen,
}

impl BackendError {
    /// Reads retry only on timeouts and network errors.
    pub fn is_retriable_read(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network(_))
    }

    /// Network errors, timeouts, and 5xx retry and count toward the
    /// breaker; 4xx are terminal and never counted.
    pub fn is_retriable_write(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::Status(code) => *code >= 500,
            Self::Decode(_) | Self::CircuitOpen => false,
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "backend timeout"),
            Self::Network(msg) => write!(f, "backend network error: {msg}"),
            Self::Status(code) => write!(f, "backend returned status {code}"),
            Self::Decode(msg) => write!(f, "backend response decode error: {msg}"),
            Self::CircuitOpen => write!(f, "write short-circuited: breaker open"),
        }
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = Result<T, BackendError>;

/// The persistence API the relay collaborates with. The backend owns
/// durable storage and authorization of write content; the relay never
/// assumes either.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn latest_messages(
        &self,
        scope_id: &str,
        count: usize,
    ) -> BackendResult<Vec<StoredMessage>>;

    async fn message_page(
        &self,
        scope_id: &str,
        before_ms: i64,
        limit: usize,
    ) -> BackendResult<Vec<StoredMessage>>;

    /// Persist a new message. The backend may replace the relay's locally
    /// generated id; the returned row is authoritative.
    async fn post_message(
        &self,
        scope_id: &str,
        message: &StoredMessage,
    ) -> BackendResult<StoredMessage>;

    async fn put_message(
        &self,
        scope_id: &str,
        message_id: &str,
        text: &str,
    ) -> BackendResult<StoredMessage>;

    async fn delete_message(&self, scope_id: &str, message_id: &str) -> BackendResult<()>;

    /// Persist one user's reaction state on a message; `emoji: None`
    /// clears it.
    async fn post_reaction(
        &self,
        scope_id: &str,
        message_id: &str,
        username: &str,
        emoji: Option<&str>,
    ) -> BackendResult<()>;

    async fn message_filters(&self, user_id: &str) -> BackendResult<Vec<FilterRule>>;

    async fn add_message_filter(&self, user_id: &str, rule: &FilterRule) -> BackendResult<()>;

    async fn remove_message_filter(
        &self,
        user_id: &str,
        scope_id: &str,
        muted_username: &str,
    ) -> BackendResult<()>;

    async fn add_group_member(&self, group_id: &str, username: &str) -> BackendResult<()>;

    async fn remove_group_member(&self, group_id: &str, username: &str) -> BackendResult<()>;

    async fn profiles(&self, usernames: &[String]) -> BackendResult<Vec<ProfileSummary>>;

    async fn post_like(&self, from: &str, to: &str) -> BackendResult<()>;

    async fn delete_like(&self, from: &str, to: &str) -> BackendResult<()>;

    async fn dm_threads(&self, username: &str) -> BackendResult<Vec<String>>;
}
