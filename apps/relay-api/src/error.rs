use serde::Serialize;
use serde_json::Value;

/// Error codes carried on scoped error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotAuthenticated,
    InvalidScope,
    NotParticipant,
    NotFound,
    NotAllowed,
    ServerError,
    ValidationError,
}

/// A failed gateway operation.
///
/// Delivered to the requesting connection as a named, scoped error event
/// (`group:error`, `dm:error`, ...), never as a panic and never as a
/// dropped connection.
#[derive(Debug, Clone, Serialize)]
pub struct RelayError {
    pub code: ErrorCode,
    pub message: String,
    /// Operation the client attempted ("send", "edit", "react", ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    /// Best-effort echo of the request target so optimistic client state
    /// can be cleared even when the operation failed.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub echo: Value,
}

impl RelayError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            op: None,
            scope_id: None,
            echo: Value::Null,
        }
    }

    pub fn not_authenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotAuthenticated, message)
    }

    pub fn invalid_scope(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidScope, message)
    }

    pub fn not_participant(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotParticipant, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotAllowed, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn with_op(mut self, op: &'static str) -> Self {
        self.op = Some(op);
        self
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn with_echo(mut self, echo: Value) -> Self {
        self.echo = echo;
        self
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RelayError {}

impl From<banter_common::scope::InvalidScopeId> for RelayError {
    fn from(err: banter_common::scope::InvalidScopeId) -> Self {
        Self::invalid_scope(err.to_string()).with_scope(err.scope_id)
    }
}
