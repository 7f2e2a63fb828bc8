use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wire-level error codes carried in ERROR envelopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    Unauthorized,
    SessionNotFound,
    NotInSession,
    SessionClosed,
    RateLimited,
    UnknownMessageType,
    InvalidMessage,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::NotInSession => "NOT_IN_SESSION",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::RateLimited => "RATE_LIMITED",
            Self::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol failures, each reported to the originating connection only.
/// None of these transition the connection state machine; retry is always safe.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid admin credential")]
    Unauthorized,
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("no session joined")]
    NotInSession,
    #[error("session is closed")]
    SessionClosed,
    #[error("too many messages, slow down")]
    RateLimited,
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("malformed message: {0}")]
    InvalidMessage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::NotInSession => ErrorCode::NotInSession,
            Self::SessionClosed => ErrorCode::SessionClosed,
            Self::RateLimited => ErrorCode::RateLimited,
            Self::UnknownMessageType(_) => ErrorCode::UnknownMessageType,
            Self::InvalidMessage(_) => ErrorCode::InvalidMessage,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Failures from the reply generator collaborator. These never reach the
/// visitor as ERROR envelopes; the handler treats them as "no reply".
#[derive(Clone, Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("credentials rejected: {0}")]
    BadCredentials(String),
    #[error("rate limited upstream")]
    RateLimited,
    #[error("upstream overloaded")]
    Overloaded,
    #[error("upstream error {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed reply: {0}")]
    MalformedReply(String),
}

impl GeneratorError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::BadCredentials(_) => "bad_credentials",
            Self::RateLimited => "rate_limited",
            Self::Overloaded => "overloaded",
            Self::Upstream { .. } => "upstream",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::MalformedReply(_) => "malformed_reply",
        }
    }

    /// Map an HTTP response status onto the failure it represents.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400 => Self::Rejected(body),
            401 | 403 => Self::BadCredentials(body),
            429 => Self::RateLimited,
            529 => Self::Overloaded,
            500..=599 => Self::Upstream { status, body },
            _ => Self::Rejected(format!("unexpected status {status}: {body}")),
        }
    }
}
