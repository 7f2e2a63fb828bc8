use serde::{Deserialize, Serialize};

use crate::errors::ChatError;
use crate::ids::{MessageId, SessionId, VisitorId};

/// Upper bound on message content, counted in Unicode scalar values.
pub const MAX_MESSAGE_LEN: usize = 4000;

/// Prefix stored on admin-authored replies so clients can tell them apart
/// from generated ones.
pub const ADMIN_MARKER: &str = "[admin] ";

/// Seeded as the first message of every new session, authored as the assistant.
pub const WELCOME_MESSAGE: &str =
    "Hi, I'm the site assistant. Ask me anything, or leave a message and I'll pass it along.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// A chat session between one visitor and the assistant/admin side.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: SessionId,
    pub visitor_id: VisitorId,
    pub visitor_name: Option<String>,
    pub status: SessionStatus,
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

impl ChatSession {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// One immutable message within a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: String,
}

/// Validate user-submitted message content before it touches storage.
pub fn validate_content(content: &str) -> Result<(), ChatError> {
    let len = content.chars().count();
    if len == 0 {
        return Err(ChatError::Validation("message content is empty".into()));
    }
    if len > MAX_MESSAGE_LEN {
        return Err(ChatError::Validation(format!(
            "message content exceeds {MAX_MESSAGE_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_display() {
        for status in [SessionStatus::Active, SessionStatus::Closed] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "archived".parse::<SessionStatus>().unwrap_err();
        assert!(err.contains("unknown session status"), "got: {err}");
    }

    #[test]
    fn role_roundtrips_through_display() {
        for role in [MessageRole::User, MessageRole::Assistant, MessageRole::System] {
            let parsed: MessageRole = role.to_string().parse().unwrap();
            assert_eq!(parsed, role);
        }
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_value(MessageRole::Assistant).unwrap();
        assert_eq!(json, serde_json::json!("assistant"));
    }

    #[test]
    fn message_serializes_camel_case() {
        let message = ChatMessage {
            id: MessageId::from_raw("msg_1"),
            session_id: SessionId::from_raw("sess_1"),
            role: MessageRole::User,
            content: "hello".to_string(),
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["sessionId"], "sess_1");
        assert_eq!(json["createdAt"], "2026-01-01T00:00:00+00:00");
        assert_eq!(json["role"], "user");
    }

    #[test]
    fn session_serializes_camel_case() {
        let session = ChatSession {
            id: SessionId::from_raw("sess_1"),
            visitor_id: VisitorId::from_raw("visitor_1"),
            visitor_name: Some("Ada".to_string()),
            status: SessionStatus::Active,
            metadata: serde_json::json!({}),
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            updated_at: "2026-01-01T00:00:00+00:00".to_string(),
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["visitorId"], "visitor_1");
        assert_eq!(json["visitorName"], "Ada");
        assert_eq!(json["status"], "active");
    }

    #[test]
    fn empty_content_rejected() {
        assert!(validate_content("").is_err());
    }

    #[test]
    fn max_length_content_accepted() {
        let content = "a".repeat(MAX_MESSAGE_LEN);
        assert!(validate_content(&content).is_ok());
    }

    #[test]
    fn oversized_content_rejected() {
        let content = "a".repeat(MAX_MESSAGE_LEN + 1);
        assert!(validate_content(&content).is_err());
    }

    #[test]
    fn length_counts_chars_not_bytes() {
        // 4000 multibyte chars is within bounds even though it exceeds 4000 bytes
        let content = "é".repeat(MAX_MESSAGE_LEN);
        assert!(validate_content(&content).is_ok());
    }
}
