use serde::{Deserialize, Serialize};

use crate::chat::{ChatMessage, ChatSession};
use crate::errors::{ChatError, ErrorCode};

/// Raw inbound frame; `payload` stays untyped until the type is known.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinPayload {
    session_id: String,
    #[serde(default)]
    is_admin: bool,
    #[serde(default)]
    admin_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendPayload {
    content: String,
}

/// The five client-initiated protocol operations.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEnvelope {
    JoinSession {
        session_id: String,
        is_admin: bool,
        admin_key: Option<String>,
    },
    LeaveSession,
    SendMessage { content: String },
    TypingStart,
    TypingStop,
}

impl ClientEnvelope {
    /// Parse one text frame. Malformed JSON, unknown types, and recognized
    /// types with unusable payloads each map to their own error code.
    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        let envelope: RawEnvelope =
            serde_json::from_str(raw).map_err(|e| ChatError::InvalidMessage(e.to_string()))?;
        match envelope.kind.as_str() {
            "JOIN_SESSION" => {
                let p: JoinPayload = serde_json::from_value(envelope.payload)
                    .map_err(|e| ChatError::Validation(format!("bad JOIN_SESSION payload: {e}")))?;
                Ok(Self::JoinSession {
                    session_id: p.session_id,
                    is_admin: p.is_admin,
                    admin_key: p.admin_key,
                })
            }
            "LEAVE_SESSION" => Ok(Self::LeaveSession),
            "SEND_MESSAGE" => {
                let p: SendPayload = serde_json::from_value(envelope.payload)
                    .map_err(|e| ChatError::Validation(format!("bad SEND_MESSAGE payload: {e}")))?;
                Ok(Self::SendMessage { content: p.content })
            }
            "TYPING_START" => Ok(Self::TypingStart),
            "TYPING_STOP" => Ok(Self::TypingStop),
            other => Err(ChatError::UnknownMessageType(other.to_string())),
        }
    }
}

/// Server-to-client envelopes, serialized as `{type, payload}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEnvelope {
    SessionJoined {
        session: ChatSession,
        messages: Vec<ChatMessage>,
    },
    MessageReceived {
        message: ChatMessage,
    },
    AiResponse {
        message: ChatMessage,
    },
    TypingStart {
        #[serde(rename = "isAdmin")]
        is_admin: bool,
    },
    TypingStop {
        #[serde(rename = "isAdmin")]
        is_admin: bool,
    },
    SessionClosed {},
    Error { code: ErrorCode, message: String },
}

impl ServerEnvelope {
    /// Wire type string, for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionJoined { .. } => "SESSION_JOINED",
            Self::MessageReceived { .. } => "MESSAGE_RECEIVED",
            Self::AiResponse { .. } => "AI_RESPONSE",
            Self::TypingStart { .. } => "TYPING_START",
            Self::TypingStop { .. } => "TYPING_STOP",
            Self::SessionClosed {} => "SESSION_CLOSED",
            Self::Error { .. } => "ERROR",
        }
    }

    pub fn error(err: &ChatError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
