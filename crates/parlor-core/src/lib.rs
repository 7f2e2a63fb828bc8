pub mod chat;
pub mod errors;
pub mod generator;
pub mod ids;
pub mod protocol;
pub mod security;

pub use chat::{ChatMessage, ChatSession, MessageRole, SessionStatus};
pub use errors::{ChatError, ErrorCode, GeneratorError};
pub use generator::{ChatTurn, ReplyGenerator};
pub use protocol::{ClientEnvelope, ServerEnvelope};
pub use security::{AdminKey, ApiKey};
