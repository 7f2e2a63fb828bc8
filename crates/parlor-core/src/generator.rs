use async_trait::async_trait;

use crate::chat::{ChatMessage, MessageRole};
use crate::errors::GeneratorError;

/// How many trailing messages of session history accompany a generator call.
pub const HISTORY_WINDOW: usize = 20;

/// System instruction prepended to every generator call. Fixed by contract:
/// the assistant's voice is part of the chat behavior, not configuration.
pub const PERSONA: &str = "You are the resident assistant on a personal portfolio site. \
You answer questions about the site owner's work, projects, and writing in a warm, \
concise voice. If a visitor asks for something you cannot know, say so plainly and \
suggest they leave a message for the owner. Keep replies under a few short paragraphs.";

/// One turn of conversation as the generator sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into() }
    }
}

impl From<&ChatMessage> for ChatTurn {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// External collaborator that turns conversation history into a reply.
///
/// History arrives oldest-first with the persona already prepended as a
/// system turn. Implementations must bound their own transport time; the
/// caller additionally enforces an overall deadline and treats any failure
/// as "no reply".
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, history: &[ChatTurn]) -> Result<String, GeneratorError>;
}

/// Build the generator input for a session: persona first, then the trailing
/// window of history oldest-first.
pub fn build_turns(history: &[ChatMessage]) -> Vec<ChatTurn> {
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    let mut turns = Vec::with_capacity(history.len() - start + 1);
    turns.push(ChatTurn::system(PERSONA));
    turns.extend(history[start..].iter().map(ChatTurn::from));
    turns
}
