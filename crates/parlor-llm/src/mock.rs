use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use parlor_core::errors::GeneratorError;
use parlor_core::generator::{ChatTurn, ReplyGenerator};

/// Pre-programmed replies for deterministic testing without API calls.
pub enum MockReply {
    /// Return this text.
    Text(String),
    /// Return an error from the generate() call.
    Failure(GeneratorError),
    /// Wait a duration, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock generator that yields pre-programmed replies in sequence and records
/// the history each call received.
pub struct MockGenerator {
    replies: Vec<MockReply>,
    call_count: AtomicUsize,
    received: Mutex<Vec<Vec<ChatTurn>>>,
}

impl MockGenerator {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies,
            call_count: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Histories passed to generate(), in call order.
    pub fn received(&self) -> Vec<Vec<ChatTurn>> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl ReplyGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, history: &[ChatTurn]) -> Result<String, GeneratorError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.received.lock().push(history.to_vec());

        let Some(mut reply) = self.replies.get(idx) else {
            return Err(GeneratorError::Rejected(format!(
                "MockGenerator: no reply configured for call {idx}"
            )));
        };

        // Unroll nested delays iteratively to avoid recursive async.
        loop {
            match reply {
                MockReply::Text(text) => return Ok(text.clone()),
                MockReply::Failure(error) => return Err(error.clone()),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(*duration).await;
                    reply = inner.as_ref();
                }
            }
        }
    }
}

/// Generator that always returns an empty reply. Wired when no API key is
/// configured: chat still works, nothing gets generated.
pub struct SilentGenerator;

#[async_trait]
impl ReplyGenerator for SilentGenerator {
    fn name(&self) -> &str {
        "silent"
    }

    async fn generate(&self, _history: &[ChatTurn]) -> Result<String, GeneratorError> {
        Ok(String::new())
    }
}
