use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parlor_core::chat::MessageRole;
use parlor_core::errors::GeneratorError;
use parlor_core::generator::{ChatTurn, ReplyGenerator};
use parlor_core::security::ApiKey;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TOKENS: u32 = 1024;

/// Reply generator backed by the Anthropic Messages API (non-streaming).
pub struct AnthropicGenerator {
    client: Client,
    api_key: ApiKey,
    model: String,
}

impl AnthropicGenerator {
    pub fn new(api_key: ApiKey, model: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            api_key,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
}

#[derive(Debug, PartialEq, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Fold system turns into the out-of-band `system` field and map the rest.
/// The API requires conversations to open with a user turn, so leading
/// assistant turns (the seeded welcome message) are dropped.
fn build_body<'a>(model: &'a str, history: &[ChatTurn]) -> MessagesRequest<'a> {
    let mut system: Option<String> = None;
    let mut messages = Vec::new();

    for turn in history {
        match turn.role {
            MessageRole::System => match &mut system {
                Some(s) => {
                    s.push_str("\n\n");
                    s.push_str(&turn.content);
                }
                None => system = Some(turn.content.clone()),
            },
            MessageRole::User => messages.push(WireMessage {
                role: "user",
                content: turn.content.clone(),
            }),
            MessageRole::Assistant => {
                if messages.is_empty() {
                    continue;
                }
                messages.push(WireMessage {
                    role: "assistant",
                    content: turn.content.clone(),
                });
            }
        }
    }

    MessagesRequest {
        model,
        max_tokens: MAX_TOKENS,
        system,
        messages,
    }
}

fn extract_text(resp: &MessagesResponse) -> String {
    let mut out = String::new();
    for block in &resp.content {
        if block.kind == "text" {
            out.push_str(&block.text);
        }
    }
    out.trim().to_string()
}

#[async_trait]
impl ReplyGenerator for AnthropicGenerator {
    fn name(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip(self, history), fields(model = %self.model, turns = history.len()))]
    async fn generate(&self, history: &[ChatTurn]) -> Result<String, GeneratorError> {
        let body = build_body(&self.model, history);

        let resp = self
            .client
            .post(API_URL)
            .header("x-api-key", self.api_key.0.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("accept", "application/json")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GeneratorError::Timeout(REQUEST_TIMEOUT)
                } else {
                    GeneratorError::Network(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GeneratorError::from_status(status, body));
        }

        let parsed: MessagesResponse = resp
            .json()
            .await
            .map_err(|e| GeneratorError::MalformedReply(e.to_string()))?;

        Ok(extract_text(&parsed))
    }
}
