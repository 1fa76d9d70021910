//! Response generation: persona instruction + transcript → one chat completion.
//!
//! Failures never reach the caller. Timeout, transport error, non-2xx status, malformed body
//! or a missing API key all produce [`FALLBACK_REPLY`] so synthesis still has something to say.

use crate::config::LlmConfig;
use crate::persona::Persona;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const FALLBACK_REPLY: &str = "I'm sorry, I couldn't process your request right now.";

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("no API key configured")]
    MissingApiKey,
    #[error("HTTP client setup failed: {0}")]
    Client(String),
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("API error {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Single-turn text completion service.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// OpenRouter (OpenAI-compatible) `/chat/completions` client.
pub struct OpenRouterClient {
    api_base: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl OpenRouterClient {
    /// Fails instead of falling back to a client without the configured timeout.
    pub fn new(config: &LlmConfig) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GenerationError::Client(e.to_string()))?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from),
            model: config.model.clone(),
            client,
        })
    }
}

#[async_trait]
impl CompletionClient for OpenRouterClient {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        let api_key = self.api_key.as_deref().ok_or(GenerationError::MissingApiKey)?;
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let res = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout
                } else {
                    GenerationError::Transport(e.to_string())
                }
            })?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;
        parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GenerationError::Malformed("no choices[0].message.content".to_string()))
    }
}

/// Reply text plus whether it is the fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedReply {
    pub text: String,
    pub degraded: bool,
}

/// Persona-aware wrapper around a [`CompletionClient`] with the degrade-to-fallback policy.
#[derive(Clone)]
pub struct ResponseGenerator {
    client: Arc<dyn CompletionClient>,
}

impl ResponseGenerator {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, GenerationError> {
        Ok(Self::new(Arc::new(OpenRouterClient::new(config)?)))
    }

    /// Prompt sent for `user_text` under `persona`.
    pub fn build_prompt(user_text: &str, persona: Persona) -> String {
        format!("{} {}", persona.instruction(), user_text)
    }

    pub async fn generate(&self, user_text: &str, persona: Persona) -> GeneratedReply {
        let prompt = Self::build_prompt(user_text, persona);
        match self.client.complete(&prompt).await {
            Ok(text) => {
                debug!(target: "voxchat::pipeline", persona = %persona, "LLM reply: {}", text);
                GeneratedReply {
                    text,
                    degraded: false,
                }
            }
            Err(e) => {
                warn!(target: "voxchat::pipeline", persona = %persona, "Generation degraded, using fallback: {}", e);
                GeneratedReply {
                    text: FALLBACK_REPLY.to_string(),
                    degraded: true,
                }
            }
        }
    }
}
