//! Language-model interpreter seam
//!
//! [`Interpreter`] is a black box `prompt -> text`. The requester in
//! [`crate::interpret`] owns timeouts, retries and concurrency; an
//! implementation only performs one call and classifies its failure.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::{SaeError, SaeResult};
use crate::prompt::Prompt;
use crate::registry::FailureKind;

/// Default OpenAI-compatible endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const API_BASE_ENV: &str = "SAE_INTERP_API_BASE";

/// Connection failures surface as transport errors, not call timeouts.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of a single interpreter call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InterpreterError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl InterpreterError {
    /// Worth another attempt: timeouts, rate limits, transport errors, 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited(_) | Self::Transport(_) => true,
            Self::Status { code, .. } => *code >= 500,
            Self::Malformed(_) => false,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_) => FailureKind::Timeout,
            Self::RateLimited(_) => FailureKind::RateLimited,
            Self::Transport(_) => FailureKind::Transport,
            Self::Status { .. } => FailureKind::Status,
            Self::Malformed(_) => FailureKind::Malformed,
        }
    }
}

/// Produces text for a prompt.
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String, InterpreterError>;

    /// Model identifier recorded with every explanation.
    fn model(&self) -> &str;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client.
#[derive(Debug, Clone)]
pub struct HttpInterpreter {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

impl HttpInterpreter {
    pub fn new(model: impl Into<String>, api_base: impl Into<String>, api_key: Option<String>) -> SaeResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SaeError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            temperature: 0.0,
        })
    }

    /// Base URL from `SAE_INTERP_API_BASE` (default OpenAI), key from
    /// `OPENAI_API_KEY`. A missing key is only an error for the default base.
    pub fn from_env(model: impl Into<String>) -> SaeResult<Self> {
        let api_base = std::env::var(API_BASE_ENV).ok();
        let api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        if api_base.is_none() && api_key.is_none() {
            return Err(SaeError::config(format!(
                "{API_KEY_ENV} is not set (set {API_BASE_ENV} for a keyless endpoint)"
            )));
        }
        Self::new(
            model,
            api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key,
        )
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

#[async_trait]
impl Interpreter for HttpInterpreter {
    async fn complete(&self, prompt: &Prompt) -> Result<String, InterpreterError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.temperature,
        };

        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() && !e.is_connect() {
                InterpreterError::Timeout(Duration::ZERO)
            } else {
                InterpreterError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let text = response.text().await.unwrap_or_default();
            return Err(InterpreterError::RateLimited(text));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(InterpreterError::Status {
                code: status.as_u16(),
                body: text,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| InterpreterError::Malformed(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| InterpreterError::Malformed("response has no choices".into()))?;
        debug!("Interpreter returned {} chars", content.len());
        Ok(content)
    }

    fn model(&self) -> &str {
        &self.model
    }
}
