//! Hosted chat-completion boundary.
//!
//! The assistant hands a finished message list to a
//! [`ChatCompletionProvider`] and gets back generated text or an
//! [`LlmError`]. Exactly one provider is active per process, chosen by
//! `[llm] provider` at startup.
//!
//! [`OpenAiCompatibleChat`] speaks the `chat/completions` wire format shared
//! by DeepSeek and OpenAI: bearer auth, non-streaming, one request per
//! question, bounded by `llm.timeout_secs`. It does not retry; a failed
//! call degrades the answer instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::models::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Messages plus generation parameters.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("language model not configured: {0}")]
    NotConfigured(String),
    #[error("language model request timed out after {0}s")]
    Timeout(u64),
    #[error("language model transport error: {0}")]
    Transport(String),
    #[error("language model API error ({code}): {body}")]
    Status { code: u16, body: String },
    #[error("malformed language model response: {0}")]
    MalformedResponse(String),
}

impl LlmError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LlmError::NotConfigured(_) => FailureKind::NotConfigured,
            LlmError::Timeout(_) => FailureKind::Timeout,
            LlmError::Transport(_) | LlmError::Status { .. } => FailureKind::Transport,
            LlmError::MalformedResponse(_) => FailureKind::MalformedResponse,
        }
    }
}

#[async_trait]
pub trait ChatCompletionProvider: Send + Sync {
    /// Provider name for logs (e.g. `"deepseek"`).
    fn name(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    /// Null for some reasoning models when generation was cut short.
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireErrorResponse {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: String,
}

/// DeepSeek / OpenAI `chat/completions` client.
pub struct OpenAiCompatibleChat {
    name: String,
    endpoint: String,
    model: String,
    api_key: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OpenAiCompatibleChat {
    /// Build a client from configuration.
    ///
    /// Fails with [`LlmError::NotConfigured`] when the provider is disabled
    /// or its API key variable is unset or empty.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        if !config.is_enabled() {
            return Err(LlmError::NotConfigured("llm.provider is disabled".to_string()));
        }
        let key_env = config.resolved_api_key_env();
        let api_key = std::env::var(&key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::NotConfigured(format!("{} is not set", key_env)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        Ok(Self {
            name: config.provider.clone(),
            endpoint: config.resolved_endpoint(),
            model: config.resolved_model(),
            api_key,
            timeout_secs: config.timeout_secs,
            client,
        })
    }
}

#[async_trait]
impl ChatCompletionProvider for OpenAiCompatibleChat {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let body = WireRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };

        debug!(provider = %self.name, model = %self.model, messages = request.messages.len(), "sending chat completion");

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout_secs)
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.timeout_secs)
            } else {
                LlmError::Transport(e.to_string())
            }
        })?;

        if !status.is_success() {
            let message = serde_json::from_str::<WireErrorResponse>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            warn!(provider = %self.name, %status, "chat completion failed");
            return Err(LlmError::Status {
                code: status.as_u16(),
                body: message,
            });
        }

        parse_completion(&text)
    }
}

fn parse_completion(body: &str) -> Result<String, LlmError> {
    let parsed: WireResponse =
        serde_json::from_str(body).map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| LlmError::MalformedResponse("no message content".to_string()))?;

    let content = content.trim();
    if content.is_empty() {
        return Err(LlmError::MalformedResponse("empty message content".to_string()));
    }
    Ok(content.to_string())
}

/// The configured provider, or why none is available.
pub fn create_chat_provider(
    config: &LlmConfig,
) -> Result<Arc<dyn ChatCompletionProvider>, LlmError> {
    match config.provider.as_str() {
        "deepseek" | "openai" => Ok(Arc::new(OpenAiCompatibleChat::new(config)?)),
        "disabled" => Err(LlmError::NotConfigured("llm.provider is disabled".to_string())),
        other => Err(LlmError::NotConfigured(format!("unknown llm provider '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_in_wire_format() {
        let messages = vec![ChatMessage::system("persona"), ChatMessage::user("问题")];
        let body = WireRequest {
            model: "deepseek-reasoner",
            messages: &messages,
            temperature: 0.7,
            max_tokens: 1000,
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"], "问题");
        assert_eq!(json["max_tokens"], 1000);
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn parses_first_choice() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":" 你好 "}}]}"#;
        assert_eq!(parse_completion(body).unwrap(), "你好");
    }

    #[test]
    fn rejects_malformed_bodies() {
        for body in [
            "not json",
            r#"{"choices":[]}"#,
            r#"{"choices":[{"message":{"content":null}}]}"#,
            r#"{"choices":[{"message":{"content":"   "}}]}"#,
        ] {
            let err = parse_completion(body).unwrap_err();
            assert_eq!(err.kind(), FailureKind::MalformedResponse, "body: {}", body);
        }
    }

    #[test]
    fn missing_key_is_not_configured() {
        let config = LlmConfig {
            api_key_env: Some("KYASSIST_TEST_KEY_THAT_IS_NEVER_SET".to_string()),
            ..LlmConfig::default()
        };
        let err = create_chat_provider(&config).err().unwrap();
        assert_eq!(err.kind(), FailureKind::NotConfigured);
    }

    #[test]
    fn disabled_provider_is_not_configured() {
        let config = LlmConfig {
            provider: "disabled".to_string(),
            ..LlmConfig::default()
        };
        assert!(matches!(
            create_chat_provider(&config),
            Err(LlmError::NotConfigured(_))
        ));
    }
}
