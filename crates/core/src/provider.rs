//! Provider trait — the abstraction over the upstream model endpoint.
//!
//! The upstream model is an opaque text-completion service. A Provider
//! sends an ordered list of prompt messages and returns either the complete
//! text or a stream of text chunks terminated by a `done` chunk.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::Role;

/// Accepted temperature range for upstream calls.
pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.0..=2.0;

/// Accepted `max_tokens` range for upstream calls.
pub const MAX_TOKENS_RANGE: std::ops::RangeInclusive<u32> = 1..=16384;

/// One role-tagged message sent upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
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

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "gpt-4o-mini")
    pub model: String,

    /// Ordered prompt messages (instruction layers, history, user turn)
    pub messages: Vec<PromptMessage>,

    /// Temperature, 0.0 to 2.0
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate, 1 to 16384
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,

    /// Ask the endpoint for a JSON object response when it supports it
    #[serde(default)]
    pub json_mode: bool,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, messages: Vec<PromptMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            stream: false,
            json_mode: true,
        }
    }

    /// Reject parameters outside the upstream contract before sending.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if !TEMPERATURE_RANGE.contains(&self.temperature) {
            return Err(ProviderError::InvalidRequest(format!(
                "temperature {} outside 0.0..=2.0",
                self.temperature
            )));
        }
        if !MAX_TOKENS_RANGE.contains(&self.max_tokens) {
            return Err(ProviderError::InvalidRequest(format!(
                "max_tokens {} outside 1..=16384",
                self.max_tokens
            )));
        }
        if self.messages.is_empty() {
            return Err(ProviderError::InvalidRequest("no messages".into()));
        }
        Ok(())
    }
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated text
    pub content: String,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

impl ProviderResponse {
    pub fn tokens_used(&self) -> u32 {
        self.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0)
    }
}

/// Token usage information.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Sum two usage records (used when several attempts make up one turn).
    pub fn add(&self, other: &Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
        }
    }
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Terminator sentinel
    #[serde(default)]
    pub done: bool,

    /// Usage info (delivered out of band, typically with or before the terminator)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            done: false,
            usage: None,
        }
    }

    pub fn done(usage: Option<Usage>) -> Self {
        Self {
            content: None,
            done: true,
            usage,
        }
    }
}

/// Receiving half of a streaming call.
pub type ChunkReceiver =
    tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>;

/// The core Provider trait.
///
/// The pipeline calls `complete()` or `stream()` without knowing which
/// endpoint is behind it.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openai").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(&self, request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Default implementation calls `complete()` and wraps the result as a
    /// content chunk followed by the terminator.
    async fn stream(&self, request: ProviderRequest) -> std::result::Result<ChunkReceiver, ProviderError> {
        let response = self.complete(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(2);
        let _ = tx.send(Ok(StreamChunk::text(response.content))).await;
        let _ = tx.send(Ok(StreamChunk::done(response.usage))).await;
        Ok(rx)
    }

    /// Health check — can we reach the provider?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                content: request.messages.last().map(|m| m.content.clone()).unwrap_or_default(),
                usage: Some(Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                }),
                model: request.model,
            })
        }
    }

    #[test]
    fn provider_request_defaults() {
        let req = ProviderRequest::new("gpt-4o", vec![PromptMessage::user("hi")]);
        assert!((req.temperature - 0.7).abs() < f32::EPSILON);
        assert!(!req.stream);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn out_of_range_parameters_rejected() {
        let mut req = ProviderRequest::new("gpt-4o", vec![PromptMessage::user("hi")]);
        req.temperature = 2.5;
        assert!(matches!(req.validate(), Err(ProviderError::InvalidRequest(_))));

        req.temperature = 1.0;
        req.max_tokens = 0;
        assert!(req.validate().is_err());

        req.max_tokens = 16385;
        assert!(req.validate().is_err());

        req.max_tokens = 16384;
        assert!(req.validate().is_ok());
    }

    #[tokio::test]
    async fn default_stream_wraps_completion() {
        let provider = EchoProvider;
        let mut rx = provider
            .stream(ProviderRequest::new("m", vec![PromptMessage::user("ping")]))
            .await
            .unwrap();

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.content.as_deref(), Some("ping"));
        assert!(!first.done);

        let last = rx.recv().await.unwrap().unwrap();
        assert!(last.done);
        assert_eq!(last.usage.unwrap().total_tokens, 2);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn usage_adds_up() {
        let a = Usage { prompt_tokens: 1, completion_tokens: 2, total_tokens: 3 };
        let b = Usage { prompt_tokens: 4, completion_tokens: 5, total_tokens: 9 };
        assert_eq!(a.add(&b).total_tokens, 12);
    }
}
