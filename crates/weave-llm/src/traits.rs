//! The adapter trait and conversation types.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::error::LLMError;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a conversation.
#[derive(Debug, Clone)]
pub struct LLMMessage {
    pub role: Role,
    pub content: String,
}

impl LLMMessage {
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

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
}

impl TokenUsage {
    pub fn total(self) -> u32 {
        self.prompt + self.completion
    }
}

/// Why the completion stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    Error,
}

/// A full completion.
#[derive(Debug, Clone)]
pub struct LLMResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
    pub model: String,
}

/// A fragment of a streaming completion.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
}

/// Boxed chunk stream returned by `generate_stream`.
pub type ChunkStream<'a> = Pin<Box<dyn Stream<Item = Result<StreamChunk, LLMError>> + Send + 'a>>;

/// Uniform interface over LLM providers.
#[async_trait]
pub trait LLMAdapter: Send + Sync {
    /// Provider name, e.g. "anthropic".
    fn provider(&self) -> &str;

    /// Model identifier in use.
    fn model(&self) -> &str;

    /// Generate a completion for the given conversation.
    async fn generate(&self, messages: &[LLMMessage]) -> Result<LLMResponse, LLMError>;

    /// Generate a completion as a stream of chunks.
    fn generate_stream<'a>(&'a self, messages: &'a [LLMMessage]) -> ChunkStream<'a>;

    /// Probe whether the provider is reachable.
    async fn health_check(&self) -> Result<bool, LLMError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        assert_eq!(LLMMessage::system("a").role, Role::System);
        assert_eq!(LLMMessage::user("b").role, Role::User);
        assert_eq!(LLMMessage::assistant("c").role, Role::Assistant);
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage {
            prompt: 120,
            completion: 30,
        };
        assert_eq!(usage.total(), 150);
    }
}
