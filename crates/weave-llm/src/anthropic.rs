//! Anthropic provider adapter.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::LLMError;
use crate::traits::{
    ChunkStream, FinishReason, LLMAdapter, LLMMessage, LLMResponse, Role, StreamChunk, TokenUsage,
};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Adapter for Claude models. The API key comes from `LLM_API_KEY` in the
/// server binary.
pub struct AnthropicAdapter {
    client: Client,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl AnthropicAdapter {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.7,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// The API takes the system prompt out of band; everything else maps
    /// onto user/assistant turns.
    fn split_system(messages: &[LLMMessage]) -> (Option<String>, Vec<WireMessage>) {
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());
        let turns = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| WireMessage {
                role: match m.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                }
                .to_string(),
                content: m.content.clone(),
            })
            .collect();
        (system, turns)
    }

    fn request_body(&self, messages: &[LLMMessage], stream: bool) -> WireRequest {
        let (system, turns) = Self::split_system(messages);
        WireRequest {
            model: self.model.clone(),
            messages: turns,
            max_tokens: self.max_tokens,
            system,
            temperature: Some(self.temperature),
            stream: stream.then_some(true),
        }
    }
}

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct WireResponse {
    content: Vec<WireContent>,
    model: String,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Deserialize)]
struct WireContent {
    text: String,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct WireStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<WireDelta>,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct WireError {
    error: WireErrorDetail,
}

#[derive(Deserialize)]
struct WireErrorDetail {
    message: String,
}

/// Offset of the first `\n\n` event delimiter, if a full event is buffered.
fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

fn classify_status(status: reqwest::StatusCode, message: String) -> LLMError {
    match status.as_u16() {
        401 | 403 => LLMError::Authentication(message),
        429 => LLMError::RateLimited(message),
        500..=599 => LLMError::Connection(message),
        _ => LLMError::Api(message),
    }
}

// ============================================================================
// ADAPTER IMPL
// ============================================================================

#[async_trait]
impl LLMAdapter for AnthropicAdapter {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, messages), fields(provider = "anthropic", model = %self.model))]
    async fn generate(&self, messages: &[LLMMessage]) -> Result<LLMResponse, LLMError> {
        debug!(message_count = messages.len(), "requesting completion");

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&self.request_body(messages, false))
            .send()
            .await
            .map_err(|e| LLMError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<WireError>().await {
                Ok(e) => e.error.message,
                Err(e) => e.to_string(),
            };
            return Err(classify_status(status, message));
        }

        let body: WireResponse = response
            .json()
            .await
            .map_err(|e| LLMError::InvalidResponse(e.to_string()))?;

        let content: String = body.content.into_iter().map(|c| c.text).collect();
        if content.is_empty() {
            return Err(LLMError::EmptyResponse);
        }

        Ok(LLMResponse {
            content,
            usage: TokenUsage {
                prompt: body.usage.input_tokens,
                completion: body.usage.output_tokens,
            },
            finish_reason: match body.stop_reason.as_deref() {
                Some("max_tokens") => FinishReason::Length,
                _ => FinishReason::Stop,
            },
            model: body.model,
        })
    }

    fn generate_stream<'a>(&'a self, messages: &'a [LLMMessage]) -> ChunkStream<'a> {
        let request = self.request_body(messages, true);
        Box::pin(async_stream::try_stream! {
            let response = self
                .client
                .post(API_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .header("content-type", "application/json")
                .json(&request)
                .send()
                .await
                .map_err(|e| LLMError::Connection(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                Err(classify_status(status, format!("stream request returned {status}")))?;
            }

            use futures::StreamExt;
            let mut bytes = response.bytes_stream();
            // Network chunk boundaries can split multi-byte characters, so
            // the accumulator stays raw bytes; only complete events are
            // decoded (the \n\n delimiter is ASCII and never lands inside
            // a character).
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| LLMError::Connection(e.to_string()))?;
                buffer.extend_from_slice(&chunk);

                // drain complete SSE events
                while let Some(boundary) = find_event_boundary(&buffer) {
                    let event_bytes: Vec<u8> = buffer.drain(..boundary + 2).collect();
                    let event = String::from_utf8_lossy(&event_bytes);

                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let Ok(parsed) = serde_json::from_str::<WireStreamEvent>(data) else {
                            continue;
                        };
                        match parsed.event_type.as_str() {
                            "content_block_delta" => {
                                if let Some(delta) = parsed.delta {
                                    yield StreamChunk {
                                        content: delta.text,
                                        done: false,
                                    };
                                }
                            }
                            "message_stop" => {
                                yield StreamChunk {
                                    content: String::new(),
                                    done: true,
                                };
                            }
                            _ => {}
                        }
                    }
                }
            }
        })
    }

    async fn health_check(&self) -> Result<bool, LLMError> {
        let probe = [LLMMessage::user("ping")];
        self.generate(&probe).await.map(|_| true)
    }
}
