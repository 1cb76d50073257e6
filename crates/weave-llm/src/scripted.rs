//! Scripted adapter for tests.
//!
//! Plays back a queue of canned responses and records every prompt it was
//! given, so orchestration tests can assert on both sides of the LLM
//! boundary without a network.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::LLMError;
use crate::traits::{
    ChunkStream, FinishReason, LLMAdapter, LLMMessage, LLMResponse, StreamChunk, TokenUsage,
};

/// One scripted turn: a canned completion or a canned failure.
pub enum ScriptedTurn {
    Respond(String),
    Fail(LLMError),
}

/// Deterministic adapter that replays a prepared script.
#[derive(Default)]
pub struct ScriptedAdapter {
    script: Mutex<VecDeque<ScriptedTurn>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a canned completion.
    pub fn push_response(&self, content: impl Into<String>) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedTurn::Respond(content.into()));
    }

    /// Queue a canned failure.
    pub fn push_error(&self, error: LLMError) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedTurn::Fail(error));
    }

    /// Prompts observed so far (the last user message of each call).
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Number of generate calls observed.
    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn record(&self, messages: &[LLMMessage]) {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::traits::Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().unwrap().push(prompt);
    }

    fn next_turn(&self) -> Result<String, LLMError> {
        match self.script.lock().unwrap().pop_front() {
            Some(ScriptedTurn::Respond(content)) => Ok(content),
            Some(ScriptedTurn::Fail(error)) => Err(error),
            None => Err(LLMError::EmptyResponse),
        }
    }
}

#[async_trait]
impl LLMAdapter for ScriptedAdapter {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-v0"
    }

    async fn generate(&self, messages: &[LLMMessage]) -> Result<LLMResponse, LLMError> {
        self.record(messages);
        let content = self.next_turn()?;
        Ok(LLMResponse {
            content,
            usage: TokenUsage::default(),
            finish_reason: FinishReason::Stop,
            model: self.model().to_string(),
        })
    }

    fn generate_stream<'a>(&'a self, messages: &'a [LLMMessage]) -> ChunkStream<'a> {
        self.record(messages);
        let turn = self.next_turn();
        Box::pin(async_stream::try_stream! {
            let content = turn?;
            // stream in small pieces so consumers exercise reassembly
            for piece in content.as_bytes().chunks(24) {
                yield StreamChunk {
                    content: String::from_utf8_lossy(piece).into_owned(),
                    done: false,
                };
            }
            yield StreamChunk { content: String::new(), done: true };
        })
    }
}
