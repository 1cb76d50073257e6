//! # weave-llm
//!
//! LLM provider adapters for the Weave agent runtime.
//!
//! The runtime contains LLM non-determinism at the designer boundary; this
//! crate only knows how to turn conversations into completions:
//! - [`AnthropicAdapter`] - Claude models over the Messages API
//! - [`ScriptedAdapter`] - deterministic playback for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use weave_llm::{AnthropicAdapter, LLMAdapter, LLMMessage};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = AnthropicAdapter::new("sk-...", "claude-sonnet-4-20250514");
//!     let reply = adapter.generate(&[LLMMessage::user("Hello!")]).await?;
//!     println!("{}", reply.content);
//!     Ok(())
//! }
//! ```

mod anthropic;
mod error;
mod scripted;
mod traits;

pub use anthropic::AnthropicAdapter;
pub use error::LLMError;
pub use scripted::{ScriptedAdapter, ScriptedTurn};
pub use traits::{
    ChunkStream, FinishReason, LLMAdapter, LLMMessage, LLMResponse, Role, StreamChunk, TokenUsage,
};
