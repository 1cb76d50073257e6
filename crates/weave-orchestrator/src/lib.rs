//! # weave-orchestrator
//!
//! The four orchestration stages of the Weave agent runtime and the
//! per-session loop that sequences them:
//!
//! - [`DesignerStage`] - LLM-backed planner producing validated templates
//! - [`ExecutorStage`] - interprets templates step by step, suspending at
//!   permission tickets, user questions, and retry backoff
//! - [`InteractionRouter`] - demultiplexes inbound replies to waiters
//! - [`OptimizerStage`] - post-execution diagnosis, learning, redesign
//! - [`SessionRuntime`] - one cooperative task per conversation
//!
//! Stages run sequentially within a session (design → execute → optimize);
//! multiple sessions run in parallel, one task each.

pub mod designer;
pub mod error;
pub mod executor;
pub mod interaction;
pub mod optimizer;
pub mod session;


pub use designer::DesignerStage;
pub use error::{DesignError, ExecutionError};
pub use executor::{ExecutionReport, ExecutorStage, RetryPolicy, StepResult};
pub use interaction::{InteractionRouter, ReplyOutcome};
pub use optimizer::{OptimizerStage, Verdict};
pub use session::{SessionHandle, SessionRuntime};
