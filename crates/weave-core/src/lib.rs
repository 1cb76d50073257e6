//! # weave-core
//!
//! Core components of the Weave agent runtime:
//! - [`NodeRegistry`] - declarative catalog of callable capabilities
//! - [`Capability`] - the three-phase adapter contract nodes implement
//! - [`WorkflowTemplate`] - validated DAGs of step invocations
//! - [`WorkflowStore`] - persistent template library with similarity
//!   retrieval and success tracking
//! - [`PermissionManager`] - lifecycle of explicit user approvals
//! - [`Scratchpad`] - per-session key-value dataplane
//! - Session protocol types for the bidirectional turn stream
//!
//! The registry knows nothing of the executor; the designer reads both
//! read-only. All orchestration lives in `weave-orchestrator`.

pub mod capabilities;
pub mod capability;
pub mod config;
pub mod permission;
pub mod protocol;
pub mod registry;
pub mod scratchpad;
pub mod session;
pub mod store;
pub mod template;
pub mod types;

pub use capability::{
    Capability, CapabilityBindings, CapabilityError, NextAction, PreparedInputs, ResolvedInputs,
    RunContext, RunValue,
};
pub use config::RuntimeConfig;
pub use permission::{
    PermissionDecision, PermissionError, PermissionManager, PermissionRequest, PermissionState,
    PermissionTicket,
};
pub use protocol::{EndStatus, InboundMessage, OutboundMessage};
pub use registry::{
    NodeCategory, NodeDescriptor, NodeExample, NodeRegistry, PermissionTier, RegisteredNode,
    RegistryError,
};
pub use scratchpad::Scratchpad;
pub use session::{Session, SessionPhase};
pub use store::{Outcome, StoreError, StoreStats, WorkflowStore};
pub use template::{
    EdgeSpec, InputBinding, StepSpec, TemplateError, TemplateMetadata, WorkflowTemplate,
};
pub use types::{ErrorKind, QuestionId, RequestId, SessionId, TemplateId};
