//! Capability adapters - The uniform invocation façade over node
//! implementations.
//!
//! Every node the executor can dispatch goes through the same three-phase
//! contract:
//!
//! 1. `prepare` - pure projection of scratchpad + step bindings into the
//!    node's typed inputs
//! 2. `run` - the actual work; may perform I/O; must be idempotent on retry
//! 3. `commit` - writes declared outputs back into the scratchpad and
//!    returns the action label consumed by the edge selector
//!
//! # Example
//!
//! ```rust,ignore
//! use weave_core::capability::{Capability, RunContext, RunValue};
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl Capability for Echo {
//!     fn prepare(&self, pad: &Scratchpad, bindings: &ResolvedInputs)
//!         -> Result<PreparedInputs, CapabilityError> {
//!         Ok(bindings.clone())
//!     }
//!
//!     async fn run(&self, prepared: &PreparedInputs, ctx: &RunContext)
//!         -> Result<RunValue, CapabilityError> {
//!         Ok(RunValue::data([("echo", prepared.require("text")?.clone())]))
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::scratchpad::Scratchpad;

// ============================================================================
// INPUTS
// ============================================================================

/// Step bindings already resolved against the scratchpad: input key → value.
///
/// Ordered map so that serialized forms (permission details, logs) are
/// canonical.
pub type ResolvedInputs = BTreeMap<String, Value>;

/// The typed inputs a capability derived from its bindings in `prepare`.
#[derive(Debug, Clone, Default)]
pub struct PreparedInputs {
    values: BTreeMap<String, Value>,
}

impl PreparedInputs {
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    pub fn from_resolved(resolved: &ResolvedInputs) -> Self {
        Self {
            values: resolved.clone(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Fetch a required input, failing with `InvalidInput` when absent.
    pub fn require(&self, key: &str) -> Result<&Value, CapabilityError> {
        self.values
            .get(key)
            .ok_or_else(|| CapabilityError::InvalidInput(format!("missing input `{key}`")))
    }

    /// Fetch a required input as a string slice.
    pub fn require_str(&self, key: &str) -> Result<&str, CapabilityError> {
        self.require(key)?.as_str().ok_or_else(|| {
            CapabilityError::InvalidInput(format!("input `{key}` must be a string"))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

// ============================================================================
// RUN OUTPUT
// ============================================================================

/// What a capability's `run` produced.
#[derive(Debug, Clone)]
pub enum RunValue {
    /// Plain output values, keyed by the node's declared output names.
    Data(HashMap<String, Value>),
    /// The node needs a user turn before it can produce its outputs. The
    /// executor services this through the interaction stage and calls
    /// `commit` with the reply substituted in.
    AwaitUser {
        question: String,
        fields: Vec<String>,
    },
}

impl RunValue {
    pub fn data<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        RunValue::Data(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn await_user(question: impl Into<String>) -> Self {
        RunValue::AwaitUser {
            question: question.into(),
            fields: Vec::new(),
        }
    }
}

/// Action label returned by `commit`, consumed by the edge selector.
///
/// `default` is the unique fallback label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextAction(String);

impl NextAction {
    pub const DEFAULT: &'static str = "default";

    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn default_action() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NextAction {
    fn default() -> Self {
        Self::default_action()
    }
}

// ============================================================================
// RUN CONTEXT
// ============================================================================

/// Ambient resources handed to every `run` call.
#[derive(Clone)]
pub struct RunContext {
    /// Cancellation signal; resolves when the owning session is closed or
    /// its deadline elapses. Long-running capabilities must observe it.
    pub cancel: CancellationToken,
    /// Process-wide bound on concurrent capability invocations. CPU-bound
    /// work should run inside `spawn_blocking` while holding a permit.
    pub invocation_limit: Arc<Semaphore>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, invocation_limit: Arc<Semaphore>) -> Self {
        Self {
            cancel,
            invocation_limit,
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            cancel: CancellationToken::new(),
            invocation_limit: Arc::new(Semaphore::new(4)),
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Classified capability failure.
///
/// `Transient` failures are retried with backoff by the executor and
/// promoted to `Failed` after the attempt budget is spent; everything else
/// halts the step immediately.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("capability failed: {0}")]
    Failed(String),

    #[error("cancelled")]
    Cancelled,
}

impl CapabilityError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Transient(_))
    }
}

// ============================================================================
// CAPABILITY TRAIT
// ============================================================================

/// The three-phase contract every node implementation satisfies.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Project scratchpad + bindings into typed inputs. Pure; no I/O.
    fn prepare(
        &self,
        scratchpad: &Scratchpad,
        bindings: &ResolvedInputs,
    ) -> Result<PreparedInputs, CapabilityError> {
        let _ = scratchpad;
        Ok(PreparedInputs::from_resolved(bindings))
    }

    /// Do the work. Must be idempotent: the executor may call it again
    /// after a transient failure.
    async fn run(
        &self,
        prepared: &PreparedInputs,
        ctx: &RunContext,
    ) -> Result<RunValue, CapabilityError>;

    /// Write declared outputs into the scratchpad and pick the next action.
    fn commit(
        &self,
        scratchpad: &mut Scratchpad,
        prepared: &PreparedInputs,
        value: &RunValue,
    ) -> NextAction {
        let _ = prepared;
        if let RunValue::Data(outputs) = value {
            for (key, val) in outputs {
                scratchpad.insert(key.clone(), val.clone());
            }
        }
        NextAction::default_action()
    }

    /// One-line summary of a produced value, used for progress frames and
    /// the optimizer's final reply.
    fn summarize(&self, value: &RunValue) -> Option<String> {
        match value {
            RunValue::Data(outputs) => outputs
                .values()
                .next()
                .and_then(|v| v.as_str())
                .map(|s| s.chars().take(200).collect()),
            RunValue::AwaitUser { .. } => None,
        }
    }
}

// ============================================================================
// BINDINGS
// ============================================================================

/// Maps a registry entry's `invoke` id to a capability implementation.
///
/// Populated once at startup; the registry fails hard on an id it cannot
/// bind.
#[derive(Clone, Default)]
pub struct CapabilityBindings {
    entries: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityBindings {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn bind(&mut self, id: impl Into<String>, capability: Arc<dyn Capability>) {
        self.entries.insert(id.into(), capability);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Capability for Upper {
        async fn run(
            &self,
            prepared: &PreparedInputs,
            _ctx: &RunContext,
        ) -> Result<RunValue, CapabilityError> {
            let text = prepared.require_str("text")?;
            Ok(RunValue::data([("upper", json!(text.to_uppercase()))]))
        }
    }

    #[tokio::test]
    async fn test_default_prepare_and_commit() {
        let cap = Upper;
        let pad = Scratchpad::new();
        let mut bindings = ResolvedInputs::new();
        bindings.insert("text".into(), json!("hello"));

        let prepared = cap.prepare(&pad, &bindings).unwrap();
        let value = cap.run(&prepared, &RunContext::for_tests()).await.unwrap();

        let mut pad = Scratchpad::new();
        let action = cap.commit(&mut pad, &prepared, &value);
        assert_eq!(action.as_str(), "default");
        assert_eq!(pad.get("upper"), Some(&json!("HELLO")));
    }

    #[tokio::test]
    async fn test_missing_input_is_invalid() {
        let cap = Upper;
        let prepared = PreparedInputs::new();
        let err = cap
            .run(&prepared, &RunContext::for_tests())
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidInput(_)));
    }

    #[test]
    fn test_bindings_lookup() {
        let mut bindings = CapabilityBindings::new();
        bindings.bind("upper", Arc::new(Upper));
        assert!(bindings.contains("upper"));
        assert!(bindings.get("missing").is_none());
    }

    #[test]
    fn test_next_action_default() {
        assert_eq!(NextAction::default().as_str(), "default");
        assert_eq!(NextAction::new("approved").as_str(), "approved");
    }
}
