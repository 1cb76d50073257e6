//! Scratchpad - Per-session key-value state.
//!
//! The scratchpad is the dataplane between workflow steps: each step reads
//! its inputs from it and commits its declared outputs back. Keys are never
//! deleted within a run; overwriting an existing key is allowed and logged.

use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Session-scoped mapping from string keys to opaque JSON values.
///
/// Scratchpads are exclusive to their owning session; there is no
/// cross-session sharing.
#[derive(Debug, Clone, Default)]
pub struct Scratchpad {
    values: HashMap<String, Value>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Seed the scratchpad with initial entries (e.g. the user's question).
    pub fn with_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            values: entries.into_iter().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Write a value. Overwrites are permitted but noted, since a step
    /// clobbering another step's output is usually a design smell.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if self.values.contains_key(&key) {
            debug!(key = %key, "scratchpad key overwritten");
        }
        self.values.insert(key, value);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Snapshot the current state, e.g. for the optimizer's report.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.clone()
    }
}
