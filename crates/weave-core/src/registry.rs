//! Node Registry - Declarative catalog of callable capabilities.
//!
//! The registry is loaded from a configuration document at startup and is
//! read-only afterwards: the executor and designer both consume it, it knows
//! nothing of either. `summarize_for_planner` is the single source of truth
//! handed to the designer's prompt.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::capability::{Capability, CapabilityBindings};

// ============================================================================
// CATEGORY AND TIER
// ============================================================================

/// Functional category of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    Search,
    Analysis,
    Communication,
    Booking,
    Payment,
    Transformation,
    Creation,
    Utility,
}

impl NodeCategory {
    pub const ALL: [NodeCategory; 8] = [
        NodeCategory::Search,
        NodeCategory::Analysis,
        NodeCategory::Communication,
        NodeCategory::Booking,
        NodeCategory::Payment,
        NodeCategory::Transformation,
        NodeCategory::Creation,
        NodeCategory::Utility,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeCategory::Search => "search",
            NodeCategory::Analysis => "analysis",
            NodeCategory::Communication => "communication",
            NodeCategory::Booking => "booking",
            NodeCategory::Payment => "payment",
            NodeCategory::Transformation => "transformation",
            NodeCategory::Creation => "creation",
            NodeCategory::Utility => "utility",
        }
    }

    /// Parse a configuration value. Unknown values are a descriptor fault,
    /// not a document fault, so the config loader reports them as
    /// `InvalidDescriptor` rather than failing inside deserialization.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == value)
    }
}

impl fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse sensitivity classification; governs whether a permission request
/// is issued before a node runs and what the prompt carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionTier {
    None,
    Basic,
    Sensitive,
    Critical,
}

impl PermissionTier {
    pub fn requires_prompt(self) -> bool {
        self != PermissionTier::None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PermissionTier::None => "none",
            PermissionTier::Basic => "basic",
            PermissionTier::Sensitive => "sensitive",
            PermissionTier::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            PermissionTier::None,
            PermissionTier::Basic,
            PermissionTier::Sensitive,
            PermissionTier::Critical,
        ]
        .into_iter()
        .find(|t| t.as_str() == value)
    }
}

impl fmt::Display for PermissionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// DESCRIPTOR
// ============================================================================

/// A worked example attached to a descriptor, used as few-shot material.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeExample {
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// An immutable registry record describing one callable capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique identifier, `[a-z][a-z0-9_]*`. Defaults to the config map
    /// key when omitted.
    #[serde(default)]
    pub name: String,
    /// Free text; prompt material for the designer.
    pub description: String,
    pub category: NodeCategory,
    pub permission_tier: PermissionTier,
    /// Declared input keys, drawn from the scratchpad.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Declared output keys, written into the scratchpad.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub examples: Vec<NodeExample>,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    #[serde(default)]
    pub estimated_time_seconds: Option<u64>,
    /// Capability binding id; resolved against [`CapabilityBindings`] at
    /// load time.
    pub invoke: String,
}

impl NodeDescriptor {
    fn name_is_valid(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate node name: {0}")]
    DuplicateName(String),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("invalid descriptor `{name}`: {reason}")]
    InvalidDescriptor { name: String, reason: String },

    #[error("capability binding `{invoke}` for node `{name}` cannot be bound")]
    UnboundCapability { name: String, invoke: String },

    #[error("registry config unreadable at {path}: {reason}")]
    ConfigUnreadable { path: String, reason: String },
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Entry pairing a descriptor with its bound capability.
#[derive(Clone)]
pub struct RegisteredNode {
    pub descriptor: NodeDescriptor,
    pub capability: Arc<dyn Capability>,
}

/// Read-only catalog of callable capabilities, keyed by node name.
///
/// Ordered map so `list_all` is deterministic (ascending by name).
#[derive(Default)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, RegisteredNode>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Shape of the registry configuration document: a top-level `nodes`
/// mapping of name → descriptor.
#[derive(Debug, Deserialize)]
struct RegistryConfig {
    nodes: BTreeMap<String, RawDescriptor>,
}

/// Descriptor as written in the document. `category` and
/// `permission_tier` stay raw strings here so an unrecognized value is
/// reported as `InvalidDescriptor` for the offending node rather than as
/// an unreadable document.
#[derive(Debug, Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "RawDescriptor::default_category")]
    category: String,
    #[serde(default = "RawDescriptor::default_tier")]
    permission_tier: String,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    examples: Vec<NodeExample>,
    #[serde(default)]
    estimated_cost: Option<f64>,
    #[serde(default)]
    estimated_time_seconds: Option<u64>,
    invoke: String,
}

impl RawDescriptor {
    fn default_category() -> String {
        "utility".to_string()
    }

    fn default_tier() -> String {
        "none".to_string()
    }

    /// Validate the enum-valued fields and produce a typed descriptor.
    fn into_descriptor(self, key: &str) -> Result<NodeDescriptor, RegistryError> {
        let name = if self.name.is_empty() {
            key.to_string()
        } else {
            self.name
        };
        let category = NodeCategory::parse(&self.category).ok_or_else(|| {
            RegistryError::InvalidDescriptor {
                name: name.clone(),
                reason: format!("unknown category `{}`", self.category),
            }
        })?;
        let permission_tier = PermissionTier::parse(&self.permission_tier).ok_or_else(|| {
            RegistryError::InvalidDescriptor {
                name: name.clone(),
                reason: format!("unknown permission tier `{}`", self.permission_tier),
            }
        })?;
        Ok(NodeDescriptor {
            name,
            description: self.description,
            category,
            permission_tier,
            inputs: self.inputs,
            outputs: self.outputs,
            examples: self.examples,
            estimated_cost: self.estimated_cost,
            estimated_time_seconds: self.estimated_time_seconds,
            invoke: self.invoke,
        })
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    /// Register a descriptor, binding its `invoke` target.
    ///
    /// Fails with `DuplicateName` when the name is taken, with
    /// `InvalidDescriptor` when the name or declared fields are malformed,
    /// and with `UnboundCapability` when the `invoke` id is unknown.
    pub fn register(
        &mut self,
        descriptor: NodeDescriptor,
        bindings: &CapabilityBindings,
    ) -> Result<(), RegistryError> {
        if !NodeDescriptor::name_is_valid(&descriptor.name) {
            return Err(RegistryError::InvalidDescriptor {
                name: descriptor.name.clone(),
                reason: "name must match [a-z][a-z0-9_]*".into(),
            });
        }
        if self.nodes.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }
        let capability = bindings.get(&descriptor.invoke).ok_or_else(|| {
            RegistryError::UnboundCapability {
                name: descriptor.name.clone(),
                invoke: descriptor.invoke.clone(),
            }
        })?;
        self.nodes.insert(
            descriptor.name.clone(),
            RegisteredNode {
                descriptor,
                capability,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&RegisteredNode, RegistryError> {
        self.nodes
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// All entries, ascending by name.
    pub fn list_all(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values().map(|n| &n.descriptor)
    }

    pub fn list_by_category(
        &self,
        category: NodeCategory,
    ) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes
            .values()
            .map(|n| &n.descriptor)
            .filter(move |d| d.category == category)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Bounded, LLM-consumable catalog listing. This is the single source
    /// of truth the designer sees.
    pub fn summarize_for_planner(&self) -> String {
        let mut out = String::from("AVAILABLE NODES:\n");
        for d in self.list_all() {
            out.push_str(&format!(
                "- {} [{}] (permission: {}): {}\n    inputs: [{}]  outputs: [{}]\n",
                d.name,
                d.category,
                d.permission_tier,
                d.description,
                d.inputs.join(", "),
                d.outputs.join(", "),
            ));
        }
        out
    }

    /// Load a registry from a JSON configuration document.
    ///
    /// Any malformed descriptor or unbindable `invoke` target fails the
    /// whole load; a partially-populated registry is never returned.
    pub fn from_config_file(
        path: impl AsRef<Path>,
        bindings: &CapabilityBindings,
    ) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| RegistryError::ConfigUnreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_config_str(&raw, bindings).map(|reg| {
            info!(path = %path.display(), nodes = reg.len(), "node registry loaded");
            reg
        })
    }

    pub fn from_config_str(
        raw: &str,
        bindings: &CapabilityBindings,
    ) -> Result<Self, RegistryError> {
        let config: RegistryConfig =
            serde_json::from_str(raw).map_err(|e| RegistryError::ConfigUnreadable {
                path: "<inline>".into(),
                reason: e.to_string(),
            })?;
        let mut registry = Self::new();
        for (name, raw_descriptor) in config.nodes {
            let descriptor = raw_descriptor.into_descriptor(&name)?;
            registry.register(descriptor, bindings)?;
        }
        Ok(registry)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityError, PreparedInputs, RunContext, RunValue};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Capability for Noop {
        async fn run(
            &self,
            _prepared: &PreparedInputs,
            _ctx: &RunContext,
        ) -> Result<RunValue, CapabilityError> {
            Ok(RunValue::data::<String>([]))
        }
    }

    fn bindings() -> CapabilityBindings {
        let mut b = CapabilityBindings::new();
        b.bind("noop", Arc::new(Noop));
        b
    }

    fn descriptor(name: &str) -> NodeDescriptor {
        NodeDescriptor {
            name: name.to_string(),
            description: "does nothing".into(),
            category: NodeCategory::Utility,
            permission_tier: PermissionTier::None,
            inputs: vec!["in".into()],
            outputs: vec!["out".into()],
            examples: vec![],
            estimated_cost: None,
            estimated_time_seconds: None,
            invoke: "noop".into(),
        }
    }

    #[test]
    fn test_register_and_get() {
        let mut reg = NodeRegistry::new();
        reg.register(descriptor("alpha"), &bindings()).unwrap();
        assert!(reg.get("alpha").is_ok());
        assert!(matches!(reg.get("beta"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut reg = NodeRegistry::new();
        let b = bindings();
        reg.register(descriptor("alpha"), &b).unwrap();
        let err = reg.register(descriptor("alpha"), &b).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(_)));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let mut reg = NodeRegistry::new();
        let err = reg.register(descriptor("Bad-Name"), &bindings()).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDescriptor { .. }));
    }

    #[test]
    fn test_unbound_capability_rejected() {
        let mut reg = NodeRegistry::new();
        let mut d = descriptor("alpha");
        d.invoke = "ghost".into();
        let err = reg.register(d, &bindings()).unwrap_err();
        assert!(matches!(err, RegistryError::UnboundCapability { .. }));
    }

    #[test]
    fn test_list_all_sorted_by_name() {
        let mut reg = NodeRegistry::new();
        let b = bindings();
        reg.register(descriptor("zeta"), &b).unwrap();
        reg.register(descriptor("alpha"), &b).unwrap();
        let names: Vec<_> = reg.list_all().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_config_unknown_category_fails_hard() {
        let raw = r#"{
            "nodes": {
                "web_search": {
                    "name": "web_search",
                    "description": "search",
                    "category": "telepathy",
                    "permission_tier": "none",
                    "invoke": "noop"
                }
            }
        }"#;
        let err = NodeRegistry::from_config_str(raw, &bindings()).unwrap_err();
        match err {
            RegistryError::InvalidDescriptor { name, reason } => {
                assert_eq!(name, "web_search");
                assert!(reason.contains("telepathy"));
            }
            other => panic!("expected InvalidDescriptor, got {other:?}"),
        }
    }

    #[test]
    fn test_config_unknown_tier_fails_hard() {
        let raw = r#"{
            "nodes": {
                "web_search": {
                    "name": "web_search",
                    "description": "search",
                    "category": "search",
                    "permission_tier": "extreme",
                    "invoke": "noop"
                }
            }
        }"#;
        let err = NodeRegistry::from_config_str(raw, &bindings()).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDescriptor { .. }));
    }

    #[test]
    fn test_config_round_trip() {
        let raw = r#"{
            "nodes": {
                "web_search": {
                    "name": "web_search",
                    "description": "Search the web for current information",
                    "category": "search",
                    "permission_tier": "none",
                    "inputs": ["query"],
                    "outputs": ["search_results"],
                    "invoke": "noop"
                }
            }
        }"#;
        let reg = NodeRegistry::from_config_str(raw, &bindings()).unwrap();
        let d = &reg.get("web_search").unwrap().descriptor;
        assert_eq!(d.category, NodeCategory::Search);
        assert_eq!(d.inputs, vec!["query"]);
        let summary = reg.summarize_for_planner();
        assert!(summary.contains("web_search"));
        assert!(summary.contains("search_results"));
    }
}
