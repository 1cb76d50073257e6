//! Workflow templates - The unit produced by the designer and persisted by
//! the store.
//!
//! A template is a DAG of step invocations over registry nodes. Its id is a
//! content hash of the steps and connections, so identical plans coalesce
//! in the store regardless of how they were produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use thiserror::Error;

use crate::registry::{NodeCategory, NodeRegistry};
use crate::types::TemplateId;

// ============================================================================
// STEPS AND EDGES
// ============================================================================

/// How a step input is bound: inline literal or a reference to a scratchpad
/// key produced earlier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputBinding {
    Reference { from: String },
    Literal(Value),
}

/// One step of a template: a named invocation of a registry node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique within the template.
    pub step_name: String,
    /// Must resolve in the registry.
    pub node_name: String,
    /// Node input key → binding.
    #[serde(default)]
    pub bound_inputs: BTreeMap<String, InputBinding>,
    /// Scratchpad keys this step writes.
    #[serde(default)]
    pub declared_outputs: Vec<String>,
    /// Force a permission prompt even for tier-`none` nodes.
    #[serde(default)]
    pub requires_permission: bool,
}

/// A control-flow dependency between two steps. The executor follows the
/// edge whose `action` matches the label returned by the source step's
/// `commit`, falling back to `default`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default = "EdgeSpec::default_action")]
    pub action: String,
}

impl EdgeSpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            action: Self::default_action(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    fn default_action() -> String {
        "default".to_string()
    }
}

// ============================================================================
// METADATA
// ============================================================================

/// Stored statistics and provenance for a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub id: TemplateId,
    pub name: String,
    pub description: String,
    /// The original question this template was designed for.
    pub question_pattern: String,
    /// In [0, 1]; maintained by the store as an EMA of outcomes.
    pub success_rate: f64,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Derived from the categories of the nodes used.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form user feedback appended after completed runs.
    #[serde(default)]
    pub feedback: Vec<String>,
}

// ============================================================================
// TEMPLATE
// ============================================================================

/// A complete workflow template, matching the on-disk document layout:
/// `{ metadata, nodes, connections, sharedStoreSchema }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub metadata: TemplateMetadata,
    #[serde(rename = "nodes")]
    pub steps: Vec<StepSpec>,
    pub connections: Vec<EdgeSpec>,
    /// Declared scratchpad keys the template reads/writes; informational.
    #[serde(rename = "sharedStoreSchema", default)]
    pub shared_store_schema: BTreeMap<String, String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("template has no steps")]
    Empty,

    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("edge references unknown step: {0}")]
    UnknownStep(String),

    #[error("step graph contains a cycle")]
    Cyclic,

    #[error("step `{step}` input `{input}` references `{from}`, which no prior step produces")]
    UnresolvedInput {
        step: String,
        input: String,
        from: String,
    },
}

impl WorkflowTemplate {
    /// Compute the content-derived id for a set of steps and connections.
    ///
    /// serde_json's default map ordering keeps the serialized form
    /// canonical, so structurally identical plans hash identically.
    pub fn content_id(steps: &[StepSpec], connections: &[EdgeSpec]) -> TemplateId {
        let doc = serde_json::json!({
            "steps": steps,
            "connections": connections,
        });
        let digest = md5::compute(doc.to_string().as_bytes());
        TemplateId::new(format!("{digest:x}")[..12].to_string())
    }

    /// Assemble a fresh template from designer output.
    pub fn assemble(
        name: impl Into<String>,
        description: impl Into<String>,
        question: impl Into<String>,
        steps: Vec<StepSpec>,
        connections: Vec<EdgeSpec>,
        shared_store_schema: BTreeMap<String, String>,
        registry: &NodeRegistry,
    ) -> Self {
        let now = Utc::now();
        let id = Self::content_id(&steps, &connections);
        let tags = derive_tags(&steps, registry);
        Self {
            metadata: TemplateMetadata {
                id,
                name: name.into(),
                description: description.into(),
                question_pattern: question.into(),
                success_rate: 0.0,
                usage_count: 0,
                created_at: now,
                last_used_at: now,
                tags,
                feedback: Vec::new(),
            },
            steps,
            connections,
            shared_store_schema,
        }
    }

    pub fn id(&self) -> &TemplateId {
        &self.metadata.id
    }

    pub fn step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    /// Outgoing edges of a step.
    pub fn edges_from<'a, 'b>(&'a self, step_name: &'b str) -> impl Iterator<Item = &'a EdgeSpec> + use<'a, 'b> {
        self.connections.iter().filter(move |e| e.from == step_name)
    }

    /// Steps with no incoming edges; where execution begins.
    pub fn entry_steps(&self) -> Vec<&StepSpec> {
        let targets: HashSet<&str> = self.connections.iter().map(|e| e.to.as_str()).collect();
        self.steps
            .iter()
            .filter(|s| !targets.contains(s.step_name.as_str()))
            .collect()
    }

    /// Steps with no outgoing edges; completing one marks the run a success.
    pub fn sink_steps(&self) -> Vec<&StepSpec> {
        let sources: HashSet<&str> = self.connections.iter().map(|e| e.from.as_str()).collect();
        self.steps
            .iter()
            .filter(|s| !sources.contains(s.step_name.as_str()))
            .collect()
    }

    /// Topological order of step indices (Kahn), stable by declaration
    /// order among ready steps. Fails with `Cyclic` when no such order
    /// exists.
    pub fn topological_order(&self) -> Result<Vec<usize>, TemplateError> {
        let index_of: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_name.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.steps.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for edge in &self.connections {
            let from = *index_of
                .get(edge.from.as_str())
                .ok_or_else(|| TemplateError::UnknownStep(edge.from.clone()))?;
            let to = *index_of
                .get(edge.to.as_str())
                .ok_or_else(|| TemplateError::UnknownStep(edge.to.clone()))?;
            successors[from].push(to);
            in_degree[to] += 1;
        }

        let mut ready: VecDeque<usize> = (0..self.steps.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &next in &successors[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != self.steps.len() {
            return Err(TemplateError::Cyclic);
        }
        Ok(order)
    }

    /// Full structural validation: non-empty, unique step names, resolvable
    /// nodes, acyclic, and every input reference satisfiable by a prior
    /// step's declared output or an entry scratchpad key.
    pub fn validate(
        &self,
        registry: &NodeRegistry,
        entry_keys: &HashSet<String>,
    ) -> Result<(), TemplateError> {
        if self.steps.is_empty() {
            return Err(TemplateError::Empty);
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.step_name.as_str()) {
                return Err(TemplateError::DuplicateStep(step.step_name.clone()));
            }
            if !registry.contains(&step.node_name) {
                return Err(TemplateError::UnknownNode(step.node_name.clone()));
            }
        }

        let order = self.topological_order()?;

        let mut available: HashSet<String> = entry_keys.clone();
        for &i in &order {
            let step = &self.steps[i];
            for (input, binding) in &step.bound_inputs {
                if let InputBinding::Reference { from } = binding {
                    if !available.contains(from) {
                        return Err(TemplateError::UnresolvedInput {
                            step: step.step_name.clone(),
                            input: input.clone(),
                            from: from.clone(),
                        });
                    }
                }
            }
            for output in &step.declared_outputs {
                available.insert(output.clone());
            }
        }

        Ok(())
    }
}

/// Scratchpad keys present at template entry, before any step runs.
///
/// The session runtime seeds these when a cycle starts; input references
/// may target them in addition to prior step outputs.
pub fn default_entry_keys() -> HashSet<String> {
    ["user_message".to_string(), "user_id".to_string()]
        .into_iter()
        .collect()
}

/// Tags derived from the categories of the nodes a template uses.
fn derive_tags(steps: &[StepSpec], registry: &NodeRegistry) -> Vec<String> {
    let mut categories: Vec<NodeCategory> = Vec::new();
    for step in steps {
        if let Ok(node) = registry.get(&step.node_name) {
            if !categories.contains(&node.descriptor.category) {
                categories.push(node.descriptor.category);
            }
        }
    }
    categories.into_iter().map(|c| c.to_string()).collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        Capability, CapabilityBindings, CapabilityError, PreparedInputs, RunContext, RunValue,
    };
    use crate::registry::{NodeDescriptor, PermissionTier};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

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

    fn registry() -> NodeRegistry {
        let mut bindings = CapabilityBindings::new();
        bindings.bind("noop", Arc::new(Noop));
        let mut reg = NodeRegistry::new();
        for (name, category) in [
            ("web_search", NodeCategory::Search),
            ("result_summarizer", NodeCategory::Analysis),
        ] {
            reg.register(
                NodeDescriptor {
                    name: name.to_string(),
                    description: String::new(),
                    category,
                    permission_tier: PermissionTier::None,
                    inputs: vec![],
                    outputs: vec![],
                    examples: vec![],
                    estimated_cost: None,
                    estimated_time_seconds: None,
                    invoke: "noop".into(),
                },
                &bindings,
            )
            .unwrap();
        }
        reg
    }

    fn step(step_name: &str, node_name: &str, outputs: &[&str]) -> StepSpec {
        StepSpec {
            step_name: step_name.to_string(),
            node_name: node_name.to_string(),
            bound_inputs: BTreeMap::new(),
            declared_outputs: outputs.iter().map(|s| s.to_string()).collect(),
            requires_permission: false,
        }
    }

    fn entry_keys() -> HashSet<String> {
        ["user_message".to_string()].into_iter().collect()
    }

    #[test]
    fn test_content_id_is_stable_and_order_sensitive() {
        let steps = vec![step("a", "web_search", &["r"])];
        let edges = vec![];
        let id1 = WorkflowTemplate::content_id(&steps, &edges);
        let id2 = WorkflowTemplate::content_id(&steps, &edges);
        assert_eq!(id1, id2);
        assert_eq!(id1.as_str().len(), 12);

        let reordered = vec![step("b", "web_search", &["r"]), step("a", "web_search", &["r"])];
        assert_ne!(id1, WorkflowTemplate::content_id(&reordered, &edges));
    }

    #[test]
    fn test_empty_template_rejected() {
        let reg = registry();
        let t = WorkflowTemplate::assemble(
            "t", "", "q", vec![], vec![], BTreeMap::new(), &reg,
        );
        assert_eq!(t.validate(&reg, &entry_keys()), Err(TemplateError::Empty));
    }

    #[test]
    fn test_unknown_node_rejected() {
        let reg = registry();
        let t = WorkflowTemplate::assemble(
            "t",
            "",
            "q",
            vec![step("a", "hotel_search", &[])],
            vec![],
            BTreeMap::new(),
            &reg,
        );
        assert_eq!(
            t.validate(&reg, &entry_keys()),
            Err(TemplateError::UnknownNode("hotel_search".into()))
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let reg = registry();
        let t = WorkflowTemplate::assemble(
            "t",
            "",
            "q",
            vec![step("a", "web_search", &[]), step("b", "web_search", &[])],
            vec![EdgeSpec::new("a", "b"), EdgeSpec::new("b", "a")],
            BTreeMap::new(),
            &reg,
        );
        assert_eq!(t.validate(&reg, &entry_keys()), Err(TemplateError::Cyclic));
    }

    #[test]
    fn test_unresolved_reference_rejected() {
        let reg = registry();
        let mut s = step("a", "web_search", &[]);
        s.bound_inputs.insert(
            "query".into(),
            InputBinding::Reference {
                from: "never_written".into(),
            },
        );
        let t = WorkflowTemplate::assemble(
            "t", "", "q", vec![s], vec![], BTreeMap::new(), &reg,
        );
        assert!(matches!(
            t.validate(&reg, &entry_keys()),
            Err(TemplateError::UnresolvedInput { .. })
        ));
    }

    #[test]
    fn test_reference_to_prior_output_accepted() {
        let reg = registry();
        let a = step("search", "web_search", &["search_results"]);
        let mut b = step("summarize", "result_summarizer", &["summary"]);
        b.bound_inputs.insert(
            "results".into(),
            InputBinding::Reference {
                from: "search_results".into(),
            },
        );
        b.bound_inputs
            .insert("style".into(), InputBinding::Literal(json!("short")));
        let t = WorkflowTemplate::assemble(
            "t",
            "",
            "q",
            vec![a, b],
            vec![EdgeSpec::new("search", "summarize")],
            BTreeMap::new(),
            &reg,
        );
        assert!(t.validate(&reg, &entry_keys()).is_ok());
        assert_eq!(t.entry_steps().len(), 1);
        assert_eq!(t.sink_steps()[0].step_name, "summarize");
        assert_eq!(t.metadata.tags, vec!["search", "analysis"]);
    }

    #[test]
    fn test_binding_serde_shapes() {
        let reference: InputBinding = serde_json::from_value(json!({"from": "key"})).unwrap();
        assert_eq!(
            reference,
            InputBinding::Reference {
                from: "key".into()
            }
        );
        let literal: InputBinding = serde_json::from_value(json!("LAX")).unwrap();
        assert_eq!(literal, InputBinding::Literal(json!("LAX")));
    }

    #[test]
    fn test_disk_layout_keys() {
        let reg = registry();
        let t = WorkflowTemplate::assemble(
            "t",
            "",
            "q",
            vec![step("a", "web_search", &["r"])],
            vec![],
            BTreeMap::new(),
            &reg,
        );
        let doc = serde_json::to_value(&t).unwrap();
        assert!(doc.get("metadata").is_some());
        assert!(doc.get("nodes").is_some());
        assert!(doc.get("connections").is_some());
        assert!(doc.get("sharedStoreSchema").is_some());
    }
}
