//! Designer stage - LLM-backed planner.
//!
//! Turns a user question into a validated [`WorkflowTemplate`], given the
//! registry catalog and up to three similar templates retrieved from the
//! store. The LLM's output is parsed strictly and validated; a failed
//! attempt retries with the validator's error appended to the prompt, three
//! attempts total. All LLM non-determinism stays behind this boundary:
//! downstream stages only ever see validated templates.

use futures::StreamExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use weave_core::template::{default_entry_keys, EdgeSpec, InputBinding, StepSpec};
use weave_core::{NodeRegistry, OutboundMessage, WorkflowStore, WorkflowTemplate};
use weave_llm::{LLMAdapter, LLMMessage};

use crate::error::DesignError;
use crate::interaction::InteractionRouter;

const MAX_ATTEMPTS: u32 = 3;
const SIMILAR_TEMPLATES: usize = 3;

const SYSTEM_PROMPT: &str = "You are a workflow designer agent. You design workflows \
as directed acyclic graphs of node invocations, using only nodes from the provided \
catalog. Reply with a single fenced ```json block and nothing else.";

// ============================================================================
// PLAN DOCUMENT
// ============================================================================

/// The schema the LLM is asked to emit.
#[derive(Debug, Deserialize)]
struct PlanDocument {
    workflow: PlanWorkflow,
}

#[derive(Debug, Deserialize)]
struct PlanWorkflow {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    steps: Vec<PlanStep>,
    #[serde(default)]
    connections: Vec<EdgeSpec>,
    #[serde(default)]
    shared_store_schema: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PlanStep {
    step: String,
    node: String,
    #[serde(default)]
    inputs: BTreeMap<String, InputBinding>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    requires_permission: bool,
}

impl PlanStep {
    fn into_spec(self) -> StepSpec {
        StepSpec {
            step_name: self.step,
            node_name: self.node,
            bound_inputs: self.inputs,
            declared_outputs: self.outputs,
            requires_permission: self.requires_permission,
        }
    }
}

// ============================================================================
// DESIGNER STAGE
// ============================================================================

/// Produces validated templates from questions.
pub struct DesignerStage {
    llm: Arc<dyn LLMAdapter>,
    registry: Arc<NodeRegistry>,
    store: Arc<WorkflowStore>,
    router: InteractionRouter,
}

impl DesignerStage {
    pub fn new(
        llm: Arc<dyn LLMAdapter>,
        registry: Arc<NodeRegistry>,
        store: Arc<WorkflowStore>,
        router: InteractionRouter,
    ) -> Self {
        Self {
            llm,
            registry,
            store,
            router,
        }
    }

    /// Design a workflow for `question`. An optional `diagnostic` from a
    /// previous failed run is appended to the prompt (the optimizer's
    /// redesign path).
    #[instrument(skip(self, question, diagnostic), fields(question_len = question.len()))]
    pub async fn design(
        &self,
        question: &str,
        diagnostic: Option<&str>,
    ) -> Result<WorkflowTemplate, DesignError> {
        let catalog = self.registry.summarize_for_planner();
        let similar = self.store.find_similar(question, SIMILAR_TEMPLATES).await;
        info!(similar = similar.len(), "designing workflow");

        let mut validator_feedback: Option<String> = None;
        for attempt in 1..=MAX_ATTEMPTS {
            let prompt = self.build_prompt(
                question,
                &catalog,
                &similar,
                diagnostic,
                validator_feedback.as_deref(),
            );
            info!(attempt, "designer invocation");

            let text = match self.stream_completion(&prompt).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(attempt, error = %e, "designer completion failed");
                    validator_feedback = Some(format!("provider error: {e}"));
                    continue;
                }
            };

            let plan = match parse_plan(&text) {
                Ok(plan) => plan,
                Err(message) => {
                    warn!(attempt, error = %message, "designer output rejected");
                    validator_feedback = Some(message);
                    continue;
                }
            };

            let workflow = plan.workflow;
            let template = WorkflowTemplate::assemble(
                workflow.name,
                workflow.description,
                question,
                workflow.steps.into_iter().map(PlanStep::into_spec).collect(),
                workflow.connections,
                workflow.shared_store_schema,
                &self.registry,
            );

            match template.validate(&self.registry, &default_entry_keys()) {
                Ok(()) => {
                    info!(template_id = %template.metadata.id, attempt, "plan validated");
                    return Ok(template);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "plan failed validation");
                    validator_feedback = Some(e.to_string());
                }
            }
        }

        Err(DesignError::Failed {
            attempts: MAX_ATTEMPTS,
            last_error: validator_feedback.unwrap_or_else(|| "no usable plan".into()),
        })
    }

    /// Stream the completion, forwarding chunks to the session as they
    /// arrive and returning the assembled text.
    async fn stream_completion(&self, prompt: &str) -> Result<String, weave_llm::LLMError> {
        let messages = [LLMMessage::system(SYSTEM_PROMPT), LLMMessage::user(prompt)];
        let mut stream = self.llm.generate_stream(&messages);
        let mut assembled = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if !chunk.content.is_empty() {
                self.router
                    .send(OutboundMessage::Chunk(chunk.content.clone()))
                    .await;
                assembled.push_str(&chunk.content);
            }
            if chunk.done {
                break;
            }
        }
        Ok(assembled)
    }

    fn build_prompt(
        &self,
        question: &str,
        catalog: &str,
        similar: &[(WorkflowTemplate, f64)],
        diagnostic: Option<&str>,
        validator_feedback: Option<&str>,
    ) -> String {
        let mut prompt = format!("USER QUESTION: {question}\n\n{catalog}\n");

        if !similar.is_empty() {
            prompt.push_str("\nSIMILAR PAST WORKFLOWS (for reference):\n");
            for (template, score) in similar {
                let nodes: Vec<&str> =
                    template.steps.iter().map(|s| s.node_name.as_str()).collect();
                prompt.push_str(&format!(
                    "- \"{}\" (score {score:.2}, success rate {:.2}): nodes [{}]\n",
                    template.metadata.question_pattern,
                    template.metadata.success_rate,
                    nodes.join(", "),
                ));
            }
        }

        if let Some(diagnostic) = diagnostic {
            prompt.push_str(&format!(
                "\nA PREVIOUS RUN OF THIS WORKFLOW FAILED:\n{diagnostic}\n\
                 Redesign the workflow to avoid this failure.\n"
            ));
        }
        if let Some(feedback) = validator_feedback {
            prompt.push_str(&format!(
                "\nYOUR PREVIOUS PLAN WAS REJECTED: {feedback}\nFix the plan.\n"
            ));
        }

        prompt.push_str(
            "\nDesign a workflow that answers the question. Consider what information must \
             be gathered, what analysis is required, which actions need user permission, and \
             how to present the result.\n\
             \n\
             Reply with exactly one fenced JSON block of this shape:\n\
             ```json\n\
             {\n\
               \"workflow\": {\n\
                 \"name\": \"<workflow name>\",\n\
                 \"description\": \"<brief description>\",\n\
                 \"steps\": [\n\
                   {\n\
                     \"step\": \"<unique step name>\",\n\
                     \"node\": \"<node name from the catalog>\",\n\
                     \"inputs\": {\"<input key>\": {\"from\": \"<scratchpad key>\"} or <literal>},\n\
                     \"outputs\": [\"<scratchpad key written>\"],\n\
                     \"requires_permission\": false\n\
                   }\n\
                 ],\n\
                 \"connections\": [\n\
                   {\"from\": \"<step>\", \"to\": \"<step>\", \"action\": \"default\"}\n\
                 ],\n\
                 \"shared_store_schema\": {\"<key>\": \"<description>\"}\n\
               }\n\
             }\n\
             ```\n\
             Use only nodes listed in the catalog. Input references may target a prior \
             step's outputs or the entry keys user_message and user_id.",
        );
        prompt
    }
}

// ============================================================================
// PARSING
// ============================================================================

/// Extract and strictly parse the plan document from the LLM's reply.
fn parse_plan(text: &str) -> Result<PlanDocument, String> {
    let json = extract_json(text).ok_or_else(|| "no JSON block found in reply".to_string())?;
    serde_json::from_str(json).map_err(|e| format!("plan does not match schema: {e}"))
}

/// Prefer a fenced ```json block; fall back to the outermost braces.
fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let body = &text[start + 7..];
        if let Some(end) = body.find("```") {
            return Some(body[..end].trim());
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use weave_core::capabilities::{builtin_bindings, builtin_registry};
    use weave_llm::ScriptedAdapter;

    fn plan_json(node: &str) -> String {
        json!({
            "workflow": {
                "name": "search and summarize",
                "description": "look something up",
                "steps": [
                    {
                        "step": "search",
                        "node": node,
                        "inputs": {"query": {"from": "user_message"}},
                        "outputs": ["search_results"],
                        "requires_permission": false
                    },
                    {
                        "step": "summarize",
                        "node": "result_summarizer",
                        "inputs": {"results": {"from": "search_results"}},
                        "outputs": ["summary"],
                        "requires_permission": false
                    }
                ],
                "connections": [
                    {"from": "search", "to": "summarize", "action": "default"}
                ],
                "shared_store_schema": {"summary": "final summary"}
            }
        })
        .to_string()
    }

    struct Fixture {
        designer: DesignerStage,
        llm: Arc<ScriptedAdapter>,
        outbound: mpsc::Receiver<OutboundMessage>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let bindings = builtin_bindings();
        let registry = Arc::new(builtin_registry(&bindings).unwrap());
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            weave_core::WorkflowStore::open(dir.path(), registry.clone())
                .await
                .unwrap(),
        );
        let (tx, rx) = mpsc::channel(256);
        let llm = Arc::new(ScriptedAdapter::new());
        let designer = DesignerStage::new(
            llm.clone(),
            registry,
            store,
            InteractionRouter::new(tx),
        );
        Fixture {
            designer,
            llm,
            outbound: rx,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_valid_plan_first_attempt() {
        let mut f = fixture().await;
        f.llm
            .push_response(format!("```json\n{}\n```", plan_json("web_search")));

        let template = f.designer.design("look up rust news", None).await.unwrap();
        assert_eq!(template.steps.len(), 2);
        assert_eq!(template.metadata.question_pattern, "look up rust news");
        assert_eq!(f.llm.call_count(), 1);

        // the reply was streamed out as chunks
        let mut streamed = String::new();
        while let Ok(frame) = f.outbound.try_recv() {
            if let OutboundMessage::Chunk(piece) = frame {
                streamed.push_str(&piece);
            }
        }
        assert!(streamed.contains("web_search"));
    }

    #[tokio::test]
    async fn test_unknown_node_retries_with_feedback() {
        let f = fixture().await;
        // first plan names a node the registry lacks, second one is fine
        f.llm
            .push_response(format!("```json\n{}\n```", plan_json("hotel_finder")));
        f.llm
            .push_response(format!("```json\n{}\n```", plan_json("web_search")));

        let template = f
            .designer
            .design("find a hotel in Tokyo", None)
            .await
            .unwrap();
        assert_eq!(f.llm.call_count(), 2);
        assert_eq!(template.steps[0].node_name, "web_search");

        // the retry prompt carried the validator's complaint
        let prompts = f.llm.prompts();
        assert!(prompts[1].contains("hotel_finder"));
        assert!(prompts[1].contains("REJECTED"));
    }

    #[tokio::test]
    async fn test_three_failures_is_design_failed() {
        let f = fixture().await;
        for _ in 0..3 {
            f.llm.push_response("I cannot design workflows today.");
        }
        let err = f.designer.design("anything", None).await.unwrap_err();
        assert!(matches!(err, DesignError::Failed { attempts: 3, .. }));
        assert_eq!(f.llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_identical_plans_share_id() {
        let f = fixture().await;
        f.llm
            .push_response(format!("```json\n{}\n```", plan_json("web_search")));
        f.llm
            .push_response(format!("```json\n{}\n```", plan_json("web_search")));

        let a = f.designer.design("q one", None).await.unwrap();
        let b = f.designer.design("q two", None).await.unwrap();
        assert_eq!(a.metadata.id, b.metadata.id);
    }

    #[tokio::test]
    async fn test_diagnostic_lands_in_prompt() {
        let f = fixture().await;
        f.llm
            .push_response(format!("```json\n{}\n```", plan_json("web_search")));
        f.designer
            .design("retry this", Some("step `pay` failed: card declined"))
            .await
            .unwrap();
        assert!(f.llm.prompts()[0].contains("card declined"));
    }

    #[test]
    fn test_extract_json_fence_preferred() {
        let text = "thinking... ```json\n{\"a\": 1}\n``` done";
        assert_eq!(extract_json(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_json_bare_braces() {
        let text = "here you go: {\"a\": 1} hope that helps";
        assert_eq!(extract_json(text), Some("{\"a\": 1}"));
    }
}
