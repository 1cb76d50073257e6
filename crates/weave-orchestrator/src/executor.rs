//! Executor stage - Interprets a validated template step by step.
//!
//! The executor walks the step graph in topological order, dispatching each
//! enabled step through its capability's three-phase contract. It suspends
//! at exactly four points: permission tickets, user questions, capability
//! `run` calls, and retry backoff sleeps. Action labels returned by
//! `commit` select which outgoing edges enable the next steps; a label with
//! no matching edge and no `default` edge terminates that branch without
//! error.

use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use weave_core::capability::{CapabilityError, PreparedInputs, ResolvedInputs, RunContext, RunValue};
use weave_core::permission::PermissionState;
use weave_core::registry::{NodeCategory, PermissionTier, RegisteredNode};
use weave_core::template::{InputBinding, StepSpec};
use weave_core::{
    NodeRegistry, OutboundMessage, PermissionManager, Session, SessionPhase, WorkflowTemplate,
};

use crate::error::ExecutionError;
use crate::interaction::{InteractionRouter, ReplyOutcome};

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Exponential backoff for transient capability failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    /// Fractional jitter applied to each delay (0.2 = ±20 %).
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            factor: 2.0,
            jitter: 0.2,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    fn delay_after(&self, attempt: u32) -> Duration {
        let exact = self.base.as_secs_f64() * self.factor.powi(attempt.saturating_sub(1) as i32);
        let spread = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_secs_f64(exact * spread)
    }
}

// ============================================================================
// REPORT
// ============================================================================

/// Outcome of one executed step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_name: String,
    pub node_name: String,
    pub category: NodeCategory,
    pub summary: Option<String>,
    pub outputs: Value,
}

/// What the executor hands to the optimizer.
#[derive(Debug)]
pub struct ExecutionReport {
    pub steps: Vec<StepResult>,
    pub error: Option<ExecutionError>,
    /// Whether at least one sink step completed.
    pub sink_completed: bool,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.sink_completed
    }
}

// ============================================================================
// EXECUTOR STAGE
// ============================================================================

/// Dispatches template steps against the registry. Reads the registry,
/// writes the session scratchpad, talks to the interaction router and the
/// permission manager; the registry knows nothing of it.
pub struct ExecutorStage {
    registry: Arc<NodeRegistry>,
    permissions: Arc<PermissionManager>,
    router: InteractionRouter,
    cancel: CancellationToken,
    invocation_limit: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl ExecutorStage {
    pub fn new(
        registry: Arc<NodeRegistry>,
        permissions: Arc<PermissionManager>,
        router: InteractionRouter,
        cancel: CancellationToken,
        invocation_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            registry,
            permissions,
            router,
            cancel,
            invocation_limit,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Execute a validated template against the session's scratchpad.
    #[instrument(skip(self, template, session), fields(template_id = %template.metadata.id))]
    pub async fn execute(
        &self,
        template: &WorkflowTemplate,
        session: &Mutex<Session>,
    ) -> ExecutionReport {
        let mut report = ExecutionReport {
            steps: Vec::new(),
            error: None,
            sink_completed: false,
        };

        let order = match template.topological_order() {
            Ok(order) => order,
            Err(e) => {
                report.error = Some(ExecutionError::InvalidInput {
                    step: String::new(),
                    message: e.to_string(),
                });
                return report;
            }
        };
        let total = template.steps.len();

        let mut enabled: HashSet<String> = template
            .entry_steps()
            .iter()
            .map(|s| s.step_name.clone())
            .collect();

        for (position, &index) in order.iter().enumerate() {
            let step = &template.steps[index];
            if !enabled.contains(&step.step_name) {
                debug!(step = %step.step_name, "step not enabled by any taken branch; skipping");
                continue;
            }
            if self.cancel.is_cancelled() {
                report.error = Some(ExecutionError::SessionCancelled);
                break;
            }

            session.lock().await.current_step_index = Some(index);

            match self.execute_step(step, position, total, session).await {
                Ok(result) => {
                    let action = result.action.clone();
                    report.steps.push(result.into_step_result());

                    let outgoing: Vec<_> = template.edges_from(&step.step_name).collect();
                    if outgoing.is_empty() {
                        report.sink_completed = true;
                        continue;
                    }
                    let matching: Vec<_> = outgoing
                        .iter()
                        .filter(|e| e.action == action)
                        .collect();
                    let chosen: Vec<_> = if matching.is_empty() {
                        outgoing.iter().filter(|e| e.action == "default").collect()
                    } else {
                        matching
                    };
                    if chosen.is_empty() {
                        debug!(step = %step.step_name, action = %action,
                               "no matching or default edge; branch terminates");
                        continue;
                    }
                    for edge in chosen {
                        enabled.insert(edge.to.clone());
                    }
                }
                Err(error) => {
                    self.emit_step_error(step, &error).await;
                    report.error = Some(error);
                    break;
                }
            }
        }

        session.lock().await.current_step_index = None;
        report
    }

    async fn emit_step_error(&self, step: &StepSpec, error: &ExecutionError) {
        // cancellation is reported once through the final `end` frame
        if matches!(
            error,
            ExecutionError::SessionCancelled | ExecutionError::UserCancelled { .. }
        ) {
            return;
        }
        self.router
            .send(OutboundMessage::NodeError {
                step_name: step.step_name.clone(),
                error_kind: error.kind(),
                message: error.to_string(),
            })
            .await;
    }

    async fn execute_step(
        &self,
        step: &StepSpec,
        position: usize,
        total: usize,
        session: &Mutex<Session>,
    ) -> Result<ExecutedStep, ExecutionError> {
        let node = self
            .registry
            .get(&step.node_name)
            .map_err(|e| ExecutionError::InvalidInput {
                step: step.step_name.clone(),
                message: e.to_string(),
            })?;

        let (resolved, prepared, user_id, session_id) = {
            let guard = session.lock().await;
            let resolved = resolve_bindings(step, node, &guard)?;
            let prepared = node
                .capability
                .prepare(&guard.scratchpad, &resolved)
                .map_err(|e| ExecutionError::InvalidInput {
                    step: step.step_name.clone(),
                    message: e.to_string(),
                })?;
            (resolved, prepared, guard.user_id.clone(), guard.id.clone())
        };

        // Permission gate: tiered nodes and template-flagged steps both
        // require explicit approval before any work happens.
        if node.descriptor.permission_tier.requires_prompt() || step.requires_permission {
            self.await_permission(step, node, &resolved, user_id, session_id, session)
                .await?;
        }

        // Communication nodes surface their question before the step's
        // progress frame; everything else reports progress first.
        let is_interaction = node.descriptor.category == NodeCategory::Communication;
        if !is_interaction {
            self.emit_progress(step, node, position, total).await;
        }

        let value = self.run_with_retry(step, node, &prepared).await?;

        let value = match value {
            RunValue::AwaitUser { question, fields } => {
                session.lock().await.set_phase(SessionPhase::AwaitingUser);
                let outcome = self.router.ask(question, fields).await;
                session.lock().await.set_phase(SessionPhase::Executing);
                match outcome {
                    ReplyOutcome::Answered(content) => {
                        substitute_reply(step, node, content)
                    }
                    ReplyOutcome::Cancelled => {
                        return Err(ExecutionError::UserCancelled {
                            step: step.step_name.clone(),
                        })
                    }
                }
            }
            value => value,
        };

        if is_interaction {
            self.emit_progress(step, node, position, total).await;
        }

        let action = {
            let mut guard = session.lock().await;
            node.capability
                .commit(&mut guard.scratchpad, &prepared, &value)
        };

        let summary = node.capability.summarize(&value);
        let outputs = match &value {
            RunValue::Data(map) => serde_json::to_value(map).unwrap_or(Value::Null),
            RunValue::AwaitUser { .. } => Value::Null,
        };
        self.router
            .send(OutboundMessage::NodeComplete {
                step_name: step.step_name.clone(),
                result: outputs.clone(),
            })
            .await;
        info!(step = %step.step_name, node = %step.node_name, "step completed");

        Ok(ExecutedStep {
            step_name: step.step_name.clone(),
            node_name: step.node_name.clone(),
            category: node.descriptor.category,
            summary,
            outputs,
            action: action.as_str().to_string(),
        })
    }

    async fn emit_progress(
        &self,
        step: &StepSpec,
        node: &RegisteredNode,
        position: usize,
        total: usize,
    ) {
        self.router
            .send(OutboundMessage::WorkflowProgress {
                step_index: position,
                total_steps: total,
                step_name: step.step_name.clone(),
                node_name: step.node_name.clone(),
                description: node.descriptor.description.clone(),
            })
            .await;
    }

    async fn await_permission(
        &self,
        step: &StepSpec,
        node: &RegisteredNode,
        resolved: &ResolvedInputs,
        user_id: String,
        session_id: weave_core::SessionId,
        session: &Mutex<Session>,
    ) -> Result<(), ExecutionError> {
        let operation = operation_for(node.descriptor.category);
        let tier = if node.descriptor.permission_tier.requires_prompt() {
            node.descriptor.permission_tier
        } else {
            PermissionTier::Basic
        };

        session
            .lock()
            .await
            .set_phase(SessionPhase::AwaitingPermission);

        let (request_id, ticket) = self
            .permissions
            .create(user_id, session_id, operation, resolved.clone(), tier)
            .await;
        let expires_at = self
            .permissions
            .get(&request_id)
            .await
            .map(|r| r.expires_at)
            .unwrap_or_else(chrono::Utc::now);

        self.router
            .send(OutboundMessage::PermissionRequest {
                request_id: request_id.clone(),
                operation: operation.to_string(),
                description: node.descriptor.description.clone(),
                reason: format!("Step `{}` needs your approval to proceed", step.step_name),
                tier,
                expires_at,
            })
            .await;

        let decision = tokio::select! {
            decision = ticket.wait() => decision,
            _ = self.cancel.cancelled() => {
                self.permissions.cancel(&request_id).await;
                return Err(ExecutionError::SessionCancelled);
            }
        };

        session.lock().await.set_phase(SessionPhase::Executing);

        match decision.state {
            PermissionState::Granted => Ok(()),
            PermissionState::Denied => Err(ExecutionError::PermissionDenied {
                step: step.step_name.clone(),
            }),
            PermissionState::Expired => Err(ExecutionError::PermissionExpired {
                step: step.step_name.clone(),
            }),
            PermissionState::Cancelled | PermissionState::Pending => {
                Err(ExecutionError::SessionCancelled)
            }
        }
    }

    /// Invoke `run`, retrying transient failures with exponential backoff
    /// and promoting them after the attempt budget is spent.
    async fn run_with_retry(
        &self,
        step: &StepSpec,
        node: &RegisteredNode,
        prepared: &PreparedInputs,
    ) -> Result<RunValue, ExecutionError> {
        let ctx = RunContext::new(self.cancel.child_token(), self.invocation_limit.clone());
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let permit = self
                .invocation_limit
                .acquire()
                .await
                .map_err(|_| ExecutionError::SessionCancelled)?;

            let result = tokio::select! {
                result = node.capability.run(prepared, &ctx) => result,
                _ = self.cancel.cancelled() => return Err(ExecutionError::SessionCancelled),
            };
            drop(permit);

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match error {
                CapabilityError::InvalidInput(message) => {
                    return Err(ExecutionError::InvalidInput {
                        step: step.step_name.clone(),
                        message,
                    })
                }
                CapabilityError::Failed(message) => {
                    return Err(ExecutionError::CapabilityFailed {
                        step: step.step_name.clone(),
                        message,
                    })
                }
                CapabilityError::Cancelled => return Err(ExecutionError::SessionCancelled),
                CapabilityError::Transient(message) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ExecutionError::CapabilityFailed {
                            step: step.step_name.clone(),
                            message: format!(
                                "still failing after {attempt} attempts: {message}"
                            ),
                        });
                    }
                    let delay = self.retry.delay_after(attempt);
                    warn!(step = %step.step_name, attempt, delay_ms = delay.as_millis() as u64,
                          error = %message, "transient failure; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return Err(ExecutionError::SessionCancelled)
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

struct ExecutedStep {
    step_name: String,
    node_name: String,
    category: NodeCategory,
    summary: Option<String>,
    outputs: Value,
    action: String,
}

impl ExecutedStep {
    fn into_step_result(self) -> StepResult {
        StepResult {
            step_name: self.step_name,
            node_name: self.node_name,
            category: self.category,
            summary: self.summary,
            outputs: self.outputs,
        }
    }
}

/// Free-text operation identifier for the permission prompt.
fn operation_for(category: NodeCategory) -> &'static str {
    match category {
        NodeCategory::Payment => "payment",
        NodeCategory::Booking => "booking",
        _ => "external_api",
    }
}

/// Resolve a step's bindings against the scratchpad. Declared inputs
/// without an explicit binding fall back to the same-named scratchpad key
/// when one exists.
fn resolve_bindings(
    step: &StepSpec,
    node: &RegisteredNode,
    session: &Session,
) -> Result<ResolvedInputs, ExecutionError> {
    let mut resolved = ResolvedInputs::new();
    for (input, binding) in &step.bound_inputs {
        let value = match binding {
            InputBinding::Literal(value) => value.clone(),
            InputBinding::Reference { from } => session
                .scratchpad
                .get(from)
                .cloned()
                .ok_or_else(|| ExecutionError::InvalidInput {
                    step: step.step_name.clone(),
                    message: format!("input `{input}` references missing key `{from}`"),
                })?,
        };
        resolved.insert(input.clone(), value);
    }
    for input in &node.descriptor.inputs {
        if !resolved.contains_key(input) {
            if let Some(value) = session.scratchpad.get(input) {
                resolved.insert(input.clone(), value.clone());
            }
        }
    }
    Ok(resolved)
}

/// Build the step's outputs from a user reply.
fn substitute_reply(step: &StepSpec, node: &RegisteredNode, content: Value) -> RunValue {
    let keys: Vec<String> = if !step.declared_outputs.is_empty() {
        step.declared_outputs.clone()
    } else if !node.descriptor.outputs.is_empty() {
        node.descriptor.outputs.clone()
    } else {
        vec!["user_response".to_string()]
    };
    let mut outputs = HashMap::new();
    for key in keys {
        outputs.insert(key, content.clone());
    }
    RunValue::Data(outputs)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;
    use tokio::sync::mpsc;
    use weave_core::capability::{Capability, CapabilityBindings};
    use weave_core::registry::NodeDescriptor;
    use weave_core::template::EdgeSpec;
    use weave_core::SessionId;

    struct Emit {
        key: &'static str,
        value: Value,
        action: &'static str,
    }

    #[async_trait]
    impl Capability for Emit {
        async fn run(
            &self,
            _prepared: &PreparedInputs,
            _ctx: &RunContext,
        ) -> Result<RunValue, CapabilityError> {
            Ok(RunValue::data([(self.key, self.value.clone())]))
        }

        fn commit(
            &self,
            scratchpad: &mut weave_core::Scratchpad,
            _prepared: &PreparedInputs,
            value: &RunValue,
        ) -> weave_core::NextAction {
            if let RunValue::Data(outputs) = value {
                for (k, v) in outputs {
                    scratchpad.insert(k.clone(), v.clone());
                }
            }
            weave_core::NextAction::new(self.action)
        }
    }

    struct Flaky {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Capability for Flaky {
        async fn run(
            &self,
            _prepared: &PreparedInputs,
            _ctx: &RunContext,
        ) -> Result<RunValue, CapabilityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(CapabilityError::Transient("upstream 503".into()))
            } else {
                Ok(RunValue::data([("out", json!("done"))]))
            }
        }
    }

    fn descriptor(name: &str, category: NodeCategory, tier: PermissionTier) -> NodeDescriptor {
        NodeDescriptor {
            name: name.to_string(),
            description: format!("test node {name}"),
            category,
            permission_tier: tier,
            inputs: vec![],
            outputs: vec!["out".into()],
            examples: vec![],
            estimated_cost: None,
            estimated_time_seconds: None,
            invoke: name.to_string(),
        }
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

    struct Harness {
        executor: ExecutorStage,
        outbound: mpsc::Receiver<OutboundMessage>,
        router: InteractionRouter,
        permissions: Arc<PermissionManager>,
        cancel: CancellationToken,
    }

    fn harness(registry: NodeRegistry) -> Harness {
        let (tx, rx) = mpsc::channel(64);
        let router = InteractionRouter::new(tx);
        let permissions = Arc::new(PermissionManager::new(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let executor = ExecutorStage::new(
            Arc::new(registry),
            permissions.clone(),
            router.clone(),
            cancel.clone(),
            Arc::new(Semaphore::new(8)),
        );
        Harness {
            executor,
            outbound: rx,
            router,
            permissions,
            cancel,
        }
    }

    fn session() -> Mutex<Session> {
        let mut s = Session::new(SessionId::new("s1"), "u1");
        s.scratchpad.insert("user_message", json!("test question"));
        Mutex::new(s)
    }

    fn template_of(
        steps: Vec<StepSpec>,
        connections: Vec<EdgeSpec>,
        registry: &NodeRegistry,
    ) -> WorkflowTemplate {
        WorkflowTemplate::assemble(
            "t", "test", "q", steps, connections, BTreeMap::new(), registry,
        )
    }

    #[tokio::test]
    async fn test_linear_execution_writes_scratchpad() {
        let mut bindings = CapabilityBindings::new();
        bindings.bind(
            "emit_a",
            Arc::new(Emit { key: "a", value: json!(1), action: "default" }),
        );
        bindings.bind(
            "emit_b",
            Arc::new(Emit { key: "b", value: json!(2), action: "default" }),
        );
        let mut registry = NodeRegistry::new();
        registry
            .register(descriptor("emit_a", NodeCategory::Utility, PermissionTier::None), &bindings)
            .unwrap();
        registry
            .register(descriptor("emit_b", NodeCategory::Utility, PermissionTier::None), &bindings)
            .unwrap();

        let template = template_of(
            vec![step("first", "emit_a", &["a"]), step("second", "emit_b", &["b"])],
            vec![EdgeSpec::new("first", "second")],
            &registry,
        );
        let mut h = harness(registry);
        let session = session();

        let report = h.executor.execute(&template, &session).await;
        assert!(report.is_success());
        assert_eq!(report.steps.len(), 2);

        let guard = session.lock().await;
        assert_eq!(guard.scratchpad.get("a"), Some(&json!(1)));
        assert_eq!(guard.scratchpad.get("b"), Some(&json!(2)));
        drop(guard);

        // progress then complete, per step, in order
        let mut kinds = Vec::new();
        while let Ok(frame) = h.outbound.try_recv() {
            kinds.push(match frame {
                OutboundMessage::WorkflowProgress { step_index, .. } => {
                    format!("progress:{step_index}")
                }
                OutboundMessage::NodeComplete { step_name, .. } => format!("complete:{step_name}"),
                other => format!("other:{other:?}"),
            });
        }
        assert_eq!(
            kinds,
            vec!["progress:0", "complete:first", "progress:1", "complete:second"]
        );
    }

    #[tokio::test]
    async fn test_action_label_selects_branch() {
        let mut bindings = CapabilityBindings::new();
        bindings.bind(
            "chooser",
            Arc::new(Emit { key: "choice", value: json!("yes"), action: "approved" }),
        );
        bindings.bind(
            "left",
            Arc::new(Emit { key: "left", value: json!(true), action: "default" }),
        );
        bindings.bind(
            "right",
            Arc::new(Emit { key: "right", value: json!(true), action: "default" }),
        );
        let mut registry = NodeRegistry::new();
        for name in ["chooser", "left", "right"] {
            registry
                .register(descriptor(name, NodeCategory::Utility, PermissionTier::None), &bindings)
                .unwrap();
        }

        let template = template_of(
            vec![
                step("decide", "chooser", &["choice"]),
                step("approved_path", "left", &["left"]),
                step("declined_path", "right", &["right"]),
            ],
            vec![
                EdgeSpec::new("decide", "approved_path").with_action("approved"),
                EdgeSpec::new("decide", "declined_path").with_action("declined"),
            ],
            &registry,
        );
        let mut h = harness(registry);
        let session = session();

        let report = h.executor.execute(&template, &session).await;
        assert!(report.is_success());
        let executed: Vec<_> = report.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(executed, vec!["decide", "approved_path"]);
        let guard = session.lock().await;
        assert!(guard.scratchpad.get("right").is_none());
        drop(h);
    }

    #[tokio::test]
    async fn test_unmatched_action_without_default_terminates_branch() {
        let mut bindings = CapabilityBindings::new();
        bindings.bind(
            "chooser",
            Arc::new(Emit { key: "c", value: json!(1), action: "sideways" }),
        );
        bindings.bind(
            "next",
            Arc::new(Emit { key: "n", value: json!(1), action: "default" }),
        );
        let mut registry = NodeRegistry::new();
        for name in ["chooser", "next"] {
            registry
                .register(descriptor(name, NodeCategory::Utility, PermissionTier::None), &bindings)
                .unwrap();
        }

        let template = template_of(
            vec![step("decide", "chooser", &["c"]), step("after", "next", &["n"])],
            vec![EdgeSpec::new("decide", "after").with_action("approved")],
            &registry,
        );
        let mut h = harness(registry);
        let session = session();

        let report = h.executor.execute(&template, &session).await;
        // branch ends quietly; nothing reached a sink, but nothing errored
        assert!(report.error.is_none());
        assert!(!report.sink_completed);
        assert_eq!(report.steps.len(), 1);
        drop(h);
    }

    #[tokio::test]
    async fn test_transient_retry_three_attempts() {
        let flaky = Arc::new(Flaky {
            failures_before_success: 2,
            calls: AtomicU32::new(0),
        });
        let mut bindings = CapabilityBindings::new();
        bindings.bind("flaky", flaky.clone());
        let mut registry = NodeRegistry::new();
        registry
            .register(descriptor("flaky", NodeCategory::Utility, PermissionTier::None), &bindings)
            .unwrap();

        let template = template_of(vec![step("only", "flaky", &["out"])], vec![], &registry);
        let mut h = harness(registry);
        let session = session();

        let started = Instant::now();
        let report = h.executor.execute(&template, &session).await;
        let elapsed = started.elapsed();

        assert!(report.is_success());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        // two sleeps: 250ms and 500ms, each within ±20 %
        assert!(elapsed >= Duration::from_millis(600), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1100), "elapsed {elapsed:?}");

        let mut completes = 0;
        let mut errors = 0;
        while let Ok(frame) = h.outbound.try_recv() {
            match frame {
                OutboundMessage::NodeComplete { .. } => completes += 1,
                OutboundMessage::NodeError { .. } => errors += 1,
                _ => {}
            }
        }
        assert_eq!(completes, 1);
        assert_eq!(errors, 0);
    }

    #[tokio::test]
    async fn test_transient_promoted_to_failed() {
        let flaky = Arc::new(Flaky {
            failures_before_success: 10,
            calls: AtomicU32::new(0),
        });
        let mut bindings = CapabilityBindings::new();
        bindings.bind("flaky", flaky.clone());
        let mut registry = NodeRegistry::new();
        registry
            .register(descriptor("flaky", NodeCategory::Utility, PermissionTier::None), &bindings)
            .unwrap();

        let template = template_of(vec![step("only", "flaky", &["out"])], vec![], &registry);
        let mut h = harness(registry);
        let session = session();

        let report = h.executor.execute(&template, &session).await;
        assert!(matches!(
            report.error,
            Some(ExecutionError::CapabilityFailed { .. })
        ));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

        let mut saw_error = false;
        while let Ok(frame) = h.outbound.try_recv() {
            if let OutboundMessage::NodeError { error_kind, .. } = frame {
                assert_eq!(error_kind, weave_core::ErrorKind::CapabilityFailed);
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_permission_denied_halts() {
        let mut bindings = CapabilityBindings::new();
        bindings.bind(
            "book",
            Arc::new(Emit { key: "confirmation", value: json!("BK"), action: "default" }),
        );
        let mut registry = NodeRegistry::new();
        registry
            .register(
                descriptor("book", NodeCategory::Booking, PermissionTier::Sensitive),
                &bindings,
            )
            .unwrap();

        let template = template_of(
            vec![step("flight_booking", "book", &["confirmation"])],
            vec![],
            &registry,
        );
        let mut h = harness(registry);
        let session = session();

        let permissions = h.permissions.clone();
        let deny = tokio::spawn(async move {
            // wait until the request shows up, then deny it
            loop {
                let pending = permissions.list_pending(None).await;
                if let Some(request) = pending.first() {
                    permissions
                        .respond(&request.id, false, Some("too expensive".into()))
                        .await
                        .unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let report = h.executor.execute(&template, &session).await;
        deny.await.unwrap();

        assert!(matches!(
            report.error,
            Some(ExecutionError::PermissionDenied { .. })
        ));

        let mut saw_request = false;
        let mut saw_denied_error = false;
        while let Ok(frame) = h.outbound.try_recv() {
            match frame {
                OutboundMessage::PermissionRequest { operation, .. } => {
                    assert_eq!(operation, "booking");
                    saw_request = true;
                }
                OutboundMessage::NodeError { step_name, error_kind, .. } => {
                    assert_eq!(step_name, "flight_booking");
                    assert_eq!(error_kind, weave_core::ErrorKind::PermissionDenied);
                    saw_denied_error = true;
                }
                _ => {}
            }
        }
        assert!(saw_request);
        assert!(saw_denied_error);
    }

    #[tokio::test]
    async fn test_user_question_suspends_and_resumes() {
        let bindings = {
            let mut b = CapabilityBindings::new();
            b.bind("user_query", Arc::new(weave_core::capabilities::UserQuery));
            b
        };
        let mut registry = NodeRegistry::new();
        let mut d = descriptor("user_query", NodeCategory::Communication, PermissionTier::None);
        d.inputs = vec!["question".into()];
        d.outputs = vec!["user_response".into()];
        registry.register(d, &bindings).unwrap();

        let mut ask = step("clarify", "user_query", &["user_response"]);
        ask.bound_inputs.insert(
            "question".into(),
            InputBinding::Literal(json!("Which budget?")),
        );
        let template = template_of(vec![ask], vec![], &registry);

        let mut h = harness(registry);
        let session = session();

        let exec = h.executor.execute(&template, &session);
        tokio::pin!(exec);

        // drive execution until the question frame is emitted
        let question_id = loop {
            tokio::select! {
                _ = &mut exec => panic!("execution finished before question"),
                frame = h.outbound.recv() => {
                    if let Some(OutboundMessage::UserQuestion { question_id, question, .. }) = frame {
                        assert_eq!(question, "Which budget?");
                        break question_id;
                    }
                }
            }
        };
        h.router
            .route_user_response(&question_id, json!("under $900"))
            .await;

        let report = exec.await;
        assert!(report.is_success());
        let guard = session.lock().await;
        assert_eq!(guard.scratchpad.get("user_response"), Some(&json!("under $900")));
    }

    #[tokio::test]
    async fn test_cancellation_unwinds() {
        let mut bindings = CapabilityBindings::new();
        bindings.bind("user_query", Arc::new(weave_core::capabilities::UserQuery));
        let mut registry = NodeRegistry::new();
        registry
            .register(
                descriptor("user_query", NodeCategory::Communication, PermissionTier::None),
                &bindings,
            )
            .unwrap();

        let template = template_of(
            vec![step("clarify", "user_query", &["user_response"])],
            vec![],
            &registry,
        );
        let h = harness(registry);
        let session = session();
        let router = h.router.clone();
        let cancel = h.cancel.clone();

        let canceller = tokio::spawn(async move {
            loop {
                if router.has_pending().await {
                    router.cancel_all().await;
                    cancel.cancel();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let report = h.executor.execute(&template, &session).await;
        canceller.await.unwrap();
        assert!(matches!(
            report.error,
            Some(ExecutionError::UserCancelled { .. })
        ));
        assert!(!report.sink_completed);
    }
}
