//! Session runtime - One cooperative task per conversation.
//!
//! The runtime owns the session state and demultiplexes inbound frames:
//! `chat` starts a design→execute→optimize cycle when the session is free
//! (and queues otherwise), replies are routed to their waiters, feedback
//! reaches the optimizer. Closing the transport, an explicit cancel, or the
//! soft deadline all trigger the same unwind: waiters resolve cancelled,
//! in-flight capability runs observe their cancellation token, no store
//! mutation happens, and a single `end { cancelled }` frame is emitted.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use weave_core::{
    InboundMessage, NodeRegistry, OutboundMessage, PermissionManager, RuntimeConfig, Session,
    SessionId, SessionPhase, TemplateId, WorkflowStore,
};
use weave_llm::LLMAdapter;

use crate::designer::DesignerStage;
use crate::executor::ExecutorStage;
use crate::interaction::InteractionRouter;
use crate::optimizer::{OptimizerStage, Verdict};

// ============================================================================
// HANDLE
// ============================================================================

/// Control handle held by the transport layer.
pub struct SessionHandle {
    id: SessionId,
    inbound: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Deliver an inbound frame. Returns false once the session is gone.
    pub async fn deliver(&self, message: InboundMessage) -> bool {
        self.inbound.send(message).await.is_ok()
    }

    /// Cancel the session (transport drop or explicit close).
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session task, including any in-flight cycle, to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

// ============================================================================
// RUNTIME
// ============================================================================

/// Chats that arrived while a cycle was in flight; each becomes a new
/// top-level turn once the session is free again.
struct ChatQueue {
    busy: bool,
    pending: VecDeque<String>,
}

/// Everything a session needs, shared across its loop and cycles.
pub struct SessionRuntime {
    id: SessionId,
    session: Mutex<Session>,
    registry: Arc<NodeRegistry>,
    store: Arc<WorkflowStore>,
    permissions: Arc<PermissionManager>,
    llm: Arc<dyn LLMAdapter>,
    router: InteractionRouter,
    cancel: CancellationToken,
    invocation_limit: Arc<Semaphore>,
    config: RuntimeConfig,
    chats: Mutex<ChatQueue>,
    cycle_task: Mutex<Option<JoinHandle<()>>>,
    /// Set once a cycle completes successfully; feedback frames attach here.
    last_completed: Mutex<Option<TemplateId>>,
}

enum CycleEnd {
    /// The cycle emitted its own `end` frame.
    Finished,
    /// Deadline hit or session cancelled while the cycle was in flight.
    Unwound,
}

impl SessionRuntime {
    /// Spawn a session task. `outbound` is the transport's ordered frame
    /// channel; the returned handle feeds the inbound direction.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: SessionId,
        user_id: impl Into<String>,
        registry: Arc<NodeRegistry>,
        store: Arc<WorkflowStore>,
        permissions: Arc<PermissionManager>,
        llm: Arc<dyn LLMAdapter>,
        invocation_limit: Arc<Semaphore>,
        config: RuntimeConfig,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> SessionHandle {
        let user_id = user_id.into();
        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(64);

        let runtime = Arc::new(Self {
            id: id.clone(),
            session: Mutex::new(Session::new(id.clone(), user_id)),
            registry,
            store,
            permissions,
            llm,
            router: InteractionRouter::new(outbound),
            cancel: cancel.clone(),
            invocation_limit,
            config,
            chats: Mutex::new(ChatQueue {
                busy: false,
                pending: VecDeque::new(),
            }),
            cycle_task: Mutex::new(None),
            last_completed: Mutex::new(None),
        });

        let task = tokio::spawn(runtime.run(inbound_rx));
        SessionHandle {
            id,
            inbound: inbound_tx,
            cancel,
            task,
        }
    }

    #[instrument(skip_all, fields(session_id = %self.id))]
    async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        info!("session started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    None => break, // transport dropped
                    Some(message) => self.dispatch(message).await,
                },
            }
        }
        self.shutdown().await;
        info!("session closed");
    }

    async fn dispatch(self: &Arc<Self>, message: InboundMessage) {
        match message {
            InboundMessage::Chat(content) => {
                let mut chats = self.chats.lock().await;
                if chats.busy {
                    debug!("cycle in flight; queueing chat as a new top-level turn");
                    chats.pending.push_back(content);
                } else {
                    chats.busy = true;
                    drop(chats);
                    let task = tokio::spawn(self.clone().run_cycles(content));
                    *self.cycle_task.lock().await = Some(task);
                }
            }
            InboundMessage::UserResponse {
                question_id,
                content,
            } => {
                self.router.route_user_response(&question_id, content).await;
            }
            InboundMessage::PermissionResponse {
                request_id,
                granted,
                response,
            } => {
                if let Err(e) = self.permissions.respond(&request_id, granted, response).await {
                    warn!(request_id = %request_id, error = %e,
                          "dropping unrouted permission_response");
                }
            }
            InboundMessage::Feedback(content) => {
                let completed = self.last_completed.lock().await.clone();
                match completed {
                    Some(template_id) => {
                        let optimizer =
                            OptimizerStage::new(self.store.clone(), self.router.clone());
                        optimizer.absorb_feedback(&template_id, &content).await;
                    }
                    None => debug!("feedback received with no completed workflow; ignoring"),
                }
            }
        }
    }

    /// Run the given chat, then drain any chats queued in the meantime.
    /// The busy flag and the queue share one lock, so a chat is either seen
    /// by this drain or starts a fresh runner, never neither.
    async fn run_cycles(self: Arc<Self>, first: String) {
        let mut question = Some(first);
        while let Some(current) = question.take() {
            self.run_cycle(current).await;
            if self.cancel.is_cancelled() {
                break;
            }
            let mut chats = self.chats.lock().await;
            match chats.pending.pop_front() {
                Some(next) => question = Some(next),
                None => chats.busy = false,
            }
        }
    }

    /// One full design→execute→optimize turn, bounded by the session's
    /// soft deadline.
    #[instrument(skip(self, question), fields(session_id = %self.id))]
    async fn run_cycle(self: &Arc<Self>, question: String) {
        self.router.send(OutboundMessage::Start {}).await;
        {
            let mut session = self.session.lock().await;
            session.reset_cycle();
            session.set_phase(SessionPhase::Designing);
            session
                .scratchpad
                .insert("user_message", serde_json::Value::String(question.clone()));
            let user_id = session.user_id.clone();
            session
                .scratchpad
                .insert("user_id", serde_json::Value::String(user_id));
        }

        let cycle_cancel = self.cancel.child_token();
        let end = {
            let inner = tokio::time::timeout(
                self.config.session_deadline,
                self.cycle_inner(&question, &cycle_cancel),
            );
            tokio::pin!(inner);
            tokio::select! {
                biased;
                result = &mut inner => match result {
                    Ok(()) => CycleEnd::Finished,
                    Err(_) => {
                        warn!("session deadline elapsed; unwinding cycle");
                        CycleEnd::Unwound
                    }
                },
                _ = self.cancel.cancelled() => CycleEnd::Unwound,
            }
        };

        match end {
            CycleEnd::Finished => {
                self.session.lock().await.set_phase(SessionPhase::Idle);
            }
            CycleEnd::Unwound => {
                cycle_cancel.cancel();
                self.router.cancel_all().await;
                self.permissions.cancel_session(&self.id).await;
                self.router.send(OutboundMessage::end_cancelled()).await;
                self.session.lock().await.set_phase(SessionPhase::Terminal);
            }
        }
    }

    async fn cycle_inner(self: &Arc<Self>, question: &str, cycle_cancel: &CancellationToken) {
        let designer = DesignerStage::new(
            self.llm.clone(),
            self.registry.clone(),
            self.store.clone(),
            self.router.clone(),
        );
        let executor = ExecutorStage::new(
            self.registry.clone(),
            self.permissions.clone(),
            self.router.clone(),
            cycle_cancel.clone(),
            self.invocation_limit.clone(),
        );
        let optimizer = OptimizerStage::new(self.store.clone(), self.router.clone());

        let template = match designer.design(question, None).await {
            Ok(template) => template,
            Err(e) => {
                self.router
                    .send(OutboundMessage::end_failed(format!(
                        "I could not work out a plan for this request. {e}"
                    )))
                    .await;
                return;
            }
        };

        let report = self.execute_template(&executor, &template).await;
        self.session.lock().await.set_phase(SessionPhase::Optimizing);
        let success = report.is_success();

        match optimizer.review(&template, &report, true).await {
            Verdict::Done => {
                if success {
                    *self.last_completed.lock().await = Some(template.metadata.id.clone());
                }
            }
            Verdict::Redesign { diagnostic } => {
                self.session.lock().await.set_phase(SessionPhase::Designing);
                let redesigned = match designer.design(question, Some(&diagnostic)).await {
                    Ok(template) => template,
                    Err(e) => {
                        self.router
                            .send(OutboundMessage::end_failed(format!(
                                "The workflow failed and a redesign did not validate. {e}"
                            )))
                            .await;
                        return;
                    }
                };

                let report = self.execute_template(&executor, &redesigned).await;
                self.session.lock().await.set_phase(SessionPhase::Optimizing);
                let success = report.is_success();
                // second failure is terminal
                optimizer.review(&redesigned, &report, false).await;
                if success {
                    *self.last_completed.lock().await = Some(redesigned.metadata.id.clone());
                }
            }
        }
    }

    async fn execute_template(
        &self,
        executor: &ExecutorStage,
        template: &weave_core::WorkflowTemplate,
    ) -> crate::executor::ExecutionReport {
        self.router
            .send(OutboundMessage::WorkflowDesign {
                template: template.clone(),
            })
            .await;
        {
            let mut session = self.session.lock().await;
            session.current_template = Some(template.clone());
            session.set_phase(SessionPhase::Executing);
        }
        executor.execute(template, &self.session).await
    }

    /// Tear down on loop exit: resolve waiters, cancel pending permissions,
    /// and reap the in-flight cycle so its final frame is emitted before
    /// the transport lets go.
    async fn shutdown(self: &Arc<Self>) {
        self.cancel.cancel();
        self.router.cancel_all().await;
        self.permissions.cancel_session(&self.id).await;
        let task = self.cycle_task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.session.lock().await.set_phase(SessionPhase::Terminal);
    }
}
