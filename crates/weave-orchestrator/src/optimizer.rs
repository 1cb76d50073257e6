//! Optimizer stage - Post-execution diagnosis and learning.
//!
//! Every executor outcome lands here. Successes are recorded into the
//! store and summarized back to the user; failures are classified, and the
//! kinds that implicate the plan itself earn exactly one redesign pass
//! through the designer. User choices (denied permissions, cancellations)
//! never penalize the template.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use weave_core::registry::NodeCategory;
use weave_core::{Outcome, OutboundMessage, TemplateId, WorkflowStore, WorkflowTemplate};

use crate::error::ExecutionError;
use crate::executor::ExecutionReport;
use crate::interaction::InteractionRouter;

/// What the session loop should do next.
#[derive(Debug, PartialEq)]
pub enum Verdict {
    /// The cycle is over; an `end` frame has been emitted.
    Done,
    /// Invoke the designer once more with this diagnostic, then re-execute.
    Redesign { diagnostic: String },
}

/// Absorbs execution reports, updates the store, and closes out the turn.
pub struct OptimizerStage {
    store: Arc<WorkflowStore>,
    router: InteractionRouter,
}

impl OptimizerStage {
    pub fn new(store: Arc<WorkflowStore>, router: InteractionRouter) -> Self {
        Self { store, router }
    }

    /// Review one execution. `redesign_allowed` is false on the second pass
    /// so a repeat failure is terminal.
    #[instrument(skip(self, template, report), fields(template_id = %template.metadata.id))]
    pub async fn review(
        &self,
        template: &WorkflowTemplate,
        report: &ExecutionReport,
        redesign_allowed: bool,
    ) -> Verdict {
        match &report.error {
            None if report.sink_completed => {
                self.record(template, Outcome::Success).await;
                let summary = self.assemble_summary(report);
                self.router
                    .send(OutboundMessage::Chunk(summary.clone()))
                    .await;
                self.router.send(OutboundMessage::end_ok(summary)).await;
                Verdict::Done
            }
            None => {
                // every branch terminated before a sink; the plan routed
                // itself into a dead end
                self.record(template, Outcome::Failure).await;
                self.router
                    .send(OutboundMessage::end_failed(
                        "The workflow stopped before producing a final result.",
                    ))
                    .await;
                Verdict::Done
            }
            Some(error @ (ExecutionError::PermissionDenied { .. }
            | ExecutionError::PermissionExpired { .. })) => {
                // a declined approval is the user's call, not a plan defect
                self.record(template, Outcome::UserDeclined).await;
                info!(error = %error, "run halted by user decision");
                self.router
                    .send(OutboundMessage::end_failed(
                        "The required approval was not granted, so the remaining steps were \
                         skipped. Nothing was booked or charged.",
                    ))
                    .await;
                Verdict::Done
            }
            Some(ExecutionError::UserCancelled { .. } | ExecutionError::SessionCancelled) => {
                self.router.send(OutboundMessage::end_cancelled()).await;
                Verdict::Done
            }
            Some(error) => {
                if redesign_allowed && error.kind().is_redesignable() {
                    let diagnostic = self.compose_diagnostic(error, report);
                    info!(error = %error, "attempting one redesign");
                    return Verdict::Redesign { diagnostic };
                }
                self.record(template, Outcome::Failure).await;
                self.router
                    .send(OutboundMessage::end_failed(format!(
                        "The workflow could not be completed: {error}"
                    )))
                    .await;
                Verdict::Done
            }
        }
    }

    /// Append user feedback to an already-completed template.
    pub async fn absorb_feedback(&self, template_id: &TemplateId, feedback: &str) {
        if let Err(e) = self.store.append_feedback(template_id, feedback).await {
            warn!(template_id = %template_id, error = %e, "feedback not persisted");
        } else {
            info!(template_id = %template_id, "feedback recorded");
        }
    }

    /// Best-effort store update: save (coalescing) then record the outcome.
    /// Learning failures never abort the session.
    async fn record(&self, template: &WorkflowTemplate, outcome: Outcome) {
        if let Err(e) = self.store.save(template.clone()).await {
            warn!(template_id = %template.metadata.id, error = %e, "template save failed");
            return;
        }
        if let Err(e) = self.store.record_outcome(&template.metadata.id, outcome).await {
            warn!(template_id = %template.metadata.id, error = %e, "outcome not recorded");
        }
    }

    /// The user-facing reply: summaries from creation and analysis steps.
    fn assemble_summary(&self, report: &ExecutionReport) -> String {
        let pieces: Vec<&str> = report
            .steps
            .iter()
            .filter(|s| {
                matches!(s.category, NodeCategory::Creation | NodeCategory::Analysis)
            })
            .filter_map(|s| s.summary.as_deref())
            .collect();
        if pieces.is_empty() {
            "Workflow completed successfully.".to_string()
        } else {
            pieces.join(" ")
        }
    }

    fn compose_diagnostic(&self, error: &ExecutionError, report: &ExecutionReport) -> String {
        let completed: Vec<&str> = report
            .steps
            .iter()
            .map(|s| s.step_name.as_str())
            .collect();
        format!(
            "failure: {error}\ncompleted steps before the failure: [{}]",
            completed.join(", ")
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================
