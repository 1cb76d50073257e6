//! Session state - One conversation, one scratchpad, one current template.

use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::scratchpad::Scratchpad;
use crate::template::WorkflowTemplate;
use crate::types::SessionId;

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Designing,
    Executing,
    AwaitingUser,
    AwaitingPermission,
    Optimizing,
    Terminal,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Designing => "designing",
            SessionPhase::Executing => "executing",
            SessionPhase::AwaitingUser => "awaiting_user",
            SessionPhase::AwaitingPermission => "awaiting_permission",
            SessionPhase::Optimizing => "optimizing",
            SessionPhase::Terminal => "terminal",
        };
        write!(f, "{s}")
    }
}

/// Mutable state of one conversation.
pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    pub scratchpad: Scratchpad,
    pub current_template: Option<WorkflowTemplate>,
    pub current_step_index: Option<usize>,
    phase: SessionPhase,
}

impl Session {
    pub fn new(id: SessionId, user_id: impl Into<String>) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            scratchpad: Scratchpad::new(),
            current_template: None,
            current_step_index: None,
            phase: SessionPhase::Idle,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            debug!(session_id = %self.id, from = %self.phase, to = %phase, "session phase change");
            self.phase = phase;
        }
    }

    /// Reset per-cycle state, keeping the conversation alive.
    pub fn reset_cycle(&mut self) {
        self.scratchpad = Scratchpad::new();
        self.current_template = None;
        self.current_step_index = None;
        self.phase = SessionPhase::Idle;
    }
}
