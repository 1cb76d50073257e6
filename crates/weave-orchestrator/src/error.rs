//! Stage-level error types.

use thiserror::Error;

use weave_core::ErrorKind;

/// The designer could not produce a valid plan.
#[derive(Debug, Error)]
pub enum DesignError {
    /// Every attempt failed; carries the last validator or provider error.
    #[error("design failed after {attempts} attempts: {last_error}")]
    Failed { attempts: u32, last_error: String },
}

impl DesignError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::DesignFailed
    }
}

/// A workflow execution halted before completing its sinks.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("step `{step}` received invalid input: {message}")]
    InvalidInput { step: String, message: String },

    #[error("step `{step}` failed: {message}")]
    CapabilityFailed { step: String, message: String },

    #[error("permission denied for step `{step}`")]
    PermissionDenied { step: String },

    #[error("permission expired for step `{step}`")]
    PermissionExpired { step: String },

    #[error("user cancelled while step `{step}` awaited a reply")]
    UserCancelled { step: String },

    #[error("session cancelled")]
    SessionCancelled,
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::InvalidInput { .. } => ErrorKind::InvalidInput,
            ExecutionError::CapabilityFailed { .. } => ErrorKind::CapabilityFailed,
            ExecutionError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            ExecutionError::PermissionExpired { .. } => ErrorKind::PermissionExpired,
            ExecutionError::UserCancelled { .. } => ErrorKind::UserCancelled,
            ExecutionError::SessionCancelled => ErrorKind::SessionCancelled,
        }
    }

    /// The step at fault, when there is one.
    pub fn step(&self) -> Option<&str> {
        match self {
            ExecutionError::InvalidInput { step, .. }
            | ExecutionError::CapabilityFailed { step, .. }
            | ExecutionError::PermissionDenied { step }
            | ExecutionError::PermissionExpired { step }
            | ExecutionError::UserCancelled { step } => Some(step),
            ExecutionError::SessionCancelled => None,
        }
    }
}
