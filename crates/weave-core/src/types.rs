//! Core identifier types shared across the runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Unique identifier for a session (one conversation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("sess-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique identifier for a stored workflow template.
///
/// Derived from a content hash of the template's steps and connections,
/// so identical plans share an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(String);

impl TemplateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TemplateId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique identifier for an outbound question awaiting a user reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuestionId(String);

impl QuestionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("q-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QuestionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique identifier for a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("perm-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ============================================================================
// ERROR KINDS
// ============================================================================

/// Classified error kinds surfaced on the session protocol.
///
/// These are the labels carried by `node_error` frames and consumed by the
/// optimizer when it decides whether a failed run warrants a redesign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidDescriptor,
    DesignFailed,
    InvalidInput,
    CapabilityTransient,
    CapabilityFailed,
    PermissionDenied,
    PermissionExpired,
    UserCancelled,
    SessionCancelled,
    StoreIO,
}

impl ErrorKind {
    /// Whether the failure reflects a user decision rather than a fault of
    /// the workflow itself.
    pub fn is_user_choice(self) -> bool {
        matches!(
            self,
            ErrorKind::PermissionDenied
                | ErrorKind::PermissionExpired
                | ErrorKind::UserCancelled
                | ErrorKind::SessionCancelled
        )
    }

    /// Whether the optimizer may attempt one redesign for this kind.
    pub fn is_redesignable(self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidInput | ErrorKind::CapabilityFailed | ErrorKind::DesignFailed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidDescriptor => "InvalidDescriptor",
            ErrorKind::DesignFailed => "DesignFailed",
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::CapabilityTransient => "CapabilityTransient",
            ErrorKind::CapabilityFailed => "CapabilityFailed",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::PermissionExpired => "PermissionExpired",
            ErrorKind::UserCancelled => "UserCancelled",
            ErrorKind::SessionCancelled => "SessionCancelled",
            ErrorKind::StoreIO => "StoreIO",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// TESTS
// ============================================================================
