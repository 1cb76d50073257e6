//! Session protocol - Message framing for the bidirectional turn stream.
//!
//! Every frame is `{ "type": ..., "content": ... }` JSON, intended to ride
//! on WebSocket text frames. Outbound messages on a single session are
//! totally ordered in emission order; the transport adds no framing of its
//! own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::PermissionTier;
use crate::template::WorkflowTemplate;
use crate::types::{ErrorKind, QuestionId, RequestId};

// ============================================================================
// INBOUND
// ============================================================================

/// Messages the client sends into a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Initiates a new workflow cycle in an idle session.
    Chat(String),
    /// Reply to an outstanding `user_question`.
    #[serde(rename_all = "camelCase")]
    UserResponse {
        question_id: QuestionId,
        content: Value,
    },
    /// Decision on an outstanding `permission_request`.
    #[serde(rename_all = "camelCase")]
    PermissionResponse {
        request_id: RequestId,
        granted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<String>,
    },
    /// Out-of-band commentary on the most recent run.
    Feedback(String),
}

// ============================================================================
// OUTBOUND
// ============================================================================

/// Terminal status of a response turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndStatus {
    Ok,
    Failed,
    Cancelled,
}

/// Messages the session emits to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Beginning of a response turn.
    Start {},
    /// Streamed LLM output (designer or optimizer phases).
    Chunk(String),
    /// Emitted once a plan validates.
    WorkflowDesign { template: WorkflowTemplate },
    /// Emitted before each step runs.
    #[serde(rename_all = "camelCase")]
    WorkflowProgress {
        step_index: usize,
        total_steps: usize,
        step_name: String,
        node_name: String,
        description: String,
    },
    #[serde(rename_all = "camelCase")]
    NodeComplete { step_name: String, result: Value },
    #[serde(rename_all = "camelCase")]
    NodeError {
        step_name: String,
        error_kind: ErrorKind,
        message: String,
    },
    /// A node needs a user turn; answered by `user_response`.
    #[serde(rename_all = "camelCase")]
    UserQuestion {
        question_id: QuestionId,
        question: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        fields: Vec<String>,
    },
    /// A step needs explicit approval; answered by `permission_response`.
    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        request_id: RequestId,
        operation: String,
        description: String,
        reason: String,
        tier: PermissionTier,
        expires_at: DateTime<Utc>,
    },
    /// End of a response turn.
    End {
        status: EndStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

impl OutboundMessage {
    pub fn end_ok(summary: impl Into<String>) -> Self {
        OutboundMessage::End {
            status: EndStatus::Ok,
            summary: Some(summary.into()),
        }
    }

    pub fn end_failed(summary: impl Into<String>) -> Self {
        OutboundMessage::End {
            status: EndStatus::Failed,
            summary: Some(summary.into()),
        }
    }

    pub fn end_cancelled() -> Self {
        OutboundMessage::End {
            status: EndStatus::Cancelled,
            summary: None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_frame_shape() {
        let frame = serde_json::to_value(InboundMessage::Chat("book a flight".into())).unwrap();
        assert_eq!(frame, json!({"type": "chat", "content": "book a flight"}));
    }

    #[test]
    fn test_user_response_round_trip() {
        let raw = json!({
            "type": "user_response",
            "content": {"questionId": "q-1", "content": "morning departure"}
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        match msg {
            InboundMessage::UserResponse { question_id, content } => {
                assert_eq!(question_id.as_str(), "q-1");
                assert_eq!(content, json!("morning departure"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_permission_response_defaults() {
        let raw = json!({
            "type": "permission_response",
            "content": {"requestId": "perm-1", "granted": true}
        });
        let msg: InboundMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            msg,
            InboundMessage::PermissionResponse { granted: true, response: None, .. }
        ));
    }

    #[test]
    fn test_progress_frame_camel_case() {
        let frame = serde_json::to_value(OutboundMessage::WorkflowProgress {
            step_index: 0,
            total_steps: 6,
            step_name: "search".into(),
            node_name: "flight_search".into(),
            description: "search flights".into(),
        })
        .unwrap();
        assert_eq!(frame["type"], "workflow_progress");
        assert_eq!(frame["content"]["stepIndex"], 0);
        assert_eq!(frame["content"]["totalSteps"], 6);
        assert_eq!(frame["content"]["nodeName"], "flight_search");
    }

    #[test]
    fn test_end_frame_omits_empty_summary() {
        let frame = serde_json::to_value(OutboundMessage::end_cancelled()).unwrap();
        assert_eq!(frame, json!({"type": "end", "content": {"status": "cancelled"}}));
    }

    #[test]
    fn test_node_error_carries_kind() {
        let frame = serde_json::to_value(OutboundMessage::NodeError {
            step_name: "flight_booking".into(),
            error_kind: ErrorKind::PermissionDenied,
            message: "denied by user".into(),
        })
        .unwrap();
        assert_eq!(frame["content"]["errorKind"], "PermissionDenied");
    }
}
