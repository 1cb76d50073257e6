//! Interaction stage - A thin demultiplexer between the session's turn
//! stream and the waiters inside a running workflow.
//!
//! Outgoing questions register their waiter *before* the frame leaves the
//! session, so a fast reply can never race past its waiter. Incoming
//! replies are routed by id; unrouted ones are dropped with a warning.
//! Closing the session resolves every outstanding waiter as cancelled.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use weave_core::{OutboundMessage, QuestionId};

/// How a question waiter resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Answered(Value),
    Cancelled,
}

/// Routes inbound replies to the exact waiter that asked for them, and
/// gives every stage one ordered path for outbound frames.
#[derive(Clone)]
pub struct InteractionRouter {
    outbound: mpsc::Sender<OutboundMessage>,
    waiters: Arc<Mutex<HashMap<QuestionId, oneshot::Sender<ReplyOutcome>>>>,
}

impl InteractionRouter {
    pub fn new(outbound: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            outbound,
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Emit a frame on the session's ordered outbound stream. A closed
    /// transport is not an error here; the session loop notices separately.
    pub async fn send(&self, message: OutboundMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!("outbound channel closed; frame dropped");
        }
    }

    /// Ask the user a question and wait for the reply.
    ///
    /// The waiter is registered under a fresh id while the waiter table
    /// lock is held, then the frame is emitted; nothing can route the
    /// reply before registration completes.
    pub async fn ask(&self, question: String, fields: Vec<String>) -> ReplyOutcome {
        let id = QuestionId::generate();
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().await;
            waiters.insert(id.clone(), tx);
        }
        self.send(OutboundMessage::UserQuestion {
            question_id: id.clone(),
            question,
            fields,
        })
        .await;

        match rx.await {
            Ok(outcome) => outcome,
            // sender dropped without resolving: the session went away
            Err(_) => ReplyOutcome::Cancelled,
        }
    }

    /// Route a `user_response` frame. Returns false (after a warning) when
    /// no waiter matches.
    pub async fn route_user_response(&self, question_id: &QuestionId, content: Value) -> bool {
        let waiter = self.waiters.lock().await.remove(question_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(ReplyOutcome::Answered(content));
                true
            }
            None => {
                warn!(question_id = %question_id, "dropping unrouted user_response");
                false
            }
        }
    }

    /// Resolve every outstanding waiter as cancelled. No orphan waiters
    /// remain afterwards.
    pub async fn cancel_all(&self) {
        let mut waiters = self.waiters.lock().await;
        for (id, tx) in waiters.drain() {
            debug!(question_id = %id, "cancelling outstanding question");
            let _ = tx.send(ReplyOutcome::Cancelled);
        }
    }

    /// Whether any question is currently awaiting a reply.
    pub async fn has_pending(&self) -> bool {
        !self.waiters.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router() -> (InteractionRouter, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (InteractionRouter::new(tx), rx)
    }

    #[tokio::test]
    async fn test_ask_emits_frame_then_resolves() {
        let (router, mut rx) = router();
        let asker = {
            let router = router.clone();
            tokio::spawn(async move { router.ask("Budget?".into(), vec![]).await })
        };

        let frame = rx.recv().await.unwrap();
        let OutboundMessage::UserQuestion { question_id, question, .. } = frame else {
            panic!("expected user_question frame");
        };
        assert_eq!(question, "Budget?");

        assert!(router.route_user_response(&question_id, json!("$900")).await);
        assert_eq!(asker.await.unwrap(), ReplyOutcome::Answered(json!("$900")));
        assert!(!router.has_pending().await);
    }

    #[tokio::test]
    async fn test_unrouted_response_dropped() {
        let (router, _rx) = router();
        let ghost = QuestionId::new("q-ghost");
        assert!(!router.route_user_response(&ghost, json!("?")).await);
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_waiters() {
        let (router, mut rx) = router();
        let asker = {
            let router = router.clone();
            tokio::spawn(async move { router.ask("Anyone there?".into(), vec![]).await })
        };
        let _ = rx.recv().await; // consume the question frame

        router.cancel_all().await;
        assert_eq!(asker.await.unwrap(), ReplyOutcome::Cancelled);
        assert!(!router.has_pending().await);
    }

    #[tokio::test]
    async fn test_reply_cannot_race_registration() {
        // the frame only becomes visible after the waiter is registered,
        // so replying immediately after receiving it must always route
        let (router, mut rx) = router();
        for _ in 0..32 {
            let asker = {
                let router = router.clone();
                tokio::spawn(async move { router.ask("q".into(), vec![]).await })
            };
            let OutboundMessage::UserQuestion { question_id, .. } = rx.recv().await.unwrap()
            else {
                panic!("expected user_question");
            };
            assert!(router.route_user_response(&question_id, json!(1)).await);
            assert!(matches!(asker.await.unwrap(), ReplyOutcome::Answered(_)));
        }
    }
}
