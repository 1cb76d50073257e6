//! Permission Manager - Lifecycle of explicit user approvals.
//!
//! Sensitive operations (payments, bookings, external side effects) must be
//! granted by the user before the executor proceeds. Each request is a small
//! state machine:
//!
//! ```text
//!          respond(granted) → granted
//! pending  respond(denied)  → denied
//!          cancel()         → cancelled
//!          t > expires_at   → expired
//! ```
//!
//! All non-initial states are terminal. Duplicate pending requests in the
//! same session for the same `(operation, details)` are coalesced onto one
//! id so the user is asked once.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::PermissionTier;
use crate::types::{RequestId, SessionId};

/// Upper bound on how long any ticket may stay outstanding, regardless of
/// the request-level expiry.
const HARD_WAIT_CAP: Duration = Duration::from_secs(600);

/// Sweep cadence for expiring overdue requests.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// REQUEST
// ============================================================================

/// Terminal and non-terminal request states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Pending,
    Granted,
    Denied,
    Expired,
    Cancelled,
}

/// One permission request.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionRequest {
    pub id: RequestId,
    pub user_id: String,
    pub session_id: SessionId,
    /// Free-text operation identifier, e.g. `payment`, `booking`,
    /// `external_api`.
    pub operation: String,
    /// What the action would do: amount, recipient, scope.
    pub details: BTreeMap<String, Value>,
    pub tier: PermissionTier,
    pub state: PermissionState,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    /// Supplied by the user on grant/deny.
    pub reason: Option<String>,
}

/// Final verdict delivered to a waiting ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDecision {
    pub state: PermissionState,
    pub reason: Option<String>,
}

impl PermissionDecision {
    fn terminal(state: PermissionState, reason: Option<String>) -> Self {
        Self { state, reason }
    }

    pub fn granted(&self) -> bool {
        self.state == PermissionState::Granted
    }
}

/// Awaitable handle returned by [`PermissionManager::create`].
pub struct PermissionTicket {
    rx: oneshot::Receiver<PermissionDecision>,
}

impl PermissionTicket {
    /// Resolve with the final decision. A hard ten-minute cap applies on
    /// top of the request's own expiry; a dropped manager also reads as
    /// expired.
    pub async fn wait(self) -> PermissionDecision {
        match tokio::time::timeout(HARD_WAIT_CAP, self.rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) | Err(_) => {
                PermissionDecision::terminal(PermissionState::Expired, None)
            }
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum PermissionError {
    #[error("permission request not found: {0}")]
    NotFound(RequestId),

    #[error("permission request already decided: {0}")]
    AlreadyDecided(RequestId),
}

// ============================================================================
// MANAGER
// ============================================================================

struct PendingEntry {
    request: PermissionRequest,
    /// One sender per outstanding ticket; coalesced requests add theirs.
    waiters: Vec<oneshot::Sender<PermissionDecision>>,
}

impl PendingEntry {
    fn resolve(mut self, state: PermissionState, reason: Option<String>) -> PermissionRequest {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(PermissionDecision::terminal(state, reason.clone()));
        }
        self.request.state = state;
        self.request.decided_at = Some(Utc::now());
        self.request.reason = reason;
        self.request
    }
}

/// Creates, tracks, resolves, and expires permission requests.
pub struct PermissionManager {
    ttl: ChronoDuration,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    completed: Mutex<HashMap<RequestId, PermissionRequest>>,
}

impl PermissionManager {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            ttl: ChronoDuration::from_std(default_ttl)
                .unwrap_or_else(|_| ChronoDuration::seconds(300)),
            pending: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
        }
    }

    /// Open a request and obtain an awaitable ticket.
    ///
    /// A `pending` request in the same session matching `(operation,
    /// canonicalized details)` is reused: the caller gets the existing id
    /// and a ticket that resolves with the same decision.
    pub async fn create(
        &self,
        user_id: impl Into<String>,
        session_id: SessionId,
        operation: impl Into<String>,
        details: BTreeMap<String, Value>,
        tier: PermissionTier,
    ) -> (RequestId, PermissionTicket) {
        let operation = operation.into();
        let fingerprint = details_fingerprint(&operation, &details);

        let mut pending = self.pending.lock().await;
        for entry in pending.values_mut() {
            if entry.request.session_id == session_id
                && details_fingerprint(&entry.request.operation, &entry.request.details)
                    == fingerprint
            {
                debug!(id = %entry.request.id, operation = %entry.request.operation,
                       "coalescing duplicate permission request");
                let (tx, rx) = oneshot::channel();
                entry.waiters.push(tx);
                return (entry.request.id.clone(), PermissionTicket { rx });
            }
        }

        let id = RequestId::generate();
        let now = Utc::now();
        let request = PermissionRequest {
            id: id.clone(),
            user_id: user_id.into(),
            session_id,
            operation,
            details,
            tier,
            state: PermissionState::Pending,
            created_at: now,
            decided_at: None,
            expires_at: now + self.ttl,
            reason: None,
        };
        info!(id = %id, operation = %request.operation, tier = %tier, "permission request opened");

        let (tx, rx) = oneshot::channel();
        pending.insert(
            id.clone(),
            PendingEntry {
                request,
                waiters: vec![tx],
            },
        );
        (id, PermissionTicket { rx })
    }

    /// Record the user's decision.
    pub async fn respond(
        &self,
        id: &RequestId,
        granted: bool,
        reason: Option<String>,
    ) -> Result<(), PermissionError> {
        let entry = {
            let mut pending = self.pending.lock().await;
            pending.remove(id)
        };
        let Some(entry) = entry else {
            if self.completed.lock().await.contains_key(id) {
                return Err(PermissionError::AlreadyDecided(id.clone()));
            }
            return Err(PermissionError::NotFound(id.clone()));
        };

        let state = if granted {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        };
        info!(id = %id, state = ?state, "permission request decided");
        let request = entry.resolve(state, reason);
        self.completed.lock().await.insert(id.clone(), request);
        Ok(())
    }

    /// Cancel a pending request (no-op when already decided).
    pub async fn cancel(&self, id: &RequestId) {
        let entry = self.pending.lock().await.remove(id);
        if let Some(entry) = entry {
            debug!(id = %id, "permission request cancelled");
            let request = entry.resolve(PermissionState::Cancelled, None);
            self.completed.lock().await.insert(id.clone(), request);
        }
    }

    /// Cancel every pending request belonging to a session. Used when the
    /// session closes.
    pub async fn cancel_session(&self, session_id: &SessionId) {
        let drained: Vec<(RequestId, PendingEntry)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, e)| &e.request.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|e| (id, e)))
                .collect()
        };
        let mut completed = self.completed.lock().await;
        for (id, entry) in drained {
            let request = entry.resolve(PermissionState::Cancelled, None);
            completed.insert(id, request);
        }
    }

    /// Pending requests, optionally filtered by session.
    pub async fn list_pending(&self, session_id: Option<&SessionId>) -> Vec<PermissionRequest> {
        self.pending
            .lock()
            .await
            .values()
            .filter(|e| session_id.map_or(true, |s| &e.request.session_id == s))
            .map(|e| e.request.clone())
            .collect()
    }

    /// Look up a request in either map.
    pub async fn get(&self, id: &RequestId) -> Option<PermissionRequest> {
        if let Some(entry) = self.pending.lock().await.get(id) {
            return Some(entry.request.clone());
        }
        self.completed.lock().await.get(id).cloned()
    }

    /// Expire every pending request whose deadline has elapsed. Called by
    /// the sweeper; exposed for tests.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let drained: Vec<(RequestId, PendingEntry)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, e)| now > e.request.expires_at)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|e| (id, e)))
                .collect()
        };
        if drained.is_empty() {
            return;
        }
        let mut completed = self.completed.lock().await;
        for (id, entry) in drained {
            warn!(id = %id, operation = %entry.request.operation, "permission request expired");
            let request = entry.resolve(PermissionState::Expired, None);
            completed.insert(id, request);
        }
    }

    /// Spawn the background sweep loop (one-second cadence).
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                manager.sweep().await;
            }
        })
    }
}

/// Canonical identity of a request for coalescing. `details` is an ordered
/// map, so its serialized form is stable.
fn details_fingerprint(operation: &str, details: &BTreeMap<String, Value>) -> String {
    format!(
        "{operation}\u{1f}{}",
        serde_json::to_string(details).unwrap_or_default()
    )
}

// ============================================================================
// TESTS
// ============================================================================
