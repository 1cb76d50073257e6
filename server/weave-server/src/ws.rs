//! WebSocket endpoint - One session per connection.
//!
//! Frames are `{ "type", "content" }` JSON on text messages. The write half
//! pumps the session's ordered outbound channel; the read half parses
//! inbound frames and feeds the session. Dropping the socket cancels the
//! session: waiters resolve cancelled and the cycle unwinds.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use weave_core::{InboundMessage, SessionId};
use weave_orchestrator::SessionRuntime;

use crate::state::AppState;

/// GET /api/v1/ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = SessionId::generate();
    info!(session_id = %session_id, "websocket session opened");

    let (mut write, mut read) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(256);

    // Authentication is outside this core; connections run as one
    // anonymous principal per socket.
    let handle = SessionRuntime::spawn(
        session_id.clone(),
        "anonymous",
        state.registry.clone(),
        state.store.clone(),
        state.permissions.clone(),
        state.llm.clone(),
        state.invocation_limit.clone(),
        state.config.clone(),
        outbound_tx,
    );

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "unserializable outbound frame dropped");
                    continue;
                }
            };
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<InboundMessage>(&text) {
                Ok(inbound) => {
                    if !handle.deliver(inbound).await {
                        break;
                    }
                }
                Err(e) => warn!(session_id = %session_id, error = %e, "unparseable frame dropped"),
            },
            Ok(Message::Close(_)) => {
                debug!(session_id = %session_id, "client closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "websocket read error");
                break;
            }
        }
    }

    handle.close();
    handle.join().await;
    writer.abort();
    info!(session_id = %session_id, "websocket session closed");
}
