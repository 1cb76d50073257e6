//! # weave-server
//!
//! axum transport for the Weave agent runtime: a health probe and the
//! WebSocket session endpoint.

mod state;
mod ws;

use axum::routing::get;
use axum::{Json, Router};

pub use state::AppState;

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/ws", get(ws::ws_handler))
        .with_state(state)
}

/// GET /health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
