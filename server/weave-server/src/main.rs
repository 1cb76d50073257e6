//! Weave agent runtime server.
//!
//! Wires the environment into a running system: capability bindings →
//! node registry → workflow store → permission manager → LLM adapter →
//! WebSocket router.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use weave_core::capabilities::{builtin_bindings, builtin_registry};
use weave_core::{NodeRegistry, PermissionManager, RuntimeConfig, WorkflowStore};
use weave_llm::AnthropicAdapter;
use weave_server::{create_router, AppState};

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting weave-server v{}", env!("CARGO_PKG_VERSION"));

    let config = RuntimeConfig::from_env();
    let api_key = std::env::var("LLM_API_KEY").context("LLM_API_KEY is required")?;
    let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

    // Registry: configuration document when given, built-in catalog
    // otherwise. Malformed descriptors abort startup.
    let bindings = builtin_bindings();
    let registry = match &config.node_config_path {
        Some(path) => NodeRegistry::from_config_file(path, &bindings)?,
        None => builtin_registry(&bindings)?,
    };
    let registry = Arc::new(registry);
    info!(nodes = registry.len(), "registry ready");

    let store = Arc::new(WorkflowStore::open(&config.store_root, registry.clone()).await?);

    let permissions = Arc::new(PermissionManager::new(config.permission_ttl));
    permissions.spawn_sweeper();

    let llm = Arc::new(AnthropicAdapter::new(api_key, model));

    let state = AppState::new(registry, store, permissions, llm, config);
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on http://{addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
