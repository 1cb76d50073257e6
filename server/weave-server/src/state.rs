//! Shared application state.

use std::sync::Arc;
use tokio::sync::Semaphore;

use weave_core::{NodeRegistry, PermissionManager, RuntimeConfig, WorkflowStore};
use weave_llm::LLMAdapter;

/// Everything a session needs, shared across connections.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<NodeRegistry>,
    pub store: Arc<WorkflowStore>,
    pub permissions: Arc<PermissionManager>,
    pub llm: Arc<dyn LLMAdapter>,
    pub invocation_limit: Arc<Semaphore>,
    pub config: RuntimeConfig,
}

impl AppState {
    pub fn new(
        registry: Arc<NodeRegistry>,
        store: Arc<WorkflowStore>,
        permissions: Arc<PermissionManager>,
        llm: Arc<dyn LLMAdapter>,
        config: RuntimeConfig,
    ) -> Self {
        let invocation_limit = Arc::new(Semaphore::new(config.max_capability_concurrency));
        Self {
            registry,
            store,
            permissions,
            llm,
            invocation_limit,
            config,
        }
    }
}
