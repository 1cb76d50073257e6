//! Runtime configuration, sourced from the environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide settings for the agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding persisted workflow templates.
    pub store_root: PathBuf,
    /// Default time-to-live of a permission request.
    pub permission_ttl: Duration,
    /// Soft deadline after which a session cycle is cancelled.
    pub session_deadline: Duration,
    /// Optional registry configuration document; the built-in catalog is
    /// used when absent.
    pub node_config_path: Option<PathBuf>,
    /// Process-wide bound on concurrent capability invocations.
    pub max_capability_concurrency: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("./workflows"),
            permission_ttl: Duration::from_secs(300),
            session_deadline: Duration::from_secs(900),
            node_config_path: None,
            max_capability_concurrency: 64,
        }
    }
}

impl RuntimeConfig {
    /// Build from the environment, falling back to defaults field-wise.
    ///
    /// `LLM_API_KEY` is deliberately not read here; the server binary owns
    /// provider credentials.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_root: std::env::var("STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_root),
            permission_ttl: env_secs("PERMISSION_DEFAULT_TTL_SECONDS")
                .unwrap_or(defaults.permission_ttl),
            session_deadline: env_secs("SESSION_DEADLINE_SECONDS")
                .unwrap_or(defaults.session_deadline),
            node_config_path: std::env::var("NODE_CONFIG_PATH").ok().map(PathBuf::from),
            max_capability_concurrency: std::env::var("MAX_CAPABILITY_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_capability_concurrency),
        }
    }

    pub fn with_store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.store_root = root.into();
        self
    }

    pub fn with_session_deadline(mut self, deadline: Duration) -> Self {
        self.session_deadline = deadline;
        self
    }

    pub fn with_permission_ttl(mut self, ttl: Duration) -> Self {
        self.permission_ttl = ttl;
        self
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
