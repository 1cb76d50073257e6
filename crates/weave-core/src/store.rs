//! Workflow Store - Persistent template library with similarity retrieval.
//!
//! One JSON document per template at `<root>/<id>.json`. An in-memory index
//! fronts the directory; writers exclude readers for the span of a save.
//! Persistence is best-effort and off the hot path: a failed write is
//! logged, never propagated into a running session.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use chrono::Utc;

use crate::registry::NodeRegistry;
use crate::template::{TemplateError, WorkflowTemplate};
use crate::types::TemplateId;

// ============================================================================
// OUTCOME
// ============================================================================

/// Result of one template execution, as reported by the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// The user denied a permission or let it expire. Usage and recency are
    /// recorded but the success rate is left alone: a declined action is a
    /// user choice, not a template fault.
    UserDeclined,
}

/// Weight given to the newest outcome when folding it into the success rate.
const OUTCOME_EMA_WEIGHT: f64 = 0.3;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("template not found: {0}")]
    NotFound(TemplateId),

    #[error("template rejected: {0}")]
    Invalid(#[from] TemplateError),

    #[error("store io at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store document malformed at {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// STATS
// ============================================================================

/// Aggregate statistics over the stored templates.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub total_templates: usize,
    pub avg_success_rate: f64,
    pub templates_per_category: HashMap<String, usize>,
}

// ============================================================================
// STORE
// ============================================================================

/// Persistent, content-addressed template store.
pub struct WorkflowStore {
    root: PathBuf,
    registry: Arc<NodeRegistry>,
    index: RwLock<HashMap<TemplateId, WorkflowTemplate>>,
}

impl WorkflowStore {
    /// Open (and create if needed) a store rooted at `root`, loading every
    /// existing document. Corrupt documents are skipped with a warning.
    pub async fn open(
        root: impl Into<PathBuf>,
        registry: Arc<NodeRegistry>,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error(&root, e))?;

        let mut index = HashMap::new();
        let mut dir = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| io_error(&root, e))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(&root, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load_document(&path).await {
                Ok(template) => {
                    index.insert(template.metadata.id.clone(), template);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable template"),
            }
        }

        info!(root = %root.display(), templates = index.len(), "workflow store opened");
        Ok(Self {
            root,
            registry,
            index: RwLock::new(index),
        })
    }

    async fn load_document(path: &Path) -> Result<WorkflowTemplate, StoreError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| io_error(path, e))?;
        serde_json::from_str(&raw).map_err(|e| StoreError::Malformed {
            path: path.display().to_string(),
            source: e,
        })
    }

    fn document_path(&self, id: &TemplateId) -> PathBuf {
        self.root.join(format!("{}.json", id.as_str()))
    }

    /// Persist the in-memory entry for `id`. Failures are logged and
    /// swallowed: learning never blocks a session from responding.
    async fn persist(&self, template: &WorkflowTemplate) {
        let path = self.document_path(&template.metadata.id);
        let doc = match serde_json::to_string_pretty(template) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(id = %template.metadata.id, error = %e, "template serialization failed");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&path, doc).await {
            warn!(path = %path.display(), error = %e, "template write failed");
        }
    }

    /// Save a template. Structural validation runs again here so the store
    /// never accepts a cyclic or unresolvable document regardless of the
    /// producer. Identical ids coalesce; existing statistics are preserved.
    pub async fn save(&self, template: WorkflowTemplate) -> Result<TemplateId, StoreError> {
        template.validate(&self.registry, &crate::template::default_entry_keys())?;
        let id = template.metadata.id.clone();

        let mut index = self.index.write().await;
        if index.contains_key(&id) {
            debug!(id = %id, "template already stored; coalescing");
            return Ok(id);
        }
        index.insert(id.clone(), template.clone());
        drop(index);

        self.persist(&template).await;
        Ok(id)
    }

    pub async fn get(&self, id: &TemplateId) -> Option<WorkflowTemplate> {
        self.index.read().await.get(id).cloned()
    }

    pub async fn delete(&self, id: &TemplateId) -> Result<(), StoreError> {
        let removed = self.index.write().await.remove(id);
        if removed.is_none() {
            return Err(StoreError::NotFound(id.clone()));
        }
        let path = self.document_path(id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "template file removal failed");
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<WorkflowTemplate> {
        self.index.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    /// Fold one execution outcome into a template's statistics.
    ///
    /// The first recorded outcome sets the rate outright; later ones are
    /// folded in as an exponential moving average.
    pub async fn record_outcome(
        &self,
        id: &TemplateId,
        outcome: Outcome,
    ) -> Result<(), StoreError> {
        let mut index = self.index.write().await;
        let template = index
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let meta = &mut template.metadata;
        match outcome {
            Outcome::Success | Outcome::Failure => {
                let value = if outcome == Outcome::Success { 1.0 } else { 0.0 };
                meta.success_rate = if meta.usage_count == 0 {
                    value
                } else {
                    (1.0 - OUTCOME_EMA_WEIGHT) * meta.success_rate + OUTCOME_EMA_WEIGHT * value
                };
            }
            Outcome::UserDeclined => {}
        }
        meta.usage_count += 1;
        meta.last_used_at = Utc::now();

        let snapshot = template.clone();
        drop(index);
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Append user feedback to a stored template's metadata without
    /// touching its structure.
    pub async fn append_feedback(
        &self,
        id: &TemplateId,
        feedback: impl Into<String>,
    ) -> Result<(), StoreError> {
        let mut index = self.index.write().await;
        let template = index
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        template.metadata.feedback.push(feedback.into());
        let snapshot = template.clone();
        drop(index);
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Retrieve up to `k` templates most similar to `question`, scored by
    /// lexical token overlap (lowercased, punctuation-stripped tokens,
    /// intersection over the smaller set). Ties break by success rate, then
    /// usage count, then recency.
    pub async fn find_similar(&self, question: &str, k: usize) -> Vec<(WorkflowTemplate, f64)> {
        let query = tokenize(question);
        let index = self.index.read().await;
        let mut scored: Vec<(WorkflowTemplate, f64)> = index
            .values()
            .map(|t| {
                let score = overlap(&query, &tokenize(&t.metadata.question_pattern));
                (t.clone(), score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.metadata
                        .success_rate
                        .partial_cmp(&a.metadata.success_rate)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.metadata.usage_count.cmp(&a.metadata.usage_count))
                .then_with(|| b.metadata.last_used_at.cmp(&a.metadata.last_used_at))
        });
        scored.truncate(k);
        scored
    }

    pub async fn stats(&self) -> StoreStats {
        let index = self.index.read().await;
        let total = index.len();
        let avg = if total == 0 {
            0.0
        } else {
            index.values().map(|t| t.metadata.success_rate).sum::<f64>() / total as f64
        };
        let mut per_category: HashMap<String, usize> = HashMap::new();
        for template in index.values() {
            for tag in &template.metadata.tags {
                *per_category.entry(tag.clone()).or_default() += 1;
            }
        }
        StoreStats {
            total_templates: total,
            avg_success_rate: avg,
            templates_per_category: per_category,
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

// ============================================================================
// SIMILARITY
// ============================================================================

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Overlap coefficient: |A ∩ B| / min(|A|, |B|). Symmetric, non-negative,
/// 1.0 for identical token sets, and insensitive to token order.
fn overlap(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    intersection as f64 / smaller as f64
}

// ============================================================================
// TESTS
// ============================================================================
