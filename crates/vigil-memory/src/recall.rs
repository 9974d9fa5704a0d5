use std::sync::Arc;

use tracing::debug;

use vigil_core::error::{Result, VigilError};
use vigil_core::traits::{EmbeddingProvider, SimilarityStore};
use vigil_core::types::{RecallHit, SimilarityMatch};

/// Answers "find prior runs resembling this one" over a similarity store.
pub struct RecallService {
    store: Arc<dyn SimilarityStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    default_top_k: usize,
}

impl RecallService {
    pub fn new(
        store: Arc<dyn SimilarityStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        default_top_k: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            default_top_k: default_top_k.max(1),
        }
    }

    /// Embed `query` and return the nearest records in `scope`, best first.
    ///
    /// Fails with `Embedding` when no embedder is configured or it errors.
    /// An empty scope yields an empty list.
    pub async fn recall(&self, query: &str, scope: &str, top_k: usize) -> Result<Vec<RecallHit>> {
        let vector = self.embed_query(query).await?;
        self.recall_vector(&vector, scope, top_k).await
    }

    /// Same as [`recall`](Self::recall) with a pre-computed embedding.
    pub async fn recall_vector(
        &self,
        vector: &[f32],
        scope: &str,
        top_k: usize,
    ) -> Result<Vec<RecallHit>> {
        let k = if top_k == 0 { self.default_top_k } else { top_k };
        let matches = self.store.query(vector, scope, k).await?;
        debug!(scope, matches = matches.len(), "Recall query complete");
        Ok(matches.into_iter().map(to_hit).collect())
    }

    /// Embed a single text with the configured embedder.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| VigilError::Embedding("no embedding provider configured".into()))?;

        embedder
            .embed(&[text.to_string()])
            .await
            .map_err(|e| match e {
                VigilError::Embedding(_) => e,
                other => VigilError::Embedding(other.to_string()),
            })?
            .into_iter()
            .next()
            .ok_or_else(|| VigilError::Embedding("provider returned no vector".into()))
    }

    pub fn store(&self) -> &Arc<dyn SimilarityStore> {
        &self.store
    }
}

/// The human-readable content of a match is its `analysis` text when present.
fn to_hit(m: SimilarityMatch) -> RecallHit {
    let content = match m.metadata.get("analysis") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => m.metadata.to_string(),
    };
    RecallHit {
        score: m.score,
        metadata: m.metadata,
        content,
    }
}
