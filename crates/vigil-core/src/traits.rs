use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::Result;
use crate::types::*;

/// Metrics provider: structured host health.
pub trait MetricsProvider: Send + Sync + 'static {
    /// Take a health snapshot. Failures surface as the calling step's failure.
    fn fetch(&self) -> BoxFuture<'_, Result<HealthSnapshot>>;
}

/// Network probe: never fails; unreachable targets report `Offline`.
pub trait NetworkProbe: Send + Sync + 'static {
    fn fetch(&self) -> BoxFuture<'_, NetworkLatency>;
}

/// Process sampler: returns an empty list on failure.
pub trait ProcessSampler: Send + Sync + 'static {
    fn fetch(&self) -> BoxFuture<'_, Vec<ProcessInfo>>;
}

/// Reasoner: turns a prompt into text, optionally streamed.
pub trait Reasoner: Send + Sync + 'static {
    /// Stream the answer as text fragments.
    fn generate_stream(
        &self,
        prompt: String,
        correlation: Correlation,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>>;

    /// Generate the full answer.
    fn generate(&self, prompt: String, correlation: Correlation) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let mut stream = self.generate_stream(prompt, correlation).await?;
            let mut text = String::new();
            while let Some(fragment) = stream.next().await {
                text.push_str(&fragment?);
            }
            Ok(text)
        })
    }
}

/// Embedding provider: text to vectors.
pub trait EmbeddingProvider: Send + Sync + 'static {
    /// Embed a batch of texts into vectors.
    fn embed(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>>;
    /// Number of dimensions in the embedding vectors.
    fn dimensions(&self) -> usize;
}

/// Similarity store: nearest-neighbor lookup over run snapshots.
pub trait SimilarityStore: Send + Sync + 'static {
    /// Insert or replace the record with the given id inside a scope.
    fn upsert(&self, id: &str, scope: &str, record: &MemoryRecord) -> BoxFuture<'_, Result<()>>;

    /// Return up to `top_k` matches in `scope`, best first.
    fn query(
        &self,
        vector: &[f32],
        scope: &str,
        top_k: usize,
    ) -> BoxFuture<'_, Result<Vec<SimilarityMatch>>>;
}
