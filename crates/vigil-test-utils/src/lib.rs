//! Mock collaborators and fixtures shared by Vigil's test suites.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use vigil_core::error::{Result, VigilError};
use vigil_core::traits::*;
use vigil_core::types::*;

/// A health snapshot whose memory usage is `usage` percent.
pub fn health_snapshot(usage: f64) -> HealthSnapshot {
    HealthSnapshot {
        status: "operational".into(),
        timestamp: Utc::now(),
        system: SystemInfo {
            platform: "linux".into(),
            release: "6.1.0".into(),
            arch: "x86_64".into(),
            hostname: "test-host".into(),
        },
        resources: Resources {
            cpu: CpuUsage {
                usage_percentage: "10.00%".into(),
            },
            memory: MemoryUsage {
                total: "17179869184".into(),
                free: format!("{}", (17179869184.0 * (100.0 - usage) / 100.0) as u64),
                usage_percentage: format_percentage(usage),
            },
            load_average: [0.5, 0.4, 0.3],
            uptime: 3600,
            cpus: 8,
        },
    }
}

/// A process list with Google Chrome on top.
pub fn chrome_processes() -> Vec<ProcessInfo> {
    vec![
        ProcessInfo {
            pid: 4242,
            name: "Google Chrome".into(),
            cpu_percent: 99.0,
            memory_percent: 41.5,
        },
        ProcessInfo {
            pid: 77,
            name: "postgres".into(),
            cpu_percent: 3.2,
            memory_percent: 4.0,
        },
    ]
}

// ── Metrics ─────────────────────────────────────────────────────

/// Returns the same snapshot on every call and counts calls.
pub struct StaticMetrics {
    snapshot: HealthSnapshot,
    calls: AtomicUsize,
}

impl StaticMetrics {
    pub fn new(usage: f64) -> Self {
        Self::with_snapshot(health_snapshot(usage))
    }

    pub fn with_snapshot(snapshot: HealthSnapshot) -> Self {
        Self {
            snapshot,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MetricsProvider for StaticMetrics {
    fn fetch(&self) -> BoxFuture<'_, Result<HealthSnapshot>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.snapshot.clone();
        Box::pin(async move { Ok(snapshot) })
    }
}

/// Always fails.
pub struct FailingMetrics;

impl MetricsProvider for FailingMetrics {
    fn fetch(&self) -> BoxFuture<'_, Result<HealthSnapshot>> {
        Box::pin(async { Err(VigilError::Metrics("metrics backend unreachable".into())) })
    }
}

// ── Network / processes ─────────────────────────────────────────

pub struct FixedProbe(pub NetworkLatency);

impl NetworkProbe for FixedProbe {
    fn fetch(&self) -> BoxFuture<'_, NetworkLatency> {
        let latency = self.0;
        Box::pin(async move { latency })
    }
}

pub struct FixedProcesses(pub Vec<ProcessInfo>);

impl ProcessSampler for FixedProcesses {
    fn fetch(&self) -> BoxFuture<'_, Vec<ProcessInfo>> {
        let processes = self.0.clone();
        Box::pin(async move { processes })
    }
}

// ── Reasoner ────────────────────────────────────────────────────

/// Streams a fixed list of fragments and records every prompt it sees.
pub struct ScriptedReasoner {
    fragments: Vec<String>,
    failure: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedReasoner {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            failure: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// A reasoner whose every request fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            fragments: Vec::new(),
            failure: Some(message.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Reasoner for ScriptedReasoner {
    fn generate_stream(
        &self,
        prompt: String,
        _correlation: Correlation,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        self.prompts.lock().unwrap().push(prompt);
        Box::pin(async move {
            if let Some(ref message) = self.failure {
                return Err(VigilError::Reasoner(message.clone()));
            }
            let fragments: Vec<Result<String>> =
                self.fragments.iter().cloned().map(Ok).collect();
            Ok(stream::iter(fragments).boxed())
        })
    }
}

// ── Embeddings ──────────────────────────────────────────────────

/// Deterministic bag-of-words embedder: each lowercase word bumps one bucket.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for word in text.split_whitespace() {
            let hash = word
                .to_lowercase()
                .bytes()
                .fold(0xcbf29ce484222325u64, |h, b| {
                    (h ^ b as u64).wrapping_mul(0x100000001b3)
                });
            vector[(hash % self.dims as u64) as usize] += 1.0;
        }
        vector
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn embed(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>> {
        let vectors = texts.iter().map(|t| self.embed_one(t)).collect();
        Box::pin(async move { Ok(vectors) })
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

pub struct FailingEmbedder;

impl EmbeddingProvider for FailingEmbedder {
    fn embed(&self, _texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>> {
        Box::pin(async { Err(VigilError::Embedding("embedding service down".into())) })
    }

    fn dimensions(&self) -> usize {
        0
    }
}

// ── Similarity store ────────────────────────────────────────────

/// In-memory similarity store with cosine ranking.
#[derive(Default)]
pub struct MemorySimilarityStore {
    records: Mutex<Vec<(String, String, MemoryRecord)>>,
}

impl MemorySimilarityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(id, scope, record)` triples in insertion order.
    pub fn records(&self) -> Vec<(String, String, MemoryRecord)> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

impl SimilarityStore for MemorySimilarityStore {
    fn upsert(&self, id: &str, scope: &str, record: &MemoryRecord) -> BoxFuture<'_, Result<()>> {
        let mut records = self.records.lock().unwrap();
        records.retain(|(existing, _, _)| existing != id);
        records.push((id.to_string(), scope.to_string(), record.clone()));
        Box::pin(async { Ok(()) })
    }

    fn query(
        &self,
        vector: &[f32],
        scope: &str,
        top_k: usize,
    ) -> BoxFuture<'_, Result<Vec<SimilarityMatch>>> {
        let mut matches: Vec<SimilarityMatch> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s, _)| s == scope)
            .map(|(id, _, record)| SimilarityMatch {
                id: id.clone(),
                score: cosine(vector, &record.vector),
                metadata: record.metadata.clone(),
                timestamp: record.timestamp,
            })
            .collect();
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(top_k);
        Box::pin(async move { Ok(matches) })
    }
}

/// Every call fails.
pub struct FailingSimilarityStore;

impl SimilarityStore for FailingSimilarityStore {
    fn upsert(&self, _id: &str, _scope: &str, _record: &MemoryRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Err(VigilError::SimilarityStore("store offline".into())) })
    }

    fn query(
        &self,
        _vector: &[f32],
        _scope: &str,
        _top_k: usize,
    ) -> BoxFuture<'_, Result<Vec<SimilarityMatch>>> {
        Box::pin(async { Err(VigilError::SimilarityStore("store offline".into())) })
    }
}
