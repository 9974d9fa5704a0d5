use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use vigil_core::config::ScoringConfig;
use vigil_core::error::{Result, VigilError};
use vigil_core::traits::{EmbeddingProvider, SimilarityStore};
use vigil_core::types::{MemoryRecord, RunState, RunStatus, ScoreRecord};

/// Result of one scorer application.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub score: f64,
    pub rationale: String,
}

/// A pure quality function over a run's structured input and report text.
pub trait Scorer: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn score(&self, input: &Value, output: Option<&str>) -> ScoreOutcome;
}

/// Scores a report by the presence of two marker substrings.
///
/// Both present: 1.0. Exactly one: 0.5. Neither: 0.0.
pub struct MarkerScorer {
    id: String,
    first: String,
    second: String,
}

impl MarkerScorer {
    pub fn new(id: impl Into<String>, first: impl Into<String>, second: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            first: first.into(),
            second: second.into(),
        }
    }

    pub fn from_config(config: &ScoringConfig) -> Result<Self> {
        match config.markers.as_slice() {
            [first, second] => Ok(Self::new(&config.scorer_id, first, second)),
            other => Err(VigilError::Config(format!(
                "marker scorer needs exactly two markers, got {}",
                other.len()
            ))),
        }
    }
}

impl Scorer for MarkerScorer {
    fn id(&self) -> &str {
        &self.id
    }

    fn score(&self, _input: &Value, output: Option<&str>) -> ScoreOutcome {
        let report = match output {
            Some(text) if !text.is_empty() => text,
            _ => {
                return ScoreOutcome {
                    score: 0.0,
                    rationale: "No report output".into(),
                }
            }
        };

        let has_first = report.contains(&self.first);
        let has_second = report.contains(&self.second);
        let (score, rationale) = match (has_first, has_second) {
            (true, true) => (
                1.0,
                format!("Report contains both \"{}\" and \"{}\"", self.first, self.second),
            ),
            (true, false) | (false, true) => (
                0.5,
                format!("Report contains either \"{}\" or \"{}\"", self.first, self.second),
            ),
            (false, false) => (
                0.0,
                format!("Report contains neither \"{}\" nor \"{}\"", self.first, self.second),
            ),
        };
        ScoreOutcome { score, rationale }
    }
}

// ── Score store ─────────────────────────────────────────────────

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS scores (
        id TEXT PRIMARY KEY,
        entity_id TEXT NOT NULL,
        scorer_id TEXT NOT NULL,
        score REAL NOT NULL,
        rationale TEXT NOT NULL,
        input TEXT NOT NULL,
        output TEXT NOT NULL,
        source TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_scores_entity ON scores(entity_id);";

fn db_err(e: impl std::fmt::Display) -> VigilError {
    VigilError::Database(e.to_string())
}

/// Append-only SQLite store of score records.
pub struct ScoreStore {
    conn: Mutex<Connection>,
}

impl ScoreStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn append(&self, record: &ScoreRecord) -> Result<()> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO scores (id, entity_id, scorer_id, score, rationale, input, output, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.entity_id,
                record.scorer_id,
                record.score,
                record.rationale,
                record.input.to_string(),
                record.output.to_string(),
                record.source,
                record.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Every score recorded against an entity, oldest first.
    pub fn list_for_entity(&self, entity_id: &str) -> Result<Vec<ScoreRecord>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, entity_id, scorer_id, score, rationale, input, output, source, created_at
                 FROM scores WHERE entity_id = ?1 ORDER BY rowid ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![entity_id], |row| {
                let id: String = row.get(0)?;
                let input: String = row.get(5)?;
                let output: String = row.get(6)?;
                let ts: String = row.get(8)?;
                Ok(ScoreRecord {
                    input: json_column(&id, "input", &input),
                    output: json_column(&id, "output", &output),
                    created_at: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|e| {
                            warn!(
                                score_id = %id,
                                raw = %ts,
                                error = %e,
                                "Corrupt score timestamp, reading as now"
                            );
                            Utc::now()
                        }),
                    id,
                    entity_id: row.get(1)?,
                    scorer_id: row.get(2)?,
                    score: row.get(3)?,
                    rationale: row.get(4)?,
                    source: row.get(7)?,
                })
            })
            .map_err(db_err)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }
}

fn json_column(score_id: &str, column: &str, raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(score_id, column, error = %e, "Corrupt score column, reading as null");
        Value::Null
    })
}

// ── Pipeline ────────────────────────────────────────────────────

/// Embedder + store pair used to remember succeeded runs for recall.
struct RunMemory {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn SimilarityStore>,
}

/// Scores terminal runs and persists the results.
pub struct ScoringPipeline {
    scorer: Arc<dyn Scorer>,
    store: Arc<ScoreStore>,
    analysis_step: String,
    analysis_field: String,
    input_steps: Vec<String>,
    memory: Option<RunMemory>,
}

impl ScoringPipeline {
    pub fn new(scorer: Arc<dyn Scorer>, store: Arc<ScoreStore>) -> Self {
        Self {
            scorer,
            store,
            analysis_step: "analysis".into(),
            analysis_field: "text".into(),
            input_steps: Vec::new(),
            memory: None,
        }
    }

    pub fn from_config(config: &ScoringConfig, scorer: Arc<dyn Scorer>, store: Arc<ScoreStore>) -> Self {
        Self::new(scorer, store)
            .with_analysis(&config.analysis_step, &config.analysis_field)
            .with_input_steps(config.input_steps.clone())
    }

    /// Which step output (and which field of it) is the report being scored.
    pub fn with_analysis(mut self, step: &str, field: &str) -> Self {
        self.analysis_step = step.to_string();
        self.analysis_field = field.to_string();
        self
    }

    /// Steps whose outputs form the scorer input. Empty means every succeeded step.
    pub fn with_input_steps(mut self, steps: Vec<String>) -> Self {
        self.input_steps = steps;
        self
    }

    /// Also write a snapshot of each succeeded run to the similarity store.
    pub fn with_memory(
        mut self,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn SimilarityStore>,
    ) -> Self {
        self.memory = Some(RunMemory { embedder, store });
        self
    }

    pub fn store(&self) -> &Arc<ScoreStore> {
        &self.store
    }

    fn analysis_text<'a>(&self, state: &'a RunState) -> Option<&'a str> {
        state
            .output(&self.analysis_step)
            .and_then(|o| o.get(&self.analysis_field))
            .and_then(Value::as_str)
    }

    fn scorer_input(&self, state: &RunState) -> Value {
        let mut input = Map::new();
        for result in &state.step_results {
            let wanted = if self.input_steps.is_empty() {
                result.step_id != self.analysis_step
            } else {
                self.input_steps.contains(&result.step_id)
            };
            if wanted {
                if let Some(output) = state.output(&result.step_id) {
                    input.insert(result.step_id.clone(), output.clone());
                }
            }
        }
        Value::Object(input)
    }

    /// Compute and persist a score for a terminal run.
    pub fn score(&self, state: &RunState) -> Result<ScoreRecord> {
        if !state.is_terminal() {
            return Err(VigilError::step(
                "scoring",
                format!("run {} is still {}", state.run_id, state.status),
            ));
        }

        let input = self.scorer_input(state);
        let text = self.analysis_text(state);
        let outcome = self.scorer.score(&input, text);

        let record = ScoreRecord {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id: state.run_id.to_string(),
            scorer_id: self.scorer.id().to_string(),
            score: outcome.score,
            rationale: outcome.rationale,
            input,
            output: json!({ "text": text }),
            source: "live".into(),
            created_at: Utc::now(),
        };
        self.store.append(&record)?;

        info!(
            run_id = %state.run_id,
            scorer = %record.scorer_id,
            score = record.score,
            "Run scored"
        );
        Ok(record)
    }

    /// Score a terminal run and remember it, containing every failure.
    pub async fn process(&self, state: &RunState) -> Option<ScoreRecord> {
        let record = match self.score(state) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(run_id = %state.run_id, error = %e, "Scoring failed");
                None
            }
        };

        if state.status == RunStatus::Succeeded {
            if let Err(e) = self.remember(state).await {
                warn!(run_id = %state.run_id, error = %e, "Failed to write run memory");
            }
        }
        record
    }

    async fn remember(&self, state: &RunState) -> Result<()> {
        let Some(ref memory) = self.memory else {
            return Ok(());
        };
        let Some(analysis) = self.analysis_text(state).filter(|t| !t.is_empty()) else {
            debug!(run_id = %state.run_id, "No analysis text, skipping run memory");
            return Ok(());
        };

        let vector = memory
            .embedder
            .embed(&[analysis.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| VigilError::Embedding("provider returned no vector".into()))?;

        let record = MemoryRecord {
            vector,
            metadata: json!({
                "runId": state.run_id.as_str(),
                "status": state.status,
                "analysis": analysis,
                "inputs": self.scorer_input(state),
            }),
            timestamp: Utc::now(),
        };
        memory
            .store
            .upsert(state.run_id.as_str(), state.correlation.scope_key(), &record)
            .await?;
        debug!(run_id = %state.run_id, "Run memory written");
        Ok(())
    }
}
