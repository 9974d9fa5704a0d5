use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use vigil_core::error::{Result, VigilError};
use vigil_core::traits::SimilarityStore;
use vigil_core::types::{MemoryRecord, SimilarityMatch};

use crate::embeddings::{cosine_similarity, decode_vector, encode_vector};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS memories (
        id TEXT PRIMARY KEY,
        scope TEXT NOT NULL,
        embedding BLOB NOT NULL,
        metadata TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_memories_scope ON memories(scope);";

/// SQLite-backed similarity store with brute-force cosine ranking.
pub struct SqliteSimilarityStore {
    conn: Mutex<Connection>,
}

fn parse_metadata(id: &str, raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(id, error = %e, "Corrupt memory metadata, reading as null");
        serde_json::Value::Null
    })
}

fn parse_timestamp(id: &str, raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!(id, raw, error = %e, "Corrupt memory timestamp, reading as now");
            Utc::now()
        })
}

fn db_err(e: impl std::fmt::Display) -> VigilError {
    VigilError::SimilarityStore(e.to_string())
}

impl SqliteSimilarityStore {
    /// Open or create a SQLite database at the given path.
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

        debug!(path = %path.display(), "Similarity store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn upsert_sync(&self, id: &str, scope: &str, record: &MemoryRecord) -> Result<()> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT OR REPLACE INTO memories (id, scope, embedding, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                scope,
                encode_vector(&record.vector),
                record.metadata.to_string(),
                record.timestamp.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn query_sync(&self, vector: &[f32], scope: &str, top_k: usize) -> Result<Vec<SimilarityMatch>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare("SELECT id, embedding, metadata, timestamp FROM memories WHERE scope = ?1")
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![scope], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                let metadata: String = row.get(2)?;
                let ts: String = row.get(3)?;
                Ok((id, blob, metadata, ts))
            })
            .map_err(db_err)?;

        let mut scored = Vec::new();
        for row in rows {
            let (id, blob, metadata, ts) = row.map_err(db_err)?;
            let score = cosine_similarity(vector, &decode_vector(&blob));
            scored.push(SimilarityMatch {
                score,
                metadata: parse_metadata(&id, &metadata),
                timestamp: parse_timestamp(&id, &ts),
                id,
            });
        }

        // Sort by similarity descending
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

impl SimilarityStore for SqliteSimilarityStore {
    fn upsert(&self, id: &str, scope: &str, record: &MemoryRecord) -> BoxFuture<'_, Result<()>> {
        let result = self.upsert_sync(id, scope, record);
        Box::pin(async move { result })
    }

    fn query(
        &self,
        vector: &[f32],
        scope: &str,
        top_k: usize,
    ) -> BoxFuture<'_, Result<Vec<SimilarityMatch>>> {
        let result = self.query_sync(vector, scope, top_k);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(vector: Vec<f32>, label: &str) -> MemoryRecord {
        MemoryRecord {
            vector,
            metadata: serde_json::json!({ "label": label }),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity() {
        let store = SqliteSimilarityStore::in_memory().unwrap();
        store.upsert("a", "host", &record(vec![1.0, 0.0], "east")).await.unwrap();
        store.upsert("b", "host", &record(vec![0.0, 1.0], "north")).await.unwrap();
        store.upsert("c", "host", &record(vec![0.7, 0.7], "diag")).await.unwrap();

        let matches = store.query(&[1.0, 0.1], "host", 2).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, "a");
        assert_eq!(matches[1].id, "c");
        assert!(matches[0].score >= matches[1].score);
    }

    #[tokio::test]
    async fn test_query_is_scoped() {
        let store = SqliteSimilarityStore::in_memory().unwrap();
        store.upsert("a", "host-a", &record(vec![1.0], "a")).await.unwrap();

        assert!(store.query(&[1.0], "host-b", 5).await.unwrap().is_empty());
        assert_eq!(store.query(&[1.0], "host-a", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let store = SqliteSimilarityStore::in_memory().unwrap();
        store.upsert("a", "s", &record(vec![1.0], "old")).await.unwrap();
        store.upsert("a", "s", &record(vec![1.0], "new")).await.unwrap();

        let matches = store.query(&[1.0], "s", 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].metadata["label"], "new");
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        {
            let store = SqliteSimilarityStore::open(&path).unwrap();
            store.upsert("a", "s", &record(vec![0.3, 0.4], "kept")).await.unwrap();
        }
        let store = SqliteSimilarityStore::open(&path).unwrap();
        let matches = store.query(&[0.3, 0.4], "s", 1).await.unwrap();
        assert_eq!(matches[0].metadata["label"], "kept");
    }

    #[tokio::test]
    async fn test_corrupt_columns_do_not_fail_the_query() {
        let store = SqliteSimilarityStore::in_memory().unwrap();
        store.upsert("a", "s", &record(vec![1.0], "ok")).await.unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE memories SET metadata = '{not json', timestamp = 'yesterday' WHERE id = 'a'",
                [],
            )
            .unwrap();

        let matches = store.query(&[1.0], "s", 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].metadata.is_null());
    }
}
