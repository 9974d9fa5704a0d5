use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use vigil_core::error::{Result, VigilError};
use vigil_core::types::{RunId, RunState, RunStatus};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        state_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status, created_at DESC);

    CREATE TABLE IF NOT EXISTS run_leases (
        run_id TEXT PRIMARY KEY,
        holder_pid INTEGER NOT NULL,
        acquired_at TEXT NOT NULL
    );";

/// How long a writer waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn db_err(e: impl std::fmt::Display) -> VigilError {
    VigilError::Database(e.to_string())
}

/// Durable run state, one row per run, plus the per-run lease table.
///
/// Leases live in the database, so every store opened on the same file
/// (in this process or another) sees the same holder.
pub struct RunStateStore {
    conn: Arc<Mutex<Connection>>,
}

/// Exclusive hold on a run for the duration of a `start`/`resume`.
/// Released on drop.
#[derive(Debug)]
pub struct RunLease {
    run_id: String,
    conn: Arc<Mutex<Connection>>,
}

impl RunLease {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = conn.execute(
            "DELETE FROM run_leases WHERE run_id = ?1",
            params![self.run_id],
        ) {
            warn!(run_id = %self.run_id, error = %e, "Failed to release run lease");
        }
    }
}

impl RunStateStore {
    /// Open or create the run database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Run state store opened");
        Ok(Self::with_connection(conn))
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self::with_connection(conn))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Insert or replace the snapshot of a run.
    pub fn save(&self, state: &RunState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO runs (run_id, workflow_id, status, state_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(run_id) DO UPDATE SET
                 status = excluded.status,
                 state_json = excluded.state_json,
                 updated_at = excluded.updated_at",
            params![
                state.run_id.as_str(),
                state.workflow_id,
                state.status.as_str(),
                json,
                state.created_at.to_rfc3339(),
                state.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn load(&self, run_id: &RunId) -> Result<RunState> {
        let conn = self.conn.lock().map_err(db_err)?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(VigilError::RunNotFound(run_id.to_string())),
        }
    }

    /// Runs, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<RunStatus>) -> Result<Vec<RunState>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT state_json FROM runs
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY created_at DESC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], |row| {
                row.get::<_, String>(0)
            })
            .map_err(db_err)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(serde_json::from_str(&row.map_err(db_err)?)?);
        }
        Ok(runs)
    }

    /// Take the exclusive lease on a run, failing fast if any holder has it.
    ///
    /// A process that dies while holding a lease leaves its row behind; the
    /// run then reports `RunBusy` until the row is cleared.
    pub fn try_lease(&self, run_id: &RunId) -> Result<RunLease> {
        let conn = self.conn.lock().map_err(db_err)?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO run_leases (run_id, holder_pid, acquired_at)
                 VALUES (?1, ?2, ?3)",
                params![run_id.as_str(), std::process::id(), Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(VigilError::RunBusy(run_id.to_string()));
        }
        Ok(RunLease {
            run_id: run_id.to_string(),
            conn: Arc::clone(&self.conn),
        })
    }
}
