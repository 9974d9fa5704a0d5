use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info};

use vigil_core::RunEvent;

/// JSONL run logger.
///
/// Consumes a relay subscription and appends one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`. Each line is flushed as it is written, so a
/// crash never leaves a torn entry behind. A resumed run appends to the same
/// file.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    run_id: &'a str,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level`: 1 = run lifecycle, 2 = +per-node outcomes, 3 = +step starts and progress.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write entries until the event stream ends.
    pub async fn run<S>(self, mut events: S)
    where
        S: Stream<Item = RunEvent> + Unpin,
    {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        info!(path = %self.log_dir.display(), level = self.level, "RunLogger started");

        let mut writers: HashMap<String, BufWriter<File>> = HashMap::new();

        while let Some(event) = events.next().await {
            let Some(entry) = self.event_to_entry(&event) else {
                continue;
            };
            let run_id = event.run_id().as_str();

            if !writers.contains_key(run_id) {
                let path = self.log_dir.join(format!("{}.jsonl", run_id));
                match tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await
                {
                    Ok(file) => {
                        writers.insert(run_id.to_string(), BufWriter::new(file));
                    }
                    Err(e) => {
                        error!(error = %e, path = %path.display(), "Failed to open log file");
                        continue;
                    }
                }
            }
            let Some(writer) = writers.get_mut(run_id) else {
                continue;
            };

            if let Ok(json) = serde_json::to_string(&entry) {
                let line = format!("{}\n", json);
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(error = %e, run_id, "Failed to write log entry");
                }
                if let Err(e) = writer.flush().await {
                    error!(error = %e, run_id, "Failed to flush log");
                }
            }

            // The sequence for this run ends here; release the file handle
            if event.final_status().is_some() {
                writers.remove(run_id);
            }
        }

        for (_, mut writer) in writers {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    fn level_of(event: &RunEvent) -> u8 {
        match event {
            RunEvent::RunStarted { .. }
            | RunEvent::RunResumed { .. }
            | RunEvent::RunSuspended { .. }
            | RunEvent::RunSucceeded { .. }
            | RunEvent::RunFailed { .. } => 1,
            RunEvent::StepFinished { .. }
            | RunEvent::ParallelCompleted { .. }
            | RunEvent::BranchEvaluated { .. } => 2,
            RunEvent::StepStarted { .. } | RunEvent::StepProgress { .. } => 3,
        }
    }

    /// Convert an event to a log entry, or `None` if the level filters it out.
    fn event_to_entry<'a>(&self, event: &'a RunEvent) -> Option<LogEntry<'a>> {
        if Self::level_of(event) > self.level {
            return None;
        }

        let (step_id, detail) = match event {
            RunEvent::RunStarted { workflow_id, .. } => {
                (None, Some(serde_json::json!({ "workflow_id": workflow_id })))
            }
            RunEvent::RunResumed { step_id, .. } | RunEvent::StepStarted { step_id, .. } => {
                (Some(step_id.as_str()), None)
            }
            RunEvent::StepProgress { step_id, text, .. } => {
                (Some(step_id.as_str()), Some(serde_json::json!({ "text": text })))
            }
            RunEvent::StepFinished {
                step_id,
                status,
                error,
                ..
            } => (
                Some(step_id.as_str()),
                Some(serde_json::json!({ "status": status, "error": error })),
            ),
            RunEvent::ParallelCompleted {
                step_ids,
                succeeded,
                ..
            } => (
                None,
                Some(serde_json::json!({ "step_ids": step_ids, "succeeded": succeeded })),
            ),
            RunEvent::BranchEvaluated { selected, .. } => {
                (None, Some(serde_json::json!({ "selected": selected })))
            }
            RunEvent::RunSuspended {
                step_id, payload, ..
            } => (Some(step_id.as_str()), Some(payload.clone())),
            RunEvent::RunSucceeded { .. } => (None, None),
            RunEvent::RunFailed { error, .. } => {
                (None, Some(serde_json::json!({ "error": error })))
            }
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().as_str(),
            event_type: event.kind(),
            step_id,
            detail,
        })
    }
}
