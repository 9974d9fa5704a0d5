use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vigil_core::error::{Result, VigilError};
use vigil_core::types::{Correlation, RunStatus};
use vigil_core::RunEvent;

use crate::engine::RunEngine;
use crate::relay::EventRelay;

/// Starts a fresh run of one workflow on every tick of a cron schedule.
pub struct CronScheduler {
    schedule: Schedule,
    engine: Arc<RunEngine>,
    relay: Arc<EventRelay>,
    workflow_id: String,
    input: Value,
    correlation: Correlation,
    cancel: CancellationToken,
}

impl CronScheduler {
    pub fn new(
        expression: &str,
        engine: Arc<RunEngine>,
        relay: Arc<EventRelay>,
        workflow_id: impl Into<String>,
        input: Value,
        correlation: Correlation,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let schedule = Schedule::from_str(expression).map_err(|e| {
            VigilError::Config(format!("invalid cron expression '{}': {}", expression, e))
        })?;

        Ok(Self {
            schedule,
            engine,
            relay,
            workflow_id: workflow_id.into(),
            input,
            correlation,
            cancel,
        })
    }

    /// Run the scheduler loop. Blocks until cancelled.
    pub async fn run(&self) {
        info!(workflow_id = %self.workflow_id, "Cron scheduler started");

        loop {
            let Some(fire_at) = self.schedule.upcoming(Utc).next() else {
                // No upcoming times, wait until cancelled
                self.cancel.cancelled().await;
                break;
            };
            let delay = (fire_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(1));

            info!(
                workflow_id = %self.workflow_id,
                fire_at = %fire_at.format("%H:%M:%S"),
                delay_secs = delay.as_secs(),
                "Next run scheduled"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.fire_once().await {
                        error!(workflow_id = %self.workflow_id, error = %e, "Scheduled run failed to start");
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("Cron scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// Create and start one run, relaying its events until it stops.
    ///
    /// Returns the final status the run reached in this call.
    pub async fn fire_once(&self) -> Result<Option<RunStatus>> {
        let state = self.engine.create_run(
            &self.workflow_id,
            self.input.clone(),
            self.correlation.clone(),
        )?;
        let events = self.engine.start(&state.run_id)?;
        let last = self.relay.pump(events).await;

        let status = last.as_ref().and_then(RunEvent::final_status);
        match last {
            Some(RunEvent::RunSuspended { step_id, payload, .. }) => warn!(
                run_id = %state.run_id,
                step_id = %step_id,
                payload = %payload,
                "Scheduled run suspended, awaiting resume"
            ),
            _ => info!(
                run_id = %state.run_id,
                status = status.map(|s| s.as_str()).unwrap_or("unknown"),
                "Scheduled run finished"
            ),
        }
        Ok(status)
    }
}
