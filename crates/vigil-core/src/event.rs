use serde::{Deserialize, Serialize};

use crate::types::{RunId, RunStatus, StepStatus};

/// One entry in the event sequence produced by `start`/`resume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Traversal began from the first node.
    RunStarted { run_id: RunId, workflow_id: String },
    /// A suspended run was picked up again.
    RunResumed { run_id: RunId, step_id: String },
    /// A step executor is about to be invoked.
    StepStarted { run_id: RunId, step_id: String },
    /// Incremental text emitted by a running step (e.g. reasoner fragments).
    StepProgress {
        run_id: RunId,
        step_id: String,
        text: String,
    },
    /// A step reached a status (succeeded, failed or suspended).
    StepFinished {
        run_id: RunId,
        step_id: String,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Every member of a parallel group is terminal (or parked).
    ParallelCompleted {
        run_id: RunId,
        step_ids: Vec<String>,
        succeeded: bool,
    },
    /// A branch node was evaluated; `selected` is `None` when no arm matched.
    BranchEvaluated {
        run_id: RunId,
        selected: Option<String>,
    },
    /// The run parked awaiting `resume`. Last event of the sequence.
    RunSuspended {
        run_id: RunId,
        step_id: String,
        payload: serde_json::Value,
    },
    /// Last event of a successful run.
    RunSucceeded { run_id: RunId },
    /// Last event of a failed run.
    RunFailed { run_id: RunId, error: String },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunResumed { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepProgress { run_id, .. }
            | Self::StepFinished { run_id, .. }
            | Self::ParallelCompleted { run_id, .. }
            | Self::BranchEvaluated { run_id, .. }
            | Self::RunSuspended { run_id, .. }
            | Self::RunSucceeded { run_id }
            | Self::RunFailed { run_id, .. } => run_id,
        }
    }

    /// Snake-case name of the variant, as it appears in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunResumed { .. } => "run_resumed",
            Self::StepStarted { .. } => "step_started",
            Self::StepProgress { .. } => "step_progress",
            Self::StepFinished { .. } => "step_finished",
            Self::ParallelCompleted { .. } => "parallel_completed",
            Self::BranchEvaluated { .. } => "branch_evaluated",
            Self::RunSuspended { .. } => "run_suspended",
            Self::RunSucceeded { .. } => "run_succeeded",
            Self::RunFailed { .. } => "run_failed",
        }
    }

    /// The run status this event leaves the sequence in, if it ends it.
    pub fn final_status(&self) -> Option<RunStatus> {
        match self {
            Self::RunSuspended { .. } => Some(RunStatus::Suspended),
            Self::RunSucceeded { .. } => Some(RunStatus::Succeeded),
            Self::RunFailed { .. } => Some(RunStatus::Failed),
            _ => None,
        }
    }
}
