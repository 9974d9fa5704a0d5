use thiserror::Error;

use crate::types::RunStatus;

#[derive(Debug, Error)]
pub enum VigilError {
    // Topology errors
    #[error("Invalid topology: {0}")]
    Topology(String),

    #[error("Topology is frozen: {0}")]
    FrozenTopology(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    // Step errors
    #[error("Step execution failed: {step}: {message}")]
    StepExecution { step: String, message: String },

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    // Run lifecycle errors
    #[error("Run {run_id} cannot be resumed from status {status}")]
    InvalidResumeState { run_id: String, status: RunStatus },

    #[error("Run {run_id} cannot be started from status {status}")]
    InvalidStartState { run_id: String, status: RunStatus },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run is busy (another start/resume holds its lease): {0}")]
    RunBusy(String),

    // Collaborator errors
    #[error("Metrics provider failed: {0}")]
    Metrics(String),

    #[error("Reasoner request failed: {0}")]
    Reasoner(String),

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Similarity store error: {0}")]
    SimilarityStore(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VigilError {
    /// Shorthand for a failure raised inside a step executor.
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            step: step.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VigilError>;
