pub mod engine;
pub mod relay;
pub mod run_log;
pub mod scheduler;
pub mod scoring;
pub mod step;
pub mod store;
pub mod topology;

pub use engine::{RunEngine, RunEventStream};
pub use relay::EventRelay;
pub use run_log::RunLogger;
pub use scheduler::CronScheduler;
pub use scoring::{MarkerScorer, ScoreOutcome, ScoreStore, Scorer, ScoringPipeline};
pub use step::{
    Capabilities, Contract, FieldKind, FieldSpec, Requirement, Source, StepContext,
    StepDefinition, StepExecutor, StepOutcome,
};
pub use store::{RunLease, RunStateStore};
pub use topology::{BranchArm, Node, Predicate, StepPosition, TopologyBuilder, WorkflowTopology};
