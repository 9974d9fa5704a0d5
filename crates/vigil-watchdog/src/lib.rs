//! The system-watchdog workflow.
//!
//! Health, network and process samples are gathered in parallel, similar past
//! runs are recalled, and the reasoner writes a report. The run parks before
//! the report when memory is over the threshold, then branches into a
//! critical or normal continuation.

pub mod steps;

use std::sync::Arc;

use vigil_core::config::{ScoringConfig, WatchdogConfig};
use vigil_core::error::Result;
use vigil_workflow::{
    BranchArm, MarkerScorer, ScoreStore, ScoringPipeline, TopologyBuilder, WorkflowTopology,
};

pub use steps::{memory_usage, run_memory_usage, ANALYST_INSTRUCTIONS};

/// Build and commit the watchdog topology.
pub fn build_topology(config: &WatchdogConfig) -> Result<Arc<WorkflowTopology>> {
    let threshold = config.memory_threshold;

    let mut builder = TopologyBuilder::new(&config.workflow_id);
    builder
        .add_parallel(vec![
            steps::fetch_health(),
            steps::probe_network(),
            steps::sample_processes(),
        ])?
        .add_sequence(vec![steps::recall_history(), steps::analysis(threshold)])?
        .add_branch(vec![
            BranchArm::new(
                "critical",
                move |state| run_memory_usage(state) > threshold,
                vec![steps::log_critical()],
            ),
            BranchArm::new(
                "normal",
                move |state| run_memory_usage(state) <= threshold,
                vec![steps::log_normal()],
            ),
        ])?;
    builder.commit()
}

/// The marker scorer over the analysis report, persisting into `store`.
pub fn scoring_pipeline(config: &ScoringConfig, store: Arc<ScoreStore>) -> Result<ScoringPipeline> {
    let scorer = MarkerScorer::from_config(config)?;
    Ok(ScoringPipeline::from_config(config, Arc::new(scorer), store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_workflow::Node;

    #[test]
    fn test_topology_shape() {
        let topology = build_topology(&WatchdogConfig::default()).unwrap();
        assert_eq!(topology.id(), "system-watchdog");
        assert_eq!(
            topology.step_ids(),
            vec![
                "fetchHealth",
                "probeNetwork",
                "sampleProcesses",
                "recallHistory",
                "analysis",
                "logCritical",
                "logNormal"
            ]
        );
        assert!(matches!(topology.nodes()[0], Node::Parallel(ref m) if m.len() == 3));
        assert!(matches!(topology.nodes().last(), Some(Node::Branch(arms)) if arms.len() == 2));
    }

    #[test]
    fn test_scoring_pipeline_rejects_bad_markers() {
        let config = ScoringConfig {
            markers: vec![],
            ..ScoringConfig::default()
        };
        let store = Arc::new(ScoreStore::in_memory().unwrap());
        assert!(scoring_pipeline(&config, store).is_err());
    }
}
