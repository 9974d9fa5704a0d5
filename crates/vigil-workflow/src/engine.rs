use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use vigil_core::error::{Result, VigilError};
use vigil_core::types::{
    Correlation, RunId, RunState, RunStatus, StepResult, StepStatus, SuspensionMarker,
};
use vigil_core::RunEvent;

use crate::scoring::ScoringPipeline;
use crate::step::{Capabilities, StepContext, StepDefinition, StepOutcome};
use crate::store::{RunLease, RunStateStore};
use crate::topology::{BranchArm, Node, StepPosition, WorkflowTopology};

/// Event sequence returned by `start`/`resume`. Ends after the run suspends
/// or reaches a terminal status.
pub type RunEventStream = ReceiverStream<RunEvent>;

const DEFAULT_EVENT_BUFFER: usize = 32;

/// Walks committed topologies against persisted run state.
///
/// `start` and `resume` validate the request synchronously, then hand the run
/// to a background task that owns the run's lease until it suspends or
/// finishes. Dropping the returned stream does not stop the run.
pub struct RunEngine {
    workflows: HashMap<String, Arc<WorkflowTopology>>,
    store: Arc<RunStateStore>,
    capabilities: Capabilities,
    scoring: Option<Arc<ScoringPipeline>>,
    event_buffer: usize,
}

impl RunEngine {
    pub fn new(store: Arc<RunStateStore>, capabilities: Capabilities) -> Self {
        Self {
            workflows: HashMap::new(),
            store,
            capabilities,
            scoring: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Score every run that reaches a terminal status.
    pub fn with_scoring(mut self, scoring: Arc<ScoringPipeline>) -> Self {
        self.scoring = Some(scoring);
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Make a committed topology runnable under its workflow id.
    pub fn register(&mut self, topology: Arc<WorkflowTopology>) {
        debug!(workflow_id = %topology.id(), "Workflow registered");
        self.workflows.insert(topology.id().to_string(), topology);
    }

    pub fn store(&self) -> &Arc<RunStateStore> {
        &self.store
    }

    fn topology(&self, workflow_id: &str) -> Result<Arc<WorkflowTopology>> {
        self.workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| VigilError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Create and persist a `pending` run.
    pub fn create_run(
        &self,
        workflow_id: &str,
        input: Value,
        correlation: Correlation,
    ) -> Result<RunState> {
        let topology = self.topology(workflow_id)?;
        topology.trigger().validate(&input).map_err(|msg| {
            VigilError::Topology(format!("{}: trigger input rejected: {}", workflow_id, msg))
        })?;

        let state = RunState::new(workflow_id, input, correlation);
        self.store.save(&state)?;
        info!(run_id = %state.run_id, workflow_id, "Run created");
        Ok(state)
    }

    pub fn run_state(&self, run_id: &RunId) -> Result<RunState> {
        self.store.load(run_id)
    }

    /// Begin traversal of a `pending` run.
    pub fn start(&self, run_id: &RunId) -> Result<RunEventStream> {
        let lease = self.store.try_lease(run_id)?;
        let mut state = self.store.load(run_id)?;
        if state.status != RunStatus::Pending {
            return Err(VigilError::InvalidStartState {
                run_id: run_id.to_string(),
                status: state.status,
            });
        }
        let topology = self.topology(&state.workflow_id)?;

        state.transition(RunStatus::Running);
        self.store.save(&state)?;

        let (driver, stream) = self.driver(topology, state, lease);
        tokio::spawn(driver.start());
        Ok(stream)
    }

    /// Re-invoke the suspended step with `payload` and continue after it.
    pub fn resume(&self, run_id: &RunId, payload: Value) -> Result<RunEventStream> {
        let lease = self.store.try_lease(run_id)?;
        let mut state = self.store.load(run_id)?;
        let marker = match (state.status, &state.suspension) {
            (RunStatus::Suspended, Some(marker)) => marker.clone(),
            (status, _) => {
                return Err(VigilError::InvalidResumeState {
                    run_id: run_id.to_string(),
                    status,
                })
            }
        };
        let topology = self.topology(&state.workflow_id)?;
        let position = topology.locate(&marker.step_id).ok_or_else(|| {
            VigilError::Topology(format!(
                "{}: suspended step '{}' is not part of the workflow",
                topology.id(),
                marker.step_id
            ))
        })?;

        state.suspension = None;
        state.transition(RunStatus::Running);
        self.store.save(&state)?;

        let (driver, stream) = self.driver(topology, state, lease);
        tokio::spawn(driver.resume(marker.step_id, position, payload));
        Ok(stream)
    }

    fn driver(
        &self,
        topology: Arc<WorkflowTopology>,
        state: RunState,
        lease: RunLease,
    ) -> (Driver, RunEventStream) {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let driver = Driver {
            topology,
            store: Arc::clone(&self.store),
            capabilities: self.capabilities.clone(),
            scoring: self.scoring.clone(),
            events: tx,
            state,
            lease: Some(lease),
        };
        (driver, ReceiverStream::new(rx))
    }
}

/// How traversal of a node ended.
enum Flow {
    Continue,
    Suspended(SuspensionMarker),
    Failed(String),
}

/// Owns one run for the duration of a `start`/`resume` call.
struct Driver {
    topology: Arc<WorkflowTopology>,
    store: Arc<RunStateStore>,
    capabilities: Capabilities,
    scoring: Option<Arc<ScoringPipeline>>,
    events: mpsc::Sender<RunEvent>,
    state: RunState,
    lease: Option<RunLease>,
}

impl Driver {
    async fn start(mut self) {
        info!(
            run_id = %self.state.run_id,
            workflow_id = %self.state.workflow_id,
            "Run started"
        );
        self.emit(RunEvent::RunStarted {
            run_id: self.state.run_id.clone(),
            workflow_id: self.state.workflow_id.clone(),
        })
        .await;

        let flow = self.walk(0).await;
        self.finish(flow).await;
    }

    async fn resume(mut self, step_id: String, position: StepPosition, payload: Value) {
        info!(run_id = %self.state.run_id, step_id = %step_id, "Run resumed");
        self.emit(RunEvent::RunResumed {
            run_id: self.state.run_id.clone(),
            step_id: step_id.clone(),
        })
        .await;

        let topology = Arc::clone(&self.topology);
        let flow = match topology.step_at(position) {
            Some(step) => {
                let outputs = match topology.nodes().get(position.node()) {
                    Some(Node::Parallel(members)) => self.outputs_outside(members),
                    _ => self.outputs_outside(&[]),
                };
                match self.invoke_step(step, Some(payload), outputs).await {
                    Flow::Continue => self.continue_after(&topology, position).await,
                    other => other,
                }
            }
            None => Flow::Failed(format!("suspended step '{}' not found", step_id)),
        };
        self.finish(flow).await;
    }

    /// Finish the node holding `position`, then walk the rest of the topology.
    async fn continue_after(&mut self, topology: &WorkflowTopology, position: StepPosition) -> Flow {
        let node = position.node();
        let flow = match (topology.nodes().get(node), position) {
            (Some(Node::Parallel(members)), StepPosition::Parallel { .. }) => {
                self.run_parallel(members).await
            }
            (Some(Node::Branch(arms)), StepPosition::Arm { arm, offset, .. }) => {
                match arms.get(arm) {
                    Some(arm) => self.run_arm(arm, offset + 1).await,
                    None => Flow::Continue,
                }
            }
            _ => Flow::Continue,
        };
        match flow {
            Flow::Continue => self.walk(node + 1).await,
            other => other,
        }
    }

    async fn walk(&mut self, from: usize) -> Flow {
        let topology = Arc::clone(&self.topology);
        for node in topology.nodes().iter().skip(from) {
            let flow = match node {
                Node::Step(step) => self.run_step(step, None).await,
                Node::Parallel(members) => self.run_parallel(members).await,
                Node::Branch(arms) => self.run_branch(arms).await,
            };
            if !matches!(flow, Flow::Continue) {
                return flow;
            }
        }
        Flow::Continue
    }

    async fn run_step(&mut self, step: &Arc<StepDefinition>, resume: Option<Value>) -> Flow {
        let outputs = self.outputs_outside(&[]);
        self.invoke_step(step, resume, outputs).await
    }

    async fn invoke_step(
        &mut self,
        step: &Arc<StepDefinition>,
        resume: Option<Value>,
        outputs: Arc<HashMap<String, Value>>,
    ) -> Flow {
        self.emit(RunEvent::StepStarted {
            run_id: self.state.run_id.clone(),
            step_id: step.id().to_string(),
        })
        .await;

        let ctx = self.context(step.id(), resume, outputs);
        let result = step.invoke(ctx).await;
        self.settle(step.id(), result).await
    }

    /// Succeeded outputs, minus those of `group`. Members of a parallel
    /// group never see each other, whether they run together or one is
    /// re-run on resume.
    fn outputs_outside(&self, group: &[Arc<StepDefinition>]) -> Arc<HashMap<String, Value>> {
        let mut outputs = self.state.outputs();
        for member in group {
            outputs.remove(member.id());
        }
        Arc::new(outputs)
    }

    /// Run every non-terminal member concurrently and join on all of them.
    ///
    /// A failed member does not cancel its siblings. Failure wins over
    /// suspension; the first suspended member in declaration order becomes the
    /// run's marker.
    async fn run_parallel(&mut self, members: &[Arc<StepDefinition>]) -> Flow {
        let pending: Vec<&Arc<StepDefinition>> = members
            .iter()
            .filter(|m| {
                !self
                    .state
                    .result(m.id())
                    .is_some_and(|r| r.status.is_terminal())
            })
            .collect();

        for member in &pending {
            self.emit(RunEvent::StepStarted {
                run_id: self.state.run_id.clone(),
                step_id: member.id().to_string(),
            })
            .await;
        }

        let outputs = self.outputs_outside(members);
        let handles: Vec<_> = pending
            .iter()
            .map(|member| {
                let step = Arc::clone(member);
                let ctx = self.context(step.id(), None, Arc::clone(&outputs));
                tokio::spawn(async move { step.invoke(ctx).await })
            })
            .collect();
        let joined = join_all(handles).await;

        let mut failure = None;
        let mut suspension = None;
        for (member, result) in pending.iter().zip(joined) {
            let result = result.unwrap_or_else(|e| {
                Err(VigilError::step(member.id(), format!("step task aborted: {}", e)))
            });
            match self.settle(member.id(), result).await {
                Flow::Continue => {}
                Flow::Failed(error) => {
                    failure.get_or_insert(error);
                }
                Flow::Suspended(marker) => {
                    suspension.get_or_insert(marker);
                }
            }
        }

        let succeeded = failure.is_none() && suspension.is_none();
        debug!(
            run_id = %self.state.run_id,
            members = members.len(),
            succeeded,
            "Parallel group joined"
        );
        self.emit(RunEvent::ParallelCompleted {
            run_id: self.state.run_id.clone(),
            step_ids: members.iter().map(|m| m.id().to_string()).collect(),
            succeeded,
        })
        .await;

        match (failure, suspension) {
            (Some(error), _) => Flow::Failed(error),
            (None, Some(marker)) => Flow::Suspended(marker),
            (None, None) => Flow::Continue,
        }
    }

    async fn run_branch(&mut self, arms: &[BranchArm]) -> Flow {
        let selected = arms.iter().find(|arm| arm.matches(&self.state));
        debug!(
            run_id = %self.state.run_id,
            selected = selected.map(|a| a.label()).unwrap_or("<none>"),
            "Branch evaluated"
        );
        self.emit(RunEvent::BranchEvaluated {
            run_id: self.state.run_id.clone(),
            selected: selected.map(|a| a.label().to_string()),
        })
        .await;

        match selected {
            Some(arm) => self.run_arm(arm, 0).await,
            None => Flow::Continue,
        }
    }

    async fn run_arm(&mut self, arm: &BranchArm, from: usize) -> Flow {
        for step in arm.steps().iter().skip(from) {
            let flow = self.run_step(step, None).await;
            if !matches!(flow, Flow::Continue) {
                return flow;
            }
        }
        Flow::Continue
    }

    fn context(
        &self,
        step_id: &str,
        resume: Option<Value>,
        outputs: Arc<HashMap<String, Value>>,
    ) -> StepContext {
        StepContext::new(
            self.state.run_id.clone(),
            step_id.to_string(),
            &self.state.input,
            resume,
            outputs,
            self.state.correlation.clone(),
            self.capabilities.clone(),
            Some(self.events.clone()),
        )
    }

    /// Record a step's outcome, persist it, and report it.
    async fn settle(&mut self, step_id: &str, result: Result<StepOutcome>) -> Flow {
        let run_id = self.state.run_id.clone();
        match result {
            Ok(StepOutcome::Complete(output)) => {
                self.state
                    .record(StepResult::succeeded(step_id, output.clone()));
                if let Err(e) = self.store.save(&self.state) {
                    error!(run_id = %run_id, step_id, error = %e, "Failed to persist step result");
                    return Flow::Failed(format!("failed to persist run state: {}", e));
                }
                debug!(run_id = %run_id, step_id, "Step succeeded");
                self.emit(RunEvent::StepFinished {
                    run_id,
                    step_id: step_id.to_string(),
                    status: StepStatus::Succeeded,
                    output: Some(output),
                    error: None,
                })
                .await;
                Flow::Continue
            }
            Ok(StepOutcome::Suspend(payload)) => {
                self.state.record(StepResult::suspended(step_id));
                debug!(run_id = %run_id, step_id, "Step requested suspension");
                self.emit(RunEvent::StepFinished {
                    run_id,
                    step_id: step_id.to_string(),
                    status: StepStatus::Suspended,
                    output: None,
                    error: None,
                })
                .await;
                Flow::Suspended(SuspensionMarker {
                    step_id: step_id.to_string(),
                    payload,
                })
            }
            Err(e) => {
                let message = e.to_string();
                error!(run_id = %run_id, step_id, error = %message, "Step failed");
                self.state.record(StepResult::failed(step_id, &message));
                if let Err(e) = self.store.save(&self.state) {
                    error!(run_id = %run_id, step_id, error = %e, "Failed to persist step result");
                }
                self.emit(RunEvent::StepFinished {
                    run_id,
                    step_id: step_id.to_string(),
                    status: StepStatus::Failed,
                    output: None,
                    error: Some(message.clone()),
                })
                .await;
                Flow::Failed(message)
            }
        }
    }

    /// Persist the final status, release the lease, score, then emit the
    /// event that closes the sequence.
    async fn finish(mut self, flow: Flow) {
        let run_id = self.state.run_id.clone();
        let event = match flow {
            Flow::Continue => {
                self.state.transition(RunStatus::Succeeded);
                info!(run_id = %run_id, "Run succeeded");
                RunEvent::RunSucceeded { run_id }
            }
            Flow::Suspended(marker) => {
                self.state.transition(RunStatus::Suspended);
                self.state.suspension = Some(marker.clone());
                info!(run_id = %run_id, step_id = %marker.step_id, "Run suspended");
                RunEvent::RunSuspended {
                    run_id,
                    step_id: marker.step_id,
                    payload: marker.payload,
                }
            }
            Flow::Failed(error) => {
                self.state.transition(RunStatus::Failed);
                warn!(run_id = %run_id, error = %error, "Run failed");
                RunEvent::RunFailed { run_id, error }
            }
        };

        if let Err(e) = self.store.save(&self.state) {
            error!(run_id = %self.state.run_id, error = %e, "Failed to persist final run state");
        }
        drop(self.lease.take());

        if self.state.is_terminal() {
            if let Some(ref scoring) = self.scoring {
                scoring.process(&self.state).await;
            }
        }
        self.emit(event).await;
    }

    async fn emit(&self, event: RunEvent) {
        // A closed receiver means the consumer went away; the run carries on
        if self.events.send(event).await.is_err() {
            debug!(run_id = %self.state.run_id, "Event consumer dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{MarkerScorer, ScoreStore};
    use crate::step::{Contract, FieldKind};
    use crate::topology::TopologyBuilder;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn emit_step(id: &str, value: Value) -> StepDefinition {
        StepDefinition::new(id, move |ctx: StepContext| {
            let value = value.clone();
            async move { ctx.complete(value) }
        })
    }

    fn slow_step(id: &str, millis: u64) -> StepDefinition {
        StepDefinition::new(id, move |ctx: StepContext| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            ctx.complete(json!({ "slept": millis }))
        })
    }

    fn failing_step(id: &str) -> StepDefinition {
        StepDefinition::new(id, |ctx: StepContext| async move { ctx.fail("boom") })
    }

    fn counted_step(id: &str, calls: Arc<AtomicUsize>) -> StepDefinition {
        StepDefinition::new(id, move |ctx: StepContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                ctx.complete(json!({}))
            }
        })
    }

    /// Suspends unless the input carries `force: true`.
    fn gate_step(id: &str, calls: Arc<AtomicUsize>) -> StepDefinition {
        StepDefinition::new(id, move |ctx: StepContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if ctx.input()["force"] == json!(true) {
                    ctx.complete(json!({ "forced": true }))
                } else {
                    ctx.suspend(json!({ "reason": "needs approval" }))
                }
            }
        })
    }

    fn engine_with(topology: Arc<WorkflowTopology>) -> RunEngine {
        let store = Arc::new(RunStateStore::in_memory().unwrap());
        let mut engine = RunEngine::new(store, Capabilities::new());
        engine.register(topology);
        engine
    }

    async fn run_to_end(engine: &RunEngine, input: Value) -> (RunState, Vec<RunEvent>) {
        let state = engine
            .create_run("wf", input, Correlation::new("t", "r"))
            .unwrap();
        let events: Vec<RunEvent> = engine.start(&state.run_id).unwrap().collect().await;
        (engine.run_state(&state.run_id).unwrap(), events)
    }

    fn kinds(events: &[RunEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.kind()).collect()
    }

    #[tokio::test]
    async fn test_sequence_runs_in_order() {
        let mut b = TopologyBuilder::new("wf");
        b.add_sequence(vec![
            emit_step("a", json!({"v": 1})),
            StepDefinition::new("b", |ctx: StepContext| async move {
                let v = ctx.output("a")?["v"].as_i64().unwrap_or(0);
                ctx.complete(json!({ "v": v + 1 }))
            }),
        ])
        .unwrap();
        let engine = engine_with(b.commit().unwrap());

        let (state, events) = run_to_end(&engine, json!({})).await;
        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(state.output("b"), Some(&json!({"v": 2})));
        assert_eq!(
            kinds(&events),
            vec![
                "run_started",
                "step_started",
                "step_finished",
                "step_started",
                "step_finished",
                "run_succeeded"
            ]
        );
    }

    #[tokio::test]
    async fn test_sequence_failure_is_fatal() {
        let later = Arc::new(AtomicUsize::new(0));
        let mut b = TopologyBuilder::new("wf");
        b.add_sequence(vec![failing_step("a"), counted_step("b", later.clone())])
            .unwrap();
        let engine = engine_with(b.commit().unwrap());

        let (state, events) = run_to_end(&engine, json!({})).await;
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.result("a").unwrap().status, StepStatus::Failed);
        assert!(state.result("a").unwrap().error.as_deref().unwrap().contains("boom"));
        assert!(state.result("b").is_none());
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert!(matches!(events.last(), Some(RunEvent::RunFailed { .. })));
    }

    #[tokio::test]
    async fn test_join_waits_for_every_member() {
        let mut b = TopologyBuilder::new("wf");
        b.add_parallel(vec![slow_step("slow", 30), slow_step("fast", 1), slow_step("mid", 10)])
            .unwrap()
            .add_sequence(vec![StepDefinition::new("join", |ctx: StepContext| async move {
                let seen = ["slow", "fast", "mid"]
                    .iter()
                    .filter(|id| ctx.output(id).is_ok())
                    .count();
                ctx.complete(json!({ "seen": seen }))
            })])
            .unwrap();
        let engine = engine_with(b.commit().unwrap());

        let (state, events) = run_to_end(&engine, json!({})).await;
        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(state.output("join"), Some(&json!({"seen": 3})));

        let completed = events
            .iter()
            .position(|e| matches!(e, RunEvent::ParallelCompleted { succeeded: true, .. }))
            .unwrap();
        let join_started = events
            .iter()
            .position(|e| matches!(e, RunEvent::StepStarted { step_id, .. } if step_id == "join"))
            .unwrap();
        assert!(completed < join_started);
    }

    #[tokio::test]
    async fn test_parallel_failure_lets_siblings_finish() {
        let after = Arc::new(AtomicUsize::new(0));
        let mut b = TopologyBuilder::new("wf");
        b.add_parallel(vec![failing_step("bad"), slow_step("good", 20)])
            .unwrap()
            .add_sequence(vec![counted_step("after", after.clone())])
            .unwrap();
        let engine = engine_with(b.commit().unwrap());

        let (state, events) = run_to_end(&engine, json!({})).await;
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.result("good").unwrap().status, StepStatus::Succeeded);
        assert_eq!(state.result("bad").unwrap().status, StepStatus::Failed);
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert!(events
            .iter()
            .any(|e| matches!(e, RunEvent::ParallelCompleted { succeeded: false, .. })));
    }

    fn flagged(id: &'static str) -> impl Fn(&RunState) -> bool + Send + Sync + 'static {
        move |state: &RunState| state.input["arm"] == json!(id)
    }

    fn branching() -> Arc<WorkflowTopology> {
        let mut b = TopologyBuilder::new("wf");
        b.add_branch(vec![
            BranchArm::new("first", flagged("first"), vec![emit_step("one", json!({}))]),
            BranchArm::new("second", flagged("second"), vec![emit_step("two", json!({}))]),
            BranchArm::new("also-first", flagged("first"), vec![emit_step("three", json!({}))]),
        ])
        .unwrap()
        .add_sequence(vec![emit_step("tail", json!({}))])
        .unwrap();
        b.commit().unwrap()
    }

    #[tokio::test]
    async fn test_branch_first_match_wins() {
        let engine = engine_with(branching());

        let (state, events) = run_to_end(&engine, json!({"arm": "first"})).await;
        assert!(state.result("one").is_some());
        assert!(state.result("three").is_none());
        assert!(state.result("tail").is_some());
        assert!(events.iter().any(
            |e| matches!(e, RunEvent::BranchEvaluated { selected: Some(l), .. } if l == "first")
        ));

        let (state, _) = run_to_end(&engine, json!({"arm": "second"})).await;
        assert!(state.result("two").is_some());
        assert!(state.result("one").is_none());
    }

    #[tokio::test]
    async fn test_branch_without_match_is_a_no_op() {
        let engine = engine_with(branching());
        let (state, events) = run_to_end(&engine, json!({"arm": "none"})).await;

        assert_eq!(state.status, RunStatus::Succeeded);
        let ids: Vec<_> = state.step_results.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(ids, vec!["tail"]);
        assert!(events
            .iter()
            .any(|e| matches!(e, RunEvent::BranchEvaluated { selected: None, .. })));
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let gate_calls = Arc::new(AtomicUsize::new(0));
        let before = Arc::new(AtomicUsize::new(0));
        let mut b = TopologyBuilder::new("wf");
        b.add_sequence(vec![
            counted_step("before", before.clone()),
            gate_step("gate", gate_calls.clone()),
            emit_step("after", json!({"done": true})),
        ])
        .unwrap();
        let engine = engine_with(b.commit().unwrap());

        let (state, events) = run_to_end(&engine, json!({"host": "a"})).await;
        assert_eq!(state.status, RunStatus::Suspended);
        let marker = state.suspension.clone().unwrap();
        assert_eq!(marker.step_id, "gate");
        assert_eq!(marker.payload["reason"], "needs approval");
        assert_eq!(state.result("gate").unwrap().status, StepStatus::Suspended);
        assert!(state.result("after").is_none());
        assert!(matches!(events.last(), Some(RunEvent::RunSuspended { .. })));

        let events: Vec<RunEvent> = engine
            .resume(&state.run_id, json!({"force": true}))
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.first().map(|e| e.kind()), Some("run_resumed"));
        assert!(matches!(events.last(), Some(RunEvent::RunSucceeded { .. })));

        let state = engine.run_state(&state.run_id).unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);
        assert!(state.suspension.is_none());
        assert_eq!(state.output("gate"), Some(&json!({"forced": true})));
        assert_eq!(state.output("after"), Some(&json!({"done": true})));
        // Steps before the suspension point are not replayed
        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(gate_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resume_without_force_suspends_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut b = TopologyBuilder::new("wf");
        b.add_sequence(vec![gate_step("gate", calls)]).unwrap();
        let engine = engine_with(b.commit().unwrap());

        let (state, _) = run_to_end(&engine, json!({})).await;
        let events: Vec<RunEvent> = engine
            .resume(&state.run_id, json!({"force": false}))
            .unwrap()
            .collect()
            .await;
        assert!(matches!(events.last(), Some(RunEvent::RunSuspended { .. })));
        assert_eq!(
            engine.run_state(&state.run_id).unwrap().status,
            RunStatus::Suspended
        );
    }

    #[tokio::test]
    async fn test_resume_inside_parallel_group_and_branch_arm() {
        let mut b = TopologyBuilder::new("wf");
        b.add_parallel(vec![
            gate_step("gate", Arc::new(AtomicUsize::new(0))),
            emit_step("sibling", json!({})),
        ])
        .unwrap()
        .add_branch(vec![BranchArm::new(
            "only",
            |_: &RunState| true,
            vec![
                gate_step("arm-gate", Arc::new(AtomicUsize::new(0))),
                emit_step("arm-tail", json!({})),
            ],
        )])
        .unwrap()
        .add_sequence(vec![emit_step("end", json!({}))])
        .unwrap();
        let engine = engine_with(b.commit().unwrap());

        let (state, _) = run_to_end(&engine, json!({})).await;
        assert_eq!(state.suspension.as_ref().unwrap().step_id, "gate");
        assert_eq!(state.result("sibling").unwrap().status, StepStatus::Succeeded);

        // Only the resumed step sees the payload, so the arm gate parks the run again
        let _: Vec<_> = engine
            .resume(&state.run_id, json!({"force": true}))
            .unwrap()
            .collect()
            .await;
        let state = engine.run_state(&state.run_id).unwrap();
        assert_eq!(state.status, RunStatus::Suspended);
        assert_eq!(state.suspension.as_ref().unwrap().step_id, "arm-gate");

        let _: Vec<_> = engine
            .resume(&state.run_id, json!({"force": true}))
            .unwrap()
            .collect()
            .await;
        let state = engine.run_state(&state.run_id).unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);
        let ids: Vec<_> = state.step_results.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(ids, vec!["gate", "sibling", "arm-gate", "arm-tail", "end"]);
    }

    /// Reports which outputs it could see; suspends unless the input carries
    /// `force: true`.
    fn observing_gate(id: &str) -> StepDefinition {
        StepDefinition::new(id, |ctx: StepContext| async move {
            let mut seen: Vec<String> = ctx.outputs().keys().cloned().collect();
            seen.sort();
            if ctx.input()["force"] == json!(true) {
                ctx.complete(json!({ "seen": seen }))
            } else {
                ctx.suspend(json!({ "reason": "needs approval" }))
            }
        })
    }

    fn observer(id: &str) -> StepDefinition {
        StepDefinition::new(id, |ctx: StepContext| async move {
            let mut seen: Vec<String> = ctx.outputs().keys().cloned().collect();
            seen.sort();
            ctx.complete(json!({ "seen": seen }))
        })
    }

    fn by_step(state: &RunState) -> Vec<StepResult> {
        let mut results = state.step_results.clone();
        results.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        results
    }

    #[tokio::test]
    async fn test_resumed_run_matches_uninterrupted_run() {
        let mut b = TopologyBuilder::new("wf");
        b.add_sequence(vec![emit_step("before", json!({"v": 1}))])
            .unwrap()
            .add_parallel(vec![observing_gate("gate"), observer("sibling")])
            .unwrap()
            .add_sequence(vec![observer("after")])
            .unwrap();
        let engine = engine_with(b.commit().unwrap());

        let (direct, _) = run_to_end(&engine, json!({"host": "a", "force": true})).await;
        assert_eq!(direct.status, RunStatus::Succeeded);

        let (parked, _) = run_to_end(&engine, json!({"host": "a"})).await;
        assert_eq!(parked.status, RunStatus::Suspended);
        let _: Vec<_> = engine
            .resume(&parked.run_id, json!({"force": true}))
            .unwrap()
            .collect()
            .await;
        let resumed = engine.run_state(&parked.run_id).unwrap();
        assert_eq!(resumed.status, RunStatus::Succeeded);

        assert_eq!(by_step(&resumed), by_step(&direct));
        // Group members never see each other
        assert_eq!(resumed.output("gate"), Some(&json!({"seen": ["before"]})));
        assert_eq!(
            resumed.output("after"),
            Some(&json!({"seen": ["before", "gate", "sibling"]}))
        );
    }

    #[tokio::test]
    async fn test_resume_is_exclusive_across_engines_on_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let calls = Arc::new(AtomicUsize::new(0));
        let mut b = TopologyBuilder::new("wf");
        b.add_sequence(vec![gate_step("gate", calls.clone())]).unwrap();
        let topology = b.commit().unwrap();

        let engine_on = |topology: Arc<WorkflowTopology>| {
            let store = Arc::new(RunStateStore::open(&path).unwrap());
            let mut engine = RunEngine::new(store, Capabilities::new());
            engine.register(topology);
            engine
        };
        let first = engine_on(topology.clone());
        let second = engine_on(topology);

        let (state, _) = run_to_end(&first, json!({})).await;
        assert_eq!(state.status, RunStatus::Suspended);

        let events = first.resume(&state.run_id, json!({"force": true})).unwrap();
        // The transition is durable before the traversal starts
        let seen = second.run_state(&state.run_id).unwrap();
        assert_eq!(seen.status, RunStatus::Running);
        assert!(seen.suspension.is_none());
        assert!(matches!(
            second.resume(&state.run_id, json!({"force": true})),
            Err(VigilError::RunBusy(_))
        ));

        let _: Vec<_> = events.collect().await;
        assert!(matches!(
            second.resume(&state.run_id, json!({"force": true})),
            Err(VigilError::InvalidResumeState { status: RunStatus::Succeeded, .. })
        ));
        // Once on start, once on the single resume
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_lifecycle_calls_do_not_mutate() {
        let mut b = TopologyBuilder::new("wf");
        b.add_sequence(vec![emit_step("a", json!({}))]).unwrap();
        let engine = engine_with(b.commit().unwrap());

        let created = engine
            .create_run("wf", json!({}), Correlation::default())
            .unwrap();
        assert!(matches!(
            engine.resume(&created.run_id, json!({})),
            Err(VigilError::InvalidResumeState { status: RunStatus::Pending, .. })
        ));
        assert_eq!(engine.run_state(&created.run_id).unwrap(), created);

        let _: Vec<_> = engine.start(&created.run_id).unwrap().collect().await;
        let done = engine.run_state(&created.run_id).unwrap();
        assert!(matches!(
            engine.start(&created.run_id),
            Err(VigilError::InvalidStartState { status: RunStatus::Succeeded, .. })
        ));
        assert!(matches!(
            engine.resume(&created.run_id, json!({})),
            Err(VigilError::InvalidResumeState { .. })
        ));
        assert_eq!(engine.run_state(&created.run_id).unwrap(), done);

        assert!(matches!(
            engine.start(&RunId::from_string("missing")),
            Err(VigilError::RunNotFound(_))
        ));
        assert!(matches!(
            engine.create_run("other", json!({}), Correlation::default()),
            Err(VigilError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_trigger_input_is_validated() {
        let mut b = TopologyBuilder::new("wf");
        b.trigger(Contract::new().field("host", FieldKind::String))
            .unwrap()
            .add_sequence(vec![emit_step("a", json!({}))])
            .unwrap();
        let engine = engine_with(b.commit().unwrap());

        assert!(matches!(
            engine.create_run("wf", json!({"host": 3}), Correlation::default()),
            Err(VigilError::Topology(_))
        ));
        assert!(engine
            .create_run("wf", json!({"host": "a"}), Correlation::default())
            .is_ok());
    }

    #[tokio::test]
    async fn test_leased_run_is_busy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut b = TopologyBuilder::new("wf");
        b.add_sequence(vec![gate_step("gate", calls)]).unwrap();
        let engine = engine_with(b.commit().unwrap());
        let (state, _) = run_to_end(&engine, json!({})).await;

        let lease = engine.store().try_lease(&state.run_id).unwrap();
        assert!(matches!(
            engine.resume(&state.run_id, json!({"force": true})),
            Err(VigilError::RunBusy(_))
        ));
        drop(lease);
        assert!(engine.resume(&state.run_id, json!({"force": true})).is_ok());
    }

    #[tokio::test]
    async fn test_dropped_consumer_does_not_stop_the_run() {
        let mut b = TopologyBuilder::new("wf");
        b.add_sequence(vec![slow_step("a", 5), slow_step("b", 5)]).unwrap();
        let engine = engine_with(b.commit().unwrap());
        let state = engine
            .create_run("wf", json!({}), Correlation::default())
            .unwrap();

        drop(engine.start(&state.run_id).unwrap());

        let mut status = RunStatus::Running;
        for _ in 0..100 {
            status = engine.run_state(&state.run_id).unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_terminal_runs_are_scored() {
        let mut b = TopologyBuilder::new("wf");
        b.add_sequence(vec![emit_step(
            "analysis",
            json!({"text": "Google Chrome at 99%"}),
        )])
        .unwrap();
        let scores = Arc::new(ScoreStore::in_memory().unwrap());
        let pipeline = ScoringPipeline::new(
            Arc::new(MarkerScorer::new("markers", "Google Chrome", "99%")),
            scores.clone(),
        );
        let engine = engine_with(b.commit().unwrap()).with_scoring(Arc::new(pipeline));

        let (state, _) = run_to_end(&engine, json!({})).await;
        let records = scores.list_for_entity(state.run_id.as_str()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].score, 1.0);
    }
}
