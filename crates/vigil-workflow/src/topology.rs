use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use vigil_core::error::{Result, VigilError};
use vigil_core::types::RunState;

use crate::step::{Contract, Source, StepDefinition};

/// Read-only predicate over the current run state.
pub type Predicate = Arc<dyn Fn(&RunState) -> bool + Send + Sync>;

/// One `(predicate, continuation)` pair of a branch node.
#[derive(Clone)]
pub struct BranchArm {
    label: String,
    predicate: Predicate,
    steps: Vec<Arc<StepDefinition>>,
}

impl BranchArm {
    pub fn new<P, I>(label: impl Into<String>, predicate: P, steps: I) -> Self
    where
        P: Fn(&RunState) -> bool + Send + Sync + 'static,
        I: IntoIterator<Item = StepDefinition>,
    {
        Self {
            label: label.into(),
            predicate: Arc::new(predicate),
            steps: steps.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn steps(&self) -> &[Arc<StepDefinition>] {
        &self.steps
    }

    pub fn matches(&self, state: &RunState) -> bool {
        (self.predicate)(state)
    }
}

/// A composition primitive of the topology.
#[derive(Clone)]
pub enum Node {
    Step(Arc<StepDefinition>),
    Parallel(Vec<Arc<StepDefinition>>),
    Branch(Vec<BranchArm>),
}

/// Where a step sits inside a committed topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPosition {
    Top { node: usize },
    Parallel { node: usize, member: usize },
    Arm { node: usize, arm: usize, offset: usize },
}

impl StepPosition {
    /// Index of the top-level node holding the step.
    pub fn node(&self) -> usize {
        match *self {
            Self::Top { node } | Self::Parallel { node, .. } | Self::Arm { node, .. } => node,
        }
    }
}

/// A committed, immutable workflow topology.
pub struct WorkflowTopology {
    id: String,
    trigger: Contract,
    nodes: Vec<Node>,
}

impl WorkflowTopology {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn trigger(&self) -> &Contract {
        &self.trigger
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Every step id in declaration order, including branch continuations.
    pub fn step_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        for node in &self.nodes {
            match node {
                Node::Step(s) => ids.push(s.id()),
                Node::Parallel(members) => ids.extend(members.iter().map(|m| m.id())),
                Node::Branch(arms) => {
                    for arm in arms {
                        ids.extend(arm.steps.iter().map(|s| s.id()));
                    }
                }
            }
        }
        ids
    }

    pub fn locate(&self, step_id: &str) -> Option<StepPosition> {
        for (node, n) in self.nodes.iter().enumerate() {
            match n {
                Node::Step(s) if s.id() == step_id => return Some(StepPosition::Top { node }),
                Node::Step(_) => {}
                Node::Parallel(members) => {
                    if let Some(member) = members.iter().position(|m| m.id() == step_id) {
                        return Some(StepPosition::Parallel { node, member });
                    }
                }
                Node::Branch(arms) => {
                    for (arm, a) in arms.iter().enumerate() {
                        if let Some(offset) = a.steps.iter().position(|s| s.id() == step_id) {
                            return Some(StepPosition::Arm { node, arm, offset });
                        }
                    }
                }
            }
        }
        None
    }

    pub fn step_at(&self, position: StepPosition) -> Option<&Arc<StepDefinition>> {
        match (self.nodes.get(position.node())?, position) {
            (Node::Step(step), StepPosition::Top { .. }) => Some(step),
            (Node::Parallel(members), StepPosition::Parallel { member, .. }) => members.get(member),
            (Node::Branch(arms), StepPosition::Arm { arm, offset, .. }) => {
                arms.get(arm)?.steps.get(offset)
            }
            _ => None,
        }
    }
}

/// Assembles steps into a topology and freezes it on `commit()`.
pub struct TopologyBuilder {
    workflow_id: String,
    trigger: Contract,
    nodes: Vec<Node>,
    committed: Option<Arc<WorkflowTopology>>,
}

impl TopologyBuilder {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            trigger: Contract::default(),
            nodes: Vec::new(),
            committed: None,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.committed.is_some() {
            return Err(VigilError::FrozenTopology(self.workflow_id.clone()));
        }
        Ok(())
    }

    /// Declare the shape of the trigger input.
    pub fn trigger(&mut self, contract: Contract) -> Result<&mut Self> {
        self.ensure_open()?;
        self.trigger = contract;
        Ok(self)
    }

    /// Append steps that run one after another.
    pub fn add_sequence<I>(&mut self, steps: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = StepDefinition>,
    {
        self.ensure_open()?;
        self.nodes
            .extend(steps.into_iter().map(|s| Node::Step(Arc::new(s))));
        Ok(self)
    }

    /// Append a group of steps that run concurrently and join.
    pub fn add_parallel<I>(&mut self, steps: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = StepDefinition>,
    {
        self.ensure_open()?;
        self.nodes
            .push(Node::Parallel(steps.into_iter().map(Arc::new).collect()));
        Ok(self)
    }

    /// Append a branch; arms are tried in order and the first match wins.
    pub fn add_branch(&mut self, arms: Vec<BranchArm>) -> Result<&mut Self> {
        self.ensure_open()?;
        self.nodes.push(Node::Branch(arms));
        Ok(self)
    }

    /// Validate and freeze the topology.
    pub fn commit(&mut self) -> Result<Arc<WorkflowTopology>> {
        self.ensure_open()?;
        self.validate()?;

        let topology = Arc::new(WorkflowTopology {
            id: self.workflow_id.clone(),
            trigger: self.trigger.clone(),
            nodes: std::mem::take(&mut self.nodes),
        });
        self.committed = Some(Arc::clone(&topology));

        debug!(
            workflow_id = %self.workflow_id,
            nodes = topology.nodes.len(),
            "Topology committed"
        );
        Ok(topology)
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(self.error("workflow has no steps"));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        // Steps guaranteed to have succeeded before the current node runs
        let mut available: HashMap<&str, &Contract> = HashMap::new();

        for node in &self.nodes {
            match node {
                Node::Step(step) => {
                    self.check_step(step, &mut seen, &available)?;
                    available.insert(step.id(), step.output_contract());
                }
                Node::Parallel(members) => {
                    if members.is_empty() {
                        return Err(self.error("parallel group is empty"));
                    }
                    // Siblings are not visible to each other
                    for member in members {
                        self.check_step(member, &mut seen, &available)?;
                    }
                    for member in members {
                        available.insert(member.id(), member.output_contract());
                    }
                }
                Node::Branch(arms) => {
                    if arms.is_empty() {
                        return Err(self.error("branch has no arms"));
                    }
                    let mut labels = HashSet::new();
                    for arm in arms {
                        if !labels.insert(arm.label()) {
                            return Err(self.error(&format!(
                                "duplicate branch label '{}'",
                                arm.label()
                            )));
                        }
                        if arm.steps.is_empty() {
                            return Err(self.error(&format!(
                                "branch arm '{}' has no steps",
                                arm.label()
                            )));
                        }
                        let mut local = available.clone();
                        for step in &arm.steps {
                            self.check_step(step, &mut seen, &local)?;
                            local.insert(step.id(), step.output_contract());
                        }
                    }
                    // Arm steps are not guaranteed to run, so nothing becomes available
                }
            }
        }
        Ok(())
    }

    fn check_step<'a>(
        &self,
        step: &'a StepDefinition,
        seen: &mut HashSet<&'a str>,
        available: &HashMap<&str, &Contract>,
    ) -> Result<()> {
        if !seen.insert(step.id()) {
            return Err(self.error(&format!("duplicate step id '{}'", step.id())));
        }

        for req in step.requirements() {
            match &req.source {
                Source::Trigger => {
                    if let Some(ref field) = req.field {
                        if !self.trigger.declares(field) {
                            return Err(self.error(&format!(
                                "step '{}' requires trigger field '{}' which the trigger does not declare",
                                step.id(),
                                field
                            )));
                        }
                    }
                }
                Source::Step(source) => {
                    let contract = available.get(source.as_str()).ok_or_else(|| {
                        self.error(&format!(
                            "step '{}' requires '{}' which is not guaranteed to complete before it",
                            step.id(),
                            source
                        ))
                    })?;
                    if let Some(ref field) = req.field {
                        if !contract.declares(field) {
                            return Err(self.error(&format!(
                                "step '{}' requires field '{}' which '{}' does not declare",
                                step.id(),
                                field,
                                source
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn error(&self, message: &str) -> VigilError {
        VigilError::Topology(format!("{}: {}", self.workflow_id, message))
    }
}
