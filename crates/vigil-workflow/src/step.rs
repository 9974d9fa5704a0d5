use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use vigil_core::error::{Result, VigilError};
use vigil_core::traits::{MetricsProvider, NetworkProbe, ProcessSampler, Reasoner};
use vigil_core::types::{Correlation, RunId};
use vigil_core::RunEvent;
use vigil_memory::RecallService;

// ── Contracts ───────────────────────────────────────────────────

/// JSON kind a contract field must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Any,
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Structural shape of a step output or trigger input.
///
/// Validation is structural only: the value must be an object carrying every
/// required field with the declared kind. An empty contract accepts anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contract {
    fields: Vec<FieldSpec>,
}

impl Contract {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a required field.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Declare an optional field, checked only when present and non-null.
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn declares(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let obj = value
            .as_object()
            .ok_or_else(|| format!("expected an object, got {}", kind_of(value)))?;

        for spec in &self.fields {
            match obj.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("missing required field '{}'", spec.name));
                }
                None | Some(Value::Null) => {}
                Some(v) if !spec.kind.accepts(v) => {
                    return Err(format!(
                        "field '{}' should be {}, got {}",
                        spec.name,
                        spec.kind.name(),
                        kind_of(v)
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Where a step's declared dependency comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Trigger,
    Step(String),
}

/// One entry of a step's declared dependency list, resolved at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub source: Source,
    pub field: Option<String>,
}

impl Requirement {
    pub fn trigger(field: impl Into<String>) -> Self {
        Self {
            source: Source::Trigger,
            field: Some(field.into()),
        }
    }

    /// Depend on a step having succeeded, without naming a field.
    pub fn step(id: impl Into<String>) -> Self {
        Self {
            source: Source::Step(id.into()),
            field: None,
        }
    }

    pub fn step_field(id: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            source: Source::Step(id.into()),
            field: Some(field.into()),
        }
    }
}

// ── Execution ───────────────────────────────────────────────────

/// What a step executor hands back to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Complete(Value),
    /// Park the run; the payload is echoed in the suspension marker.
    Suspend(Value),
}

/// Executor capability of a step.
///
/// Implemented for any `Fn(StepContext) -> impl Future<Output = Result<StepOutcome>>`.
pub trait StepExecutor: Send + Sync + 'static {
    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>>;
}

impl<F, Fut> StepExecutor for F
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
{
    fn execute(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepOutcome>> {
        Box::pin(self(ctx))
    }
}

/// The fixed set of collaborators steps may call.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub metrics: Option<Arc<dyn MetricsProvider>>,
    pub network: Option<Arc<dyn NetworkProbe>>,
    pub processes: Option<Arc<dyn ProcessSampler>>,
    pub reasoner: Option<Arc<dyn Reasoner>>,
    pub recall: Option<Arc<RecallService>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkProbe>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_processes(mut self, processes: Arc<dyn ProcessSampler>) -> Self {
        self.processes = Some(processes);
        self
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    pub fn with_recall(mut self, recall: Arc<RecallService>) -> Self {
        self.recall = Some(recall);
        self
    }
}

fn unavailable(name: &str) -> VigilError {
    VigilError::CapabilityUnavailable(name.to_string())
}

/// Everything a step executor can see and do during one invocation.
#[derive(Clone)]
pub struct StepContext {
    run_id: RunId,
    step_id: String,
    input: Value,
    resume: Option<Value>,
    outputs: Arc<HashMap<String, Value>>,
    correlation: Correlation,
    capabilities: Capabilities,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl StepContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: RunId,
        step_id: String,
        trigger_input: &Value,
        resume: Option<Value>,
        outputs: Arc<HashMap<String, Value>>,
        correlation: Correlation,
        capabilities: Capabilities,
        events: Option<mpsc::Sender<RunEvent>>,
    ) -> Self {
        Self {
            input: merge_input(trigger_input, resume.as_ref()),
            run_id,
            step_id,
            resume,
            outputs,
            correlation,
            capabilities,
            events,
        }
    }

    /// A detached context, for exercising executors outside an engine.
    pub fn detached(step_id: impl Into<String>, input: Value, capabilities: Capabilities) -> Self {
        Self::new(
            RunId::new(),
            step_id.into(),
            &input,
            None,
            Arc::new(HashMap::new()),
            Correlation::default(),
            capabilities,
            None,
        )
    }

    /// Add a prior output to a detached context.
    pub fn with_output(mut self, step_id: impl Into<String>, output: Value) -> Self {
        Arc::make_mut(&mut self.outputs).insert(step_id.into(), output);
        self
    }

    /// Replace the resume payload, re-merging the input.
    pub fn with_resume(mut self, payload: Value) -> Self {
        self.input = merge_input(&self.input, Some(&payload));
        self.resume = Some(payload);
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Trigger input, with the resume payload overlaid when resuming.
    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn resume_payload(&self) -> Option<&Value> {
        self.resume.as_ref()
    }

    pub fn is_resuming(&self) -> bool {
        self.resume.is_some()
    }

    /// Output of a prior succeeded step.
    pub fn output(&self, step_id: &str) -> Result<&Value> {
        self.outputs.get(step_id).ok_or_else(|| {
            VigilError::step(
                &self.step_id,
                format!("no output from step '{}'", step_id),
            )
        })
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }

    pub fn correlation(&self) -> &Correlation {
        &self.correlation
    }

    pub fn metrics(&self) -> Result<&Arc<dyn MetricsProvider>> {
        self.capabilities
            .metrics
            .as_ref()
            .ok_or_else(|| unavailable("metrics provider"))
    }

    pub fn network(&self) -> Result<&Arc<dyn NetworkProbe>> {
        self.capabilities
            .network
            .as_ref()
            .ok_or_else(|| unavailable("network probe"))
    }

    pub fn processes(&self) -> Result<&Arc<dyn ProcessSampler>> {
        self.capabilities
            .processes
            .as_ref()
            .ok_or_else(|| unavailable("process sampler"))
    }

    pub fn reasoner(&self) -> Result<&Arc<dyn Reasoner>> {
        self.capabilities
            .reasoner
            .as_ref()
            .ok_or_else(|| unavailable("reasoner"))
    }

    pub fn recall(&self) -> Result<&Arc<RecallService>> {
        self.capabilities
            .recall
            .as_ref()
            .ok_or_else(|| unavailable("recall service"))
    }

    /// Emit incremental text as a `step_progress` event.
    ///
    /// Waits for channel capacity; a dropped consumer is ignored.
    pub async fn emit_progress(&self, text: impl Into<String>) {
        if let Some(ref tx) = self.events {
            let _ = tx
                .send(RunEvent::StepProgress {
                    run_id: self.run_id.clone(),
                    step_id: self.step_id.clone(),
                    text: text.into(),
                })
                .await;
        }
    }

    pub fn complete(&self, output: Value) -> Result<StepOutcome> {
        Ok(StepOutcome::Complete(output))
    }

    /// Request suspension; `payload` is echoed back in the marker.
    pub fn suspend(&self, payload: Value) -> Result<StepOutcome> {
        Ok(StepOutcome::Suspend(payload))
    }

    pub fn fail(&self, message: impl Into<String>) -> Result<StepOutcome> {
        Err(VigilError::step(&self.step_id, message))
    }
}

/// Shallow overlay of the resume payload's keys onto the trigger input.
fn merge_input(trigger: &Value, resume: Option<&Value>) -> Value {
    match (trigger, resume) {
        (Value::Object(base), Some(Value::Object(overlay))) => {
            let mut merged = base.clone();
            for (k, v) in overlay {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (Value::Null, Some(overlay @ Value::Object(_))) => overlay.clone(),
        _ => trigger.clone(),
    }
}

// ── Step definitions ────────────────────────────────────────────

/// A named unit of work with declared dependencies and output shape.
pub struct StepDefinition {
    id: String,
    description: String,
    requires: Vec<Requirement>,
    output: Contract,
    executor: Box<dyn StepExecutor>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, executor: impl StepExecutor) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            requires: Vec::new(),
            output: Contract::default(),
            executor: Box::new(executor),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn requires(mut self, requirement: Requirement) -> Self {
        self.requires.push(requirement);
        self
    }

    pub fn output(mut self, contract: Contract) -> Self {
        self.output = contract;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requires
    }

    pub fn output_contract(&self) -> &Contract {
        &self.output
    }

    /// Run the executor and check a completed output against the contract.
    pub async fn invoke(&self, ctx: StepContext) -> Result<StepOutcome> {
        let outcome = self.executor.execute(ctx).await?;
        if let StepOutcome::Complete(ref value) = outcome {
            self.output.validate(value).map_err(|msg| {
                VigilError::step(&self.id, format!("output contract violated: {}", msg))
            })?;
        }
        Ok(outcome)
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("requires", &self.requires)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vigil_test_utils::StaticMetrics;

    #[test]
    fn test_contract_validation() {
        let contract = Contract::new()
            .field("text", FieldKind::String)
            .optional("score", FieldKind::Number);

        assert!(contract.validate(&json!({"text": "hi"})).is_ok());
        assert!(contract.validate(&json!({"text": "hi", "score": null})).is_ok());
        assert!(contract.validate(&json!({"text": "hi", "score": 0.5})).is_ok());

        let err = contract.validate(&json!({"score": 1})).unwrap_err();
        assert!(err.contains("missing required field 'text'"));
        let err = contract.validate(&json!({"text": 3})).unwrap_err();
        assert!(err.contains("should be string"));
        assert!(contract.validate(&json!("plain")).is_err());
    }

    #[test]
    fn test_empty_contract_accepts_anything() {
        let contract = Contract::new();
        assert!(contract.validate(&json!(null)).is_ok());
        assert!(contract.validate(&json!([1, 2])).is_ok());
    }

    #[test]
    fn test_merge_input_overlays_resume_keys() {
        let merged = merge_input(
            &json!({"host": "a", "force": false}),
            Some(&json!({"force": true})),
        );
        assert_eq!(merged, json!({"host": "a", "force": true}));

        assert_eq!(merge_input(&json!(null), Some(&json!({"force": true}))), json!({"force": true}));
        // Non-object payloads leave the input untouched
        assert_eq!(merge_input(&json!({"a": 1}), Some(&json!(5))), json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_invoke_checks_output_contract() {
        let step = StepDefinition::new("s", |ctx: StepContext| async move {
            ctx.complete(json!({"wrong": 1}))
        })
        .output(Contract::new().field("text", FieldKind::String));

        let ctx = StepContext::detached("s", json!({}), Capabilities::new());
        let err = step.invoke(ctx).await.unwrap_err();
        assert!(matches!(err, VigilError::StepExecution { ref step, .. } if step == "s"));
    }

    #[tokio::test]
    async fn test_suspend_is_not_contract_checked() {
        let step = StepDefinition::new("s", |ctx: StepContext| async move {
            ctx.suspend(json!({"reason": "wait"}))
        })
        .output(Contract::new().field("text", FieldKind::String));

        let ctx = StepContext::detached("s", json!({}), Capabilities::new());
        assert_eq!(
            step.invoke(ctx).await.unwrap(),
            StepOutcome::Suspend(json!({"reason": "wait"}))
        );
    }

    #[tokio::test]
    async fn test_capabilities() {
        let ctx = StepContext::detached("s", json!({}), Capabilities::new());
        assert!(matches!(ctx.reasoner(), Err(VigilError::CapabilityUnavailable(_))));

        let caps = Capabilities::new().with_metrics(Arc::new(StaticMetrics::new(12.0)));
        let ctx = StepContext::detached("s", json!({}), caps);
        let snap = ctx.metrics().unwrap().fetch().await.unwrap();
        assert_eq!(snap.resources.memory.usage_percentage, "12.00%");
    }

    #[test]
    fn test_context_outputs_and_resume() {
        let ctx = StepContext::detached("b", json!({"x": 1}), Capabilities::new())
            .with_output("a", json!({"v": 2}))
            .with_resume(json!({"force": true}));
        assert_eq!(ctx.output("a").unwrap()["v"], 2);
        assert!(ctx.output("missing").is_err());
        assert_eq!(ctx.input(), &json!({"x": 1, "force": true}));
        assert!(ctx.is_resuming());
    }
}
