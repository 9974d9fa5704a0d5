use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread/resource pair that scopes recall queries for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    pub thread_id: String,
    pub resource_id: String,
}

impl Correlation {
    pub fn new(thread_id: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Key used to scope similarity queries.
    pub fn scope_key(&self) -> &str {
        &self.resource_id
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "suspended" => Some(Self::Suspended),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Status only moves forward, except for the `running -> suspended -> running` cycle.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Suspended)
                | (Suspended, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Suspended, Failed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Succeeded,
    Failed,
    Suspended,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn succeeded(step_id: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Succeeded,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn suspended(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Suspended,
            output: None,
            error: None,
        }
    }
}

/// Where a run is parked, plus the payload the suspending step wants echoed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspensionMarker {
    pub step_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Mutable state of one execution instance of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: RunId,
    pub workflow_id: String,
    pub status: RunStatus,
    /// Trigger input the run was created with.
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<SuspensionMarker>,
    pub correlation: Correlation,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(
        workflow_id: impl Into<String>,
        input: serde_json::Value,
        correlation: Correlation,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            workflow_id: workflow_id.into(),
            status: RunStatus::Pending,
            input,
            step_results: Vec::new(),
            suspension: None,
            correlation,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    /// Output of a step, only if it succeeded.
    pub fn output(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.result(step_id)
            .filter(|r| r.status == StepStatus::Succeeded)
            .and_then(|r| r.output.as_ref())
    }

    /// Snapshot of every succeeded step output, keyed by step id.
    pub fn outputs(&self) -> std::collections::HashMap<String, serde_json::Value> {
        self.step_results
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .filter_map(|r| r.output.clone().map(|o| (r.step_id.clone(), o)))
            .collect()
    }

    /// Record a step result, keeping insertion order and unique keys.
    ///
    /// Returns `false` (and leaves the state untouched) when the step already
    /// holds a terminal result.
    pub fn record(&mut self, result: StepResult) -> bool {
        match self
            .step_results
            .iter_mut()
            .find(|r| r.step_id == result.step_id)
        {
            Some(existing) if existing.status.is_terminal() => return false,
            Some(existing) => *existing = result,
            None => self.step_results.push(result),
        }
        self.touch();
        true
    }

    /// Move to a new status. Returns `false` for a transition the lifecycle forbids.
    pub fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.touch();
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A persisted run snapshot used for similarity recall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// A ranked match returned by a similarity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// One recall result handed to steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallHit {
    pub score: f32,
    pub metadata: serde_json::Value,
    pub content: String,
}

/// An immutable quality score attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRecord {
    pub id: String,
    pub entity_id: String,
    pub scorer_id: String,
    pub score: f64,
    pub rationale: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

// ── Collaborator payloads ───────────────────────────────────────

/// Structured health snapshot returned by a metrics provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub system: SystemInfo,
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub platform: String,
    pub release: String,
    pub arch: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
    pub load_average: [f64; 3],
    pub uptime: u64,
    pub cpus: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuUsage {
    pub usage_percentage: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub total: String,
    pub free: String,
    pub usage_percentage: String,
}

/// Format a percentage the way health snapshots carry it (`"42.50%"`).
pub fn format_percentage(value: f64) -> String {
    format!("{:.2}%", value)
}

/// Parse a `"42.50%"` style value. Tolerates a missing `%` sign.
pub fn parse_percentage(s: &str) -> Option<f64> {
    s.trim().trim_end_matches('%').trim().parse().ok()
}

/// Round-trip latency, or the `"offline"` sentinel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NetworkLatency {
    Millis(u64),
    Offline,
}

impl Serialize for NetworkLatency {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Millis(ms) => serializer.serialize_u64(*ms),
            Self::Offline => serializer.serialize_str("offline"),
        }
    }
}

impl<'de> Deserialize<'de> for NetworkLatency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(Self::Millis)
                .ok_or_else(|| serde::de::Error::custom("latency must be a non-negative integer")),
            serde_json::Value::String(s) if s == "offline" => Ok(Self::Offline),
            other => Err(serde::de::Error::custom(format!(
                "expected latency millis or \"offline\", got {}",
                other
            ))),
        }
    }
}

/// One entry from a process sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}
