use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{info, warn};

use vigil_core::error::Result;
use vigil_core::types::{parse_percentage, RunState};
use vigil_workflow::{Contract, FieldKind, Requirement, StepContext, StepDefinition, StepOutcome};

pub const FETCH_HEALTH: &str = "fetchHealth";
pub const PROBE_NETWORK: &str = "probeNetwork";
pub const SAMPLE_PROCESSES: &str = "sampleProcesses";
pub const RECALL_HISTORY: &str = "recallHistory";
pub const ANALYSIS: &str = "analysis";
pub const LOG_CRITICAL: &str = "logCritical";
pub const LOG_NORMAL: &str = "logNormal";

/// System prompt for the reasoner behind the analysis step.
pub const ANALYST_INSTRUCTIONS: &str = "You are a system analyst responsible for monitoring system health. \
When asked to analyze the system, use the provided data to gather metrics \
and provide a concise summary of the system status. \
Specifically, look for correlations between high CPU/memory usage and the top running processes. \
Also check if there is any network latency impact. \
Format your response using HTML tags suitable for embedding in a notification card (e.g., using <strong>, <ul>, <li>). \
Keep it professional but concise.";

/// Memory usage percentage carried by a health snapshot. Missing or
/// unparsable values count as 0.
pub fn memory_usage(health: &Value) -> f64 {
    health
        .pointer("/resources/memory/usagePercentage")
        .and_then(Value::as_str)
        .and_then(parse_percentage)
        .unwrap_or(0.0)
}

/// Memory usage recorded by the run's health step.
pub fn run_memory_usage(state: &RunState) -> f64 {
    state.output(FETCH_HEALTH).map(memory_usage).unwrap_or(0.0)
}

pub fn fetch_health() -> StepDefinition {
    StepDefinition::new(FETCH_HEALTH, |ctx: StepContext| async move {
        let snapshot = ctx.metrics()?.fetch().await?;
        ctx.complete(serde_json::to_value(snapshot)?)
    })
    .describe("Take a structured host health snapshot")
    .output(
        Contract::new()
            .field("status", FieldKind::String)
            .field("resources", FieldKind::Object),
    )
}

pub fn probe_network() -> StepDefinition {
    StepDefinition::new(PROBE_NETWORK, |ctx: StepContext| async move {
        let latency = ctx.network()?.fetch().await;
        ctx.complete(json!({ "latencyMillis": latency }))
    })
    .describe("Measure round-trip latency to the probe target")
    .output(Contract::new().field("latencyMillis", FieldKind::Any))
}

pub fn sample_processes() -> StepDefinition {
    StepDefinition::new(SAMPLE_PROCESSES, |ctx: StepContext| async move {
        let processes = ctx.processes()?.fetch().await;
        ctx.complete(json!({ "processes": processes }))
    })
    .describe("List the busiest processes")
    .output(Contract::new().field("processes", FieldKind::Array))
}

/// Recall runs that resembled this snapshot. Recall problems never fail the step.
pub fn recall_history() -> StepDefinition {
    StepDefinition::new(RECALL_HISTORY, |ctx: StepContext| async move {
        let health = ctx.output(FETCH_HEALTH)?;
        let query = format!(
            "memory usage {} cpu usage {}",
            health
                .pointer("/resources/memory/usagePercentage")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
            health
                .pointer("/resources/cpu/usagePercentage")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        );

        let recalled = match ctx.recall() {
            Ok(recall) => {
                recall
                    .recall(&query, ctx.correlation().scope_key(), 0)
                    .await
            }
            Err(e) => Err(e),
        };
        let matches = match recalled {
            Ok(hits) => serde_json::to_value(hits)?,
            Err(e) => {
                warn!(run_id = %ctx.run_id(), error = %e, "Recall unavailable, continuing without history");
                json!([])
            }
        };
        ctx.complete(json!({ "matches": matches }))
    })
    .describe("Find prior runs resembling the current snapshot")
    .requires(Requirement::step_field(FETCH_HEALTH, "resources"))
    .output(Contract::new().field("matches", FieldKind::Array))
}

/// Ask the reasoner for a report, parking the run first when memory is over
/// `threshold` unless the resume payload carries `force: true`.
pub fn analysis(threshold: f64) -> StepDefinition {
    StepDefinition::new(ANALYSIS, move |ctx: StepContext| async move {
        let health = ctx.output(FETCH_HEALTH)?.clone();
        let usage = memory_usage(&health);
        let forced = ctx
            .resume_payload()
            .and_then(|p| p.get("force"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if usage > threshold && !forced {
            return ctx.suspend(json!({
                "reason": format!(
                    "Memory usage {:.2}% exceeds the {}% threshold; resume with {{\"force\": true}} to analyze anyway",
                    usage, threshold
                ),
                "usagePercentage": health.pointer("/resources/memory/usagePercentage"),
            }));
        }

        let prompt = build_prompt(
            &health,
            ctx.output(PROBE_NETWORK)?,
            ctx.output(SAMPLE_PROCESSES)?,
            ctx.output(RECALL_HISTORY)?,
        );
        analyze(&ctx, prompt).await
    })
    .describe("Summarize host health with the reasoner")
    .requires(Requirement::step_field(FETCH_HEALTH, "resources"))
    .requires(Requirement::step_field(PROBE_NETWORK, "latencyMillis"))
    .requires(Requirement::step_field(SAMPLE_PROCESSES, "processes"))
    .requires(Requirement::step_field(RECALL_HISTORY, "matches"))
    .output(Contract::new().field("text", FieldKind::String))
}

async fn analyze(ctx: &StepContext, prompt: String) -> Result<StepOutcome> {
    let reasoner = ctx.reasoner()?;
    let mut stream = reasoner
        .generate_stream(prompt, ctx.correlation().clone())
        .await?;

    let mut text = String::new();
    while let Some(fragment) = stream.next().await {
        let fragment = fragment?;
        ctx.emit_progress(fragment.as_str()).await;
        text.push_str(&fragment);
    }
    ctx.complete(json!({ "text": text }))
}

pub fn build_prompt(health: &Value, network: &Value, processes: &Value, history: &Value) -> String {
    let mut prompt = format!(
        "Analyze the following system health data and provide a status report: {}\n\n\
         Network latency: {}\n\
         Top processes: {}",
        health, network["latencyMillis"], processes["processes"]
    );

    if let Some(matches) = history["matches"].as_array().filter(|m| !m.is_empty()) {
        prompt.push_str("\n\nSimilar past runs:");
        for hit in matches {
            prompt.push_str(&format!(
                "\n- (similarity {:.2}) {}",
                hit["score"].as_f64().unwrap_or(0.0),
                hit["content"].as_str().unwrap_or_default()
            ));
        }
    }
    prompt
}

pub fn log_critical() -> StepDefinition {
    StepDefinition::new(LOG_CRITICAL, |ctx: StepContext| async move {
        warn!(run_id = %ctx.run_id(), "CRITICAL: High memory usage detected");
        ctx.complete(json!({ "status": "CRITICAL" }))
    })
    .output(Contract::new().field("status", FieldKind::String))
}

pub fn log_normal() -> StepDefinition {
    StepDefinition::new(LOG_NORMAL, |ctx: StepContext| async move {
        info!(run_id = %ctx.run_id(), "System operating normally");
        ctx.complete(json!({ "status": "NORMAL" }))
    })
    .output(Contract::new().field("status", FieldKind::String))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vigil_test_utils::{health_snapshot, ScriptedReasoner, StaticMetrics};
    use vigil_workflow::Capabilities;

    #[test]
    fn test_memory_usage_parsing() {
        let health = serde_json::to_value(health_snapshot(95.0)).unwrap();
        assert_eq!(memory_usage(&health), 95.0);
        assert_eq!(memory_usage(&json!({})), 0.0);
        assert_eq!(
            memory_usage(&json!({"resources": {"memory": {"usagePercentage": "n/a"}}})),
            0.0
        );
    }

    #[test]
    fn test_prompt_includes_history() {
        let prompt = build_prompt(
            &json!({"status": "operational"}),
            &json!({"latencyMillis": "offline"}),
            &json!({"processes": []}),
            &json!({"matches": [{"score": 0.9, "content": "Chrome was hot"}]}),
        );
        assert!(prompt.starts_with("Analyze the following system health data"));
        assert!(prompt.contains("Network latency: \"offline\""));
        assert!(prompt.contains("(similarity 0.90) Chrome was hot"));

        let prompt = build_prompt(&json!({}), &json!({}), &json!({}), &json!({"matches": []}));
        assert!(!prompt.contains("Similar past runs"));
    }

    #[tokio::test]
    async fn test_fetch_health_outputs_snapshot() {
        let caps = Capabilities::new().with_metrics(Arc::new(StaticMetrics::new(40.0)));
        let ctx = StepContext::detached(FETCH_HEALTH, json!({}), caps);
        match fetch_health().invoke(ctx).await.unwrap() {
            StepOutcome::Complete(out) => assert_eq!(memory_usage(&out), 40.0),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    fn analysis_ctx(usage: f64, reasoner: Arc<ScriptedReasoner>) -> StepContext {
        let caps = Capabilities::new().with_reasoner(reasoner);
        StepContext::detached(ANALYSIS, json!({}), caps)
            .with_output(FETCH_HEALTH, serde_json::to_value(health_snapshot(usage)).unwrap())
            .with_output(PROBE_NETWORK, json!({"latencyMillis": 12}))
            .with_output(SAMPLE_PROCESSES, json!({"processes": []}))
            .with_output(RECALL_HISTORY, json!({"matches": []}))
    }

    #[tokio::test]
    async fn test_analysis_suspends_over_threshold() {
        let reasoner = Arc::new(ScriptedReasoner::new(["unused"]));
        let outcome = analysis(90.0)
            .invoke(analysis_ctx(95.0, reasoner.clone()))
            .await
            .unwrap();
        match outcome {
            StepOutcome::Suspend(payload) => {
                assert_eq!(payload["usagePercentage"], "95.00%");
                assert!(payload["reason"].as_str().unwrap().contains("90% threshold"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(reasoner.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_analysis_forced_streams_the_report() {
        let reasoner = Arc::new(ScriptedReasoner::new(["<strong>ok</strong>", " and calm"]));
        let ctx = analysis_ctx(95.0, reasoner.clone()).with_resume(json!({"force": true}));
        let outcome = analysis(90.0).invoke(ctx).await.unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Complete(json!({"text": "<strong>ok</strong> and calm"}))
        );
        assert_eq!(reasoner.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_recall_failure_is_not_fatal() {
        let ctx = StepContext::detached(RECALL_HISTORY, json!({}), Capabilities::new())
            .with_output(FETCH_HEALTH, serde_json::to_value(health_snapshot(50.0)).unwrap());
        let outcome = recall_history().invoke(ctx).await.unwrap();
        assert_eq!(outcome, StepOutcome::Complete(json!({"matches": []})));
    }
}
