use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vigil_core::config::{dirs_home, AppConfig};
use vigil_core::traits::{EmbeddingProvider, SimilarityStore};
use vigil_core::types::{Correlation, RunId, RunStatus};
use vigil_core::RunEvent;
use vigil_memory::{HttpEmbeddingProvider, RecallService, SqliteSimilarityStore};
use vigil_probes::{HttpNetworkProbe, ProcMetricsProvider, PsProcessSampler};
use vigil_watchdog::ANALYST_INSTRUCTIONS;
use vigil_workflow::{
    Capabilities, CronScheduler, EventRelay, RunEngine, RunEventStream, RunLogger,
    RunStateStore, ScoreStore,
};

#[derive(Parser)]
#[command(name = "vigil", version, about = "Durable system-watchdog workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "vigil.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start a watchdog run, streaming its events as JSON lines
    Run,
    /// Resume a suspended run
    Resume {
        run_id: String,
        /// Merge `{"force": true}` into the payload
        #[arg(long)]
        force: bool,
        /// Resume payload as a JSON object
        #[arg(long)]
        payload: Option<String>,
    },
    /// Show one run, or list recent runs
    Status {
        run_id: Option<String>,
        /// Only list runs with this status
        #[arg(long)]
        filter: Option<String>,
    },
    /// Show the scores recorded against a run
    Scores { run_id: String },
    /// Find past runs resembling a query
    Recall {
        #[arg(required = true)]
        query: Vec<String>,
        /// Number of matches (0 uses the configured default)
        #[arg(long, default_value = "0")]
        top_k: usize,
    },
    /// Run the watchdog on its cron schedule until Ctrl-C
    Watch,
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let host = Host::build(config)?;

    match cli.command {
        Commands::Run => {
            host.require_reasoner()?;
            let state = host.engine.create_run(
                &host.config.watchdog.workflow_id,
                json!({}),
                host.correlation(),
            )?;
            let events = host.engine.start(&state.run_id)?;
            host.follow(events).await?;
        }
        Commands::Resume {
            run_id,
            force,
            payload,
        } => {
            host.require_reasoner()?;
            let payload = resume_payload(payload.as_deref(), force)?;
            let events = host.engine.resume(&RunId::from_string(&run_id), payload)?;
            host.follow(events).await?;
        }
        Commands::Status { run_id, filter } => match run_id {
            Some(id) => {
                let state = host.engine.run_state(&RunId::from_string(&id))?;
                println!("{}", serde_json::to_string_pretty(&state)?);
            }
            None => {
                let status = match filter {
                    Some(s) => Some(
                        RunStatus::parse(&s)
                            .with_context(|| format!("unknown run status '{}'", s))?,
                    ),
                    None => None,
                };
                for state in host.engine.store().list(status)? {
                    println!(
                        "{}  {:<9}  {}  {}",
                        state.run_id,
                        state.status,
                        state.updated_at.format("%Y-%m-%d %H:%M:%S"),
                        state
                            .suspension
                            .map(|m| format!("parked at {}", m.step_id))
                            .unwrap_or_default()
                    );
                }
            }
        },
        Commands::Scores { run_id } => {
            for record in host.scores.list_for_entity(&run_id)? {
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
        }
        Commands::Recall { query, top_k } => {
            let query = query.join(" ");
            let hits = host
                .recall
                .recall(&query, &host.config.watchdog.resource_id, top_k)
                .await?;
            if hits.is_empty() {
                println!("No similar runs recorded.");
            }
            for hit in hits {
                println!("[{:.3}] {}", hit.score, hit.content);
            }
        }
        Commands::Watch => {
            host.require_reasoner()?;
            host.watch().await?;
        }
        Commands::Config => {}
    }

    Ok(())
}

/// Everything the commands share: stores, engine and recall.
struct Host {
    config: AppConfig,
    engine: Arc<RunEngine>,
    scores: Arc<ScoreStore>,
    recall: Arc<RecallService>,
}

impl Host {
    fn build(config: AppConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(config.workspace_dir()).ok();
        let db_path = config.database_path();

        let runs = Arc::new(RunStateStore::open(&db_path)?);
        let scores = Arc::new(ScoreStore::open(&db_path)?);
        let memory: Arc<dyn SimilarityStore> = Arc::new(SqliteSimilarityStore::open(&db_path)?);
        let embedder: Option<Arc<dyn EmbeddingProvider>> = config
            .embedding
            .as_ref()
            .map(|e| Arc::new(HttpEmbeddingProvider::from_config(e)) as Arc<dyn EmbeddingProvider>);
        let recall = Arc::new(RecallService::new(
            memory.clone(),
            embedder.clone(),
            config.recall.top_k,
        ));

        let mut capabilities = Capabilities::new()
            .with_metrics(Arc::new(ProcMetricsProvider::new()))
            .with_network(Arc::new(HttpNetworkProbe::new(
                &config.watchdog.probe_url,
                config.watchdog.probe_timeout_ms,
            )))
            .with_processes(Arc::new(PsProcessSampler::new(config.watchdog.top_processes)))
            .with_recall(recall.clone());
        if let Some(ref model) = config.model {
            capabilities = capabilities
                .with_reasoner(vigil_llm::create_reasoner(model, Some(ANALYST_INSTRUCTIONS)));
            info!(provider = %model.provider, model = %model.model_id, "Reasoner configured");
        }

        let mut pipeline = vigil_watchdog::scoring_pipeline(&config.scoring, scores.clone())?;
        match embedder {
            Some(embedder) => pipeline = pipeline.with_memory(embedder, memory),
            None => info!("No [embedding] section, run memory disabled"),
        }

        let mut engine = RunEngine::new(runs, capabilities)
            .with_scoring(Arc::new(pipeline))
            .with_event_buffer(config.engine.event_buffer);
        engine.register(vigil_watchdog::build_topology(&config.watchdog)?);

        Ok(Self {
            config,
            engine: Arc::new(engine),
            scores,
            recall,
        })
    }

    fn require_reasoner(&self) -> anyhow::Result<()> {
        if self.config.model.is_none() {
            bail!("no [model] section configured; the analysis step needs a reasoner");
        }
        Ok(())
    }

    fn correlation(&self) -> Correlation {
        Correlation::new(
            &self.config.watchdog.thread_id,
            &self.config.watchdog.resource_id,
        )
    }

    fn spawn_logger(&self, relay: &EventRelay) -> Option<JoinHandle<()>> {
        if !self.config.log.enabled {
            return None;
        }
        let events = relay.subscribe(self.config.engine.event_buffer);
        let logger = RunLogger::new(self.config.log_dir(), self.config.log.level);
        Some(tokio::spawn(logger.run(events)))
    }

    /// Print every event to stdout while relaying it to the run logger.
    async fn follow(&self, events: RunEventStream) -> anyhow::Result<()> {
        let relay = EventRelay::new();
        let logger = self.spawn_logger(&relay);
        let last = relay.pump(events.inspect(print_event)).await;
        drop(relay);
        if let Some(handle) = logger {
            handle.await.ok();
        }

        match last {
            Some(RunEvent::RunSuspended {
                run_id, step_id, ..
            }) => {
                eprintln!(
                    "Run {} suspended at '{}'. Resume with: vigil resume {} --force",
                    run_id, step_id, run_id
                );
            }
            Some(RunEvent::RunFailed { run_id, error }) => bail!("run {} failed: {}", run_id, error),
            Some(RunEvent::RunSucceeded { run_id }) => eprintln!("Run {} succeeded", run_id),
            _ => bail!("event stream ended before the run settled"),
        }
        Ok(())
    }

    async fn watch(&self) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down watchdog...");
            cancel_clone.cancel();
        });

        let relay = Arc::new(EventRelay::new());
        let logger = self.spawn_logger(&relay);
        let scheduler = CronScheduler::new(
            &self.config.watchdog.schedule,
            self.engine.clone(),
            relay.clone(),
            &self.config.watchdog.workflow_id,
            json!({}),
            self.correlation(),
            cancel,
        )?;
        scheduler.run().await;

        drop(scheduler);
        drop(relay);
        if let Some(handle) = logger {
            handle.await.ok();
        }
        Ok(())
    }
}

fn print_event(event: &RunEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "Failed to serialize event"),
    }
}

fn resume_payload(raw: Option<&str>, force: bool) -> anyhow::Result<Value> {
    let mut payload: Value = match raw {
        Some(text) => serde_json::from_str(text).context("--payload must be valid JSON")?,
        None => json!({}),
    };
    if force {
        match payload.as_object_mut() {
            Some(obj) => {
                obj.insert("force".to_string(), Value::Bool(true));
            }
            None => bail!("--payload must be a JSON object when combined with --force"),
        }
    }
    Ok(payload)
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".vigil").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!("No config file found, using defaults");
    Ok(AppConfig::default())
}
