use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};

/// Top-level Vigil configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub embedding: Option<EmbeddingConfig>,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub recall: RecallConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// SQLite database for run state and scores. Default: <workspace>/vigil.db
    #[serde(default)]
    pub database: Option<String>,
    /// Capacity of the bounded event channel returned by start/resume.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            database: None,
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_workspace() -> String { "~/.vigil".to_string() }
fn default_event_buffer() -> usize { 32 }

/// System-watchdog workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_workflow_id")]
    pub workflow_id: String,
    /// Memory usage percentage above which the run is treated as critical.
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_thread_id")]
    pub thread_id: String,
    #[serde(default = "default_resource_id")]
    pub resource_id: String,
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_top_processes")]
    pub top_processes: usize,
    /// Cron expression (with seconds) for `vigil watch`.
    #[serde(default = "default_schedule")]
    pub schedule: String,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            workflow_id: default_workflow_id(),
            memory_threshold: default_memory_threshold(),
            thread_id: default_thread_id(),
            resource_id: default_resource_id(),
            probe_url: default_probe_url(),
            probe_timeout_ms: default_probe_timeout_ms(),
            top_processes: default_top_processes(),
            schedule: default_schedule(),
        }
    }
}

fn default_workflow_id() -> String { "system-watchdog".to_string() }
fn default_memory_threshold() -> f64 { 90.0 }
fn default_thread_id() -> String { "watchdog".to_string() }
fn default_resource_id() -> String { "localhost".to_string() }
fn default_probe_url() -> String { "https://www.google.com".to_string() }
fn default_probe_timeout_ms() -> u64 { 3000 }
fn default_top_processes() -> usize { 5 }
fn default_schedule() -> String { "0 */5 * * * *".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 2048 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for reasoner requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// OpenAI-compatible embedding endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dims")]
    pub dimensions: usize,
}

fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dims() -> usize { 1536 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_scorer_id")]
    pub scorer_id: String,
    /// Substrings whose presence in the analysis drives the score.
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
    #[serde(default = "default_analysis_step")]
    pub analysis_step: String,
    #[serde(default = "default_analysis_field")]
    pub analysis_field: String,
    /// Steps whose outputs form the scorer input. Empty = every succeeded step.
    #[serde(default)]
    pub input_steps: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            scorer_id: default_scorer_id(),
            markers: default_markers(),
            analysis_step: default_analysis_step(),
            analysis_field: default_analysis_field(),
            input_steps: vec![],
        }
    }
}

fn default_scorer_id() -> String { "systemReportScorer".to_string() }
fn default_markers() -> Vec<String> { vec!["Google Chrome".to_string(), "99%".to_string()] }
fn default_analysis_step() -> String { "analysis".to_string() }
fn default_analysis_field() -> String { "text".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self { top_k: default_top_k() }
    }
}

fn default_top_k() -> usize { 3 }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run lifecycle, 2 = per-node, 3 = per-step detail (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| VigilError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| VigilError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.event_buffer == 0 {
            return Err(VigilError::Config("engine.event_buffer must be > 0".into()));
        }
        if self.scoring.markers.len() != 2 {
            return Err(VigilError::Config(format!(
                "scoring.markers must hold exactly two entries, got {}",
                self.scoring.markers.len()
            )));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    pub fn database_path(&self) -> PathBuf {
        match &self.engine.database {
            Some(db) => expand_home(db),
            None => self.workspace_dir().join("vigil.db"),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        match &self.log.log_dir {
            Some(dir) => expand_home(dir),
            None => self.workspace_dir().join("logs"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(val) => result.push_str(&val),
                    // Unset variables are kept verbatim
                    Err(_) => result.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

pub fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.event_buffer, 32);
        assert_eq!(config.watchdog.workflow_id, "system-watchdog");
        assert_eq!(config.watchdog.memory_threshold, 90.0);
        assert_eq!(config.scoring.markers, vec!["Google Chrome", "99%"]);
        assert_eq!(config.recall.top_k, 3);
        assert!(config.model.is_none());
        assert!(config.embedding.is_none());
        assert_eq!(config.log.level, 2);
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("VIGIL_CFG_TEST_VAR", "expanded");
        assert_eq!(
            expand_env_vars("key = \"${VIGIL_CFG_TEST_VAR}\""),
            "key = \"expanded\""
        );
        assert_eq!(
            expand_env_vars("a ${VIGIL_CFG_DEFINITELY_UNSET} b"),
            "a ${VIGIL_CFG_DEFINITELY_UNSET} b"
        );
        assert_eq!(expand_env_vars("dangling ${OPEN"), "dangling ${OPEN");
    }

    #[test]
    fn test_database_path_defaults_to_workspace() {
        let mut config = AppConfig::default();
        config.engine.workspace = "/tmp/vigil-ws".into();
        assert_eq!(config.database_path(), PathBuf::from("/tmp/vigil-ws/vigil.db"));
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/vigil-ws/logs"));

        config.engine.database = Some("/var/lib/vigil/runs.db".into());
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/vigil/runs.db"));
    }

    #[test]
    fn test_validate_rejects_bad_markers() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut tmp, b"[scoring]\nmarkers = [\"only-one\"]\n").unwrap();
        let err = AppConfig::load(tmp.path()).unwrap_err();
        assert!(matches!(err, VigilError::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/vigil.toml")).unwrap_err();
        assert!(matches!(err, VigilError::ConfigNotFound(_)));
    }
}
