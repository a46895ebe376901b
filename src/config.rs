use crate::database::Stage;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "orchestrator.yaml";

/// Orchestrator configuration, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub database_path: PathBuf,
    pub log_dir: PathBuf,
    pub tick_interval_secs: u64,
    pub stale_lock_minutes: u64,
    /// Stage-remaining count above which a feed may get more than one worker.
    pub fan_out_threshold: u64,
    pub stall_window: usize,
    /// Items a worker lists per claim round.
    pub claim_batch: usize,
    pub terminate_workers_on_exit: bool,
    pub workers: WorkerTargets,
    pub backoff: BackoffConfig,
    pub progress_source: ProgressSource,
    pub episodes_dir: PathBuf,
    pub transcripts_dir: PathBuf,
    pub min_audio_bytes: u64,
    pub executors: ExecutorsConfig,
    pub feeds: Vec<FeedConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/progress.db"),
            log_dir: PathBuf::from("logs"),
            tick_interval_secs: 10,
            stale_lock_minutes: 60,
            fan_out_threshold: 50,
            stall_window: 5,
            claim_batch: 20,
            terminate_workers_on_exit: true,
            workers: WorkerTargets::default(),
            backoff: BackoffConfig::default(),
            progress_source: ProgressSource::Store,
            episodes_dir: PathBuf::from("episodes"),
            transcripts_dir: PathBuf::from("transcripts"),
            min_audio_bytes: 100 * 1024,
            executors: ExecutorsConfig::default(),
            feeds: Vec::new(),
        }
    }
}

/// Target number of concurrent workers per stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerTargets {
    pub download: usize,
    pub transcribe: usize,
    pub enrich: usize,
}

impl Default for WorkerTargets {
    fn default() -> Self {
        Self {
            download: 30,
            transcribe: 6,
            enrich: 20,
        }
    }
}

impl WorkerTargets {
    pub fn for_stage(&self, stage: Stage) -> usize {
        match stage {
            Stage::Download => self.download,
            Stage::Transcribe => self.transcribe,
            Stage::Enrich => self.enrich,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub manual_failover_threshold: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_delay_secs: 1800,
            manual_failover_threshold: 3,
        }
    }
}

/// Where per-feed stage counts come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressSource {
    Store,
    /// Degraded mode: count artifacts on disk instead of querying the store.
    Filesystem,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorsConfig {
    pub download: Option<CommandSpec>,
    pub transcribe: Option<CommandSpec>,
    pub enrich: Option<CommandSpec>,
}

impl ExecutorsConfig {
    pub fn for_stage(&self, stage: Stage) -> Option<&CommandSpec> {
        match stage {
            Stage::Download => self.download.as_ref(),
            Stage::Transcribe => self.transcribe.as_ref(),
            Stage::Enrich => self.enrich.as_ref(),
        }
    }
}

/// External program run once per item.
///
/// Arguments may contain `{id}`, `{queue}`, `{title}`, `{url}`, `{guid}`,
/// `{audio_path}` and `{transcript_path}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_transient_exit_codes() -> Vec<i32> {
    vec![75]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Static weight used to break ties between feeds; higher wins.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub total: Option<u64>,
    /// Added to the catalog count (bonus episodes missing from RSS, etc).
    #[serde(default)]
    pub total_adjustment: i64,
    #[serde(default)]
    pub rate_limited: bool,
    #[serde(default)]
    pub manual_command: Option<CommandSpec>,
}

fn default_priority() -> u32 {
    3
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_secs(self.stale_lock_minutes * 60)
    }

    pub fn feed(&self, name: &str) -> Option<&FeedConfig> {
        self.feeds.iter().find(|f| f.name == name)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.tick_interval_secs == 0 {
            return Err(AppError::Config("tick_interval_secs must be greater than 0".into()));
        }
        if self.stall_window == 0 {
            return Err(AppError::Config("stall_window must be greater than 0".into()));
        }
        if self.fan_out_threshold == 0 {
            return Err(AppError::Config("fan_out_threshold must be greater than 0".into()));
        }
        if self.backoff.base_delay_secs > self.backoff.max_delay_secs {
            return Err(AppError::Config(format!(
                "backoff.base_delay_secs ({}) exceeds backoff.max_delay_secs ({})",
                self.backoff.base_delay_secs, self.backoff.max_delay_secs
            )));
        }

        let mut seen = HashSet::new();
        for feed in &self.feeds {
            if feed.name.trim().is_empty() {
                return Err(AppError::Config("feed name cannot be empty".into()));
            }
            if !seen.insert(feed.name.as_str()) {
                return Err(AppError::Config(format!("duplicate feed name: {}", feed.name)));
            }
        }

        Ok(())
    }
}

/// Load and validate a YAML config file.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, AppError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("Failed to read {:?}: {}", path, e)))?;
    let config: OrchestratorConfig = serde_yaml::from_str(&content)?;
    config.validate()?;
    log::info!("Loaded config from {:?} ({} feeds)", path, config.feeds.len());
    Ok(config)
}

/// Load config from an explicit path, the default locations, or built-in defaults.
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<OrchestratorConfig, AppError> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    for path in default_config_paths() {
        if path.exists() {
            return load_config(&path);
        }
    }

    log::info!("No config file found, using defaults");
    Ok(OrchestratorConfig::default())
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(".").join(CONFIG_FILE_NAME)];
    if let Some(data_dir) = dirs::data_dir() {
        paths.push(data_dir.join("podcast-orchestrator").join(CONFIG_FILE_NAME));
    }
    paths
}
