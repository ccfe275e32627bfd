use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tcgflow_core::pipelines::tcgcsv::{self, ScriptPaths, TcgcsvWorkflow};
use tcgflow_core::scheduler::RoutineScheduler;
use tcgflow_core::storage::{FilesystemBlobStore, JsonlEventLog, RedbIndexStore};
use tcgflow_core::workflow::{StepExecutor, WorkflowExecutor};
use tcgflow_core::{RetryPolicy, Routine, TriggerRule};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub scripts: ScriptPaths,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_blob_dir() -> String {
    "blobs".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_index_file() -> String {
    "index.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_dir: default_blob_dir(),
            event_log_dir: default_event_log_dir(),
            index_file: default_index_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_cron")]
    pub cron: String,

    /// Run every missed day after downtime instead of only the latest
    #[serde(default)]
    pub catchup: bool,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_cron() -> String {
    tcgcsv::SCHEDULE.to_string()
}

fn default_enabled() -> bool {
    true
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
            catchup: false,
            enabled: default_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Kill a loader script after this many seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Extra attempts after a failed one
    #[serde(default)]
    pub retries: u32,

    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// How the product loader waits on the group and Secret Lair loaders
    #[serde(default)]
    pub fan_in_rule: TriggerRule,

    /// Print captured output blocks to stdout
    #[serde(default = "default_echo_output")]
    pub echo_output: bool,
}

fn default_retry_backoff_secs() -> u64 {
    60
}

fn default_echo_output() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            retries: 0,
            retry_backoff_secs: default_retry_backoff_secs(),
            fan_in_rule: TriggerRule::default(),
            echo_output: default_echo_output(),
        }
    }
}

impl ExecutionConfig {
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        (self.retries > 0).then(|| RetryPolicy {
            max_attempts: self.retries.saturating_add(1),
            backoff_secs: self.retry_backoff_secs,
        })
    }
}

impl RunnerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            Self::parse(&content)?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }

    /// Get the blob storage path
    pub fn blob_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.blob_dir)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    /// Get the index file path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }

    /// The TCGCSV workflow with this configuration's step options
    pub fn workflow(&self) -> TcgcsvWorkflow {
        TcgcsvWorkflow {
            scripts: self.scripts.clone(),
            timeout_secs: self.execution.timeout_secs,
            retry_policy: self.execution.retry_policy(),
            fan_in_rule: self.execution.fan_in_rule,
        }
    }

    pub fn routine(&self, now: DateTime<Utc>) -> Routine {
        let mut routine = self.workflow().routine(now);
        routine.schedule.cron = self.schedule.cron.clone();
        routine.schedule.catchup = self.schedule.catchup;
        routine.enabled = self.schedule.enabled;
        routine
    }
}

/// Stores and executors shared by the subcommands
#[derive(Clone)]
pub struct AppState {
    pub event_log: Arc<JsonlEventLog>,
    pub blob_store: Arc<FilesystemBlobStore>,
    pub index_store: Arc<RedbIndexStore>,
    pub workflow_executor: Arc<WorkflowExecutor>,
    pub routine_scheduler: Arc<RoutineScheduler>,
}

impl AppState {
    pub fn new(config: &RunnerConfig) -> Result<Self> {
        let blob_store = Arc::new(
            FilesystemBlobStore::new(config.blob_path())
                .context("Failed to create blob store")?,
        );

        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );

        let index_store = Arc::new(
            RedbIndexStore::new(config.index_path()).context("Failed to create index store")?,
        );

        let step_executor = StepExecutor::new(event_log.clone(), blob_store.clone())
            .with_echo_output(config.execution.echo_output);

        let workflow_executor = Arc::new(WorkflowExecutor::with_step_executor(
            event_log.clone(),
            index_store.clone(),
            step_executor,
        ));

        let routine_scheduler = Arc::new(RoutineScheduler::new(
            workflow_executor.clone(),
            index_store.clone(),
        ));

        Ok(Self {
            event_log,
            blob_store,
            index_store,
            workflow_executor,
            routine_scheduler,
        })
    }
}
