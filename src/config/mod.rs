use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Whether an attached database accepts mutating operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadOnly => write!(f, "read_only"),
            AccessMode::ReadWrite => write!(f, "read_write"),
        }
    }
}

/// Options for one attached warehouse database.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BigqueryOptions {
    pub project_id: String,
    /// Restricts the catalog to a single dataset when set
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub access_mode: AccessMode,
    /// REST endpoint override, e.g. a local emulator
    pub api_endpoint: Option<String>,
    /// Storage API endpoint override
    pub grpc_endpoint: Option<String>,
    /// Location used for jobs when the caller does not pass one
    pub default_location: Option<String>,
    #[serde(default)]
    pub jobs: JobPollConfig,
    #[serde(default)]
    pub read: ReadConfig,
    #[serde(default)]
    pub write: WriteConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobPollConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Hard limit on how long a job is polled before giving up
    #[serde(default = "default_job_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_job_timeout_secs() -> u64 {
    600
}

impl Default for JobPollConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_secs: default_job_timeout_secs(),
        }
    }
}

impl JobPollConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadConfig {
    /// Upper bound on parallel streams requested per read session
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
}

fn default_max_streams() -> usize {
    4
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            max_streams: default_max_streams(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriteConfig {
    /// Buffered rows that trigger an append call
    #[serde(default = "default_max_chunk_rows")]
    pub max_chunk_rows: usize,
    /// Buffered encoded bytes that trigger an append call
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

fn default_max_chunk_rows() -> usize {
    10_000
}

fn default_max_chunk_bytes() -> usize {
    8 * 1024 * 1024
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            max_chunk_rows: default_max_chunk_rows(),
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

impl BigqueryOptions {
    /// Options with defaults for everything but the project.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: None,
            access_mode: AccessMode::default(),
            api_endpoint: None,
            grpc_endpoint: None,
            default_location: None,
            jobs: JobPollConfig::default(),
            read: ReadConfig::default(),
            write: WriteConfig::default(),
        }
    }

    pub fn with_access_mode(mut self, access_mode: AccessMode) -> Self {
        self.access_mode = access_mode;
        self
    }

    pub fn with_dataset(mut self, dataset_id: impl Into<String>) -> Self {
        self.dataset_id = Some(dataset_id.into());
        self
    }

    /// Load options from a config file layered with environment variables
    pub fn load(config_path: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::File::with_name(config_path));

        // Nested keys use a double underscore so field names keep theirs.
        // Example: BQBRIDGE_PROJECT_ID=p, BQBRIDGE_JOBS__TIMEOUT_SECS=30
        builder = builder.add_source(
            config::Environment::with_prefix("BQBRIDGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let options: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        options.validate()?;
        Ok(options)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            anyhow::bail!("BigQuery options require a non-empty 'project_id'");
        }
        if let Some(dataset) = &self.dataset_id {
            if dataset.trim().is_empty() {
                anyhow::bail!("'dataset_id' must not be empty when set");
            }
        }
        if self.read.max_streams == 0 {
            anyhow::bail!("'read.max_streams' must be at least 1");
        }
        if self.write.max_chunk_rows == 0 || self.write.max_chunk_bytes == 0 {
            anyhow::bail!("write chunk thresholds must be at least 1");
        }
        if self.jobs.initial_backoff_ms == 0 {
            anyhow::bail!("'jobs.initial_backoff_ms' must be at least 1");
        }
        if self.jobs.initial_backoff_ms > self.jobs.max_backoff_ms {
            anyhow::bail!("'jobs.initial_backoff_ms' exceeds 'jobs.max_backoff_ms'");
        }
        if self.jobs.max_backoff() > self.jobs.timeout() {
            anyhow::bail!("'jobs.max_backoff_ms' exceeds the job timeout");
        }
        Ok(())
    }
}
