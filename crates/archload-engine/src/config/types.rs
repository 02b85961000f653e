//! Pipeline configuration model.
//!
//! Dataset records are kept as raw YAML values here; the registry turns
//! them into [`DatasetDefinition`](archload_types::dataset::DatasetDefinition)s
//! so that malformed records can be reported by index.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_VERSION: &str = "1.0";
const DEFAULT_TABLE: &str = "unified_rows";
const DEFAULT_CONCURRENCY: u32 = 4;
const DEFAULT_MAX_RETRIES: u32 = 1;
const DEFAULT_RETRY_DELAY_SECS: u64 = 300;
const DEFAULT_GATE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_GATE_POLL_SECS: u64 = 30;

/// Top-level pipeline file.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub dependencies: DependencyConfig,
    #[serde(default)]
    pub datasets: Vec<serde_yaml::Value>,
}

impl PipelineConfig {
    /// Settings defaults around a bare list of dataset records.
    #[must_use]
    pub fn from_records(datasets: Vec<serde_yaml::Value>) -> Self {
        Self {
            version: default_version(),
            archive: ArchiveConfig::default(),
            destination: DestinationConfig::default(),
            state: StateConfig::default(),
            resources: ResourceConfig::default(),
            dependencies: DependencyConfig::default(),
            datasets,
        }
    }
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// Where the archive lives and where it is unpacked.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_path")]
    pub path: PathBuf,
    #[serde(default = "default_extract_dir")]
    pub extract_dir: PathBuf,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: default_archive_path(),
            extract_dir: default_extract_dir(),
        }
    }
}

fn default_archive_path() -> PathBuf {
    PathBuf::from("data/archive.zip")
}

fn default_extract_dir() -> PathBuf {
    PathBuf::from("data/unzipped")
}

/// Destination store kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    #[default]
    Sqlite,
    Postgres,
}

/// How a dataset's columns are reconciled with an existing target table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaPolicy {
    /// The dataset's column set must equal the table's.
    #[default]
    Exact,
    /// Missing table columns are added; absent dataset columns stay NULL.
    Additive,
}

/// Destination relational store.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    #[serde(default)]
    pub backend: StoreBackendKind,
    /// `SQLite` file path, or libpq-style connection string for Postgres.
    #[serde(default = "default_destination_connection")]
    pub connection: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub schema_policy: SchemaPolicy,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            connection: default_destination_connection(),
            table: default_table(),
            schema_policy: SchemaPolicy::default(),
        }
    }
}

fn default_destination_connection() -> String {
    "data/warehouse.db".to_string()
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

/// Run ledger backend kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
    Postgres,
}

/// Run ledger (run history and dependency status).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    /// `SQLite` path or Postgres connection string. Defaults to
    /// `~/.archload/state.db` for `SQLite`.
    #[serde(default)]
    pub connection: Option<String>,
}

/// Worker pool and retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

impl ResourceConfig {
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

fn default_concurrency() -> u32 {
    DEFAULT_CONCURRENCY
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_seconds() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

/// Dependency gate timing.
#[derive(Debug, Clone, Deserialize)]
pub struct DependencyConfig {
    #[serde(default = "default_gate_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_gate_poll")]
    pub poll_interval_seconds: u64,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_gate_timeout(),
            poll_interval_seconds: default_gate_poll(),
        }
    }
}

impl DependencyConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

fn default_gate_timeout() -> u64 {
    DEFAULT_GATE_TIMEOUT_SECS
}

fn default_gate_poll() -> u64 {
    DEFAULT_GATE_POLL_SECS
}
