use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub directories: DirectoriesConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            database: DatabaseConfig::default(),
            directories: DirectoriesConfig::default(),
            limits: LimitsConfig::default(),
            batching: BatchingConfig::default(),
            retry: RetryConfig::default(),
            parser: ParserConfig::default(),
            worker_count: default_worker_count(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Points every path of a default config under `root`. Handy for tests and scratch runs.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            database: DatabaseConfig {
                path: root.join("chatlog.db"),
            },
            directories: DirectoriesConfig {
                uploads_dir: root.join("uploads"),
                extracted_dir: root.join("extracted"),
                messages_dir: root.join("messages"),
            },
            ..Self::default()
        }
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

/// Base directory for data files: the platform data dir, else `./data`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("chatlog-ingest"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    default_data_dir().join("chatlog.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoriesConfig {
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_extracted_dir")]
    pub extracted_dir: PathBuf,
    #[serde(default = "default_messages_dir")]
    pub messages_dir: PathBuf,
}

fn default_uploads_dir() -> PathBuf {
    default_data_dir().join("uploads")
}

fn default_extracted_dir() -> PathBuf {
    default_data_dir().join("extracted")
}

fn default_messages_dir() -> PathBuf {
    default_data_dir().join("messages")
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            extracted_dir: default_extracted_dir(),
            messages_dir: default_messages_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted archive, compressed.
    #[serde(default = "default_max_archive_bytes")]
    pub max_archive_bytes: u64,
    /// Cap on the summed uncompressed size of accepted entries.
    #[serde(default = "default_max_extraction_bytes")]
    pub max_extraction_bytes: u64,
    #[serde(default = "default_max_entry_count")]
    pub max_entry_count: u64,
}

fn default_max_archive_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_max_extraction_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_max_entry_count() -> u64 {
    10_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_archive_bytes: default_max_archive_bytes(),
            max_extraction_bytes: default_max_extraction_bytes(),
            max_entry_count: default_max_entry_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "default_row_batch_size")]
    pub message_batch_size: usize,
    #[serde(default = "default_row_batch_size")]
    pub thread_batch_size: usize,
    /// Batch size for coarse records such as extracted files.
    #[serde(default = "default_record_batch_size")]
    pub record_batch_size: usize,
}

fn default_row_batch_size() -> usize {
    1000
}

fn default_record_batch_size() -> usize {
    100
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            message_batch_size: default_row_batch_size(),
            thread_batch_size: default_row_batch_size(),
            record_batch_size: default_record_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
        }
    }
}

/// What happens to the subtree below a node whose message never finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnfinishedAncestors {
    /// Keep walking into the children and emit whatever finished there.
    #[default]
    EmitDescendants,
    /// Prune the subtree.
    SkipDescendants,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParserConfig {
    #[serde(default)]
    pub unfinished_ancestors: UnfinishedAncestors,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
