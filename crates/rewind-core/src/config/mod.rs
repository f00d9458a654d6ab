//! Configuration system for rewind.

use std::path::PathBuf;
use std::time::Duration;

use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{RewindError, RewindResult};

/// Record store backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordStoreProvider {
    /// Relational backend on plain SQLite.
    #[default]
    Sqlite,
    /// SQLite with the sqlite-vec extension for similarity search.
    SqliteVec,
}

/// Record store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordStoreConfig {
    /// Provider type.
    pub provider: RecordStoreProvider,
    /// Database file; `None` keeps records in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            provider: RecordStoreProvider::Sqlite,
            path: Some(rewind_dir().join("records.db")),
        }
    }
}

impl RecordStoreConfig {
    /// In-memory store of the given provider.
    pub fn in_memory(provider: RecordStoreProvider) -> Self {
        Self {
            provider,
            path: None,
        }
    }
}

/// Backoff applied when a ledger mutation loses a compare-and-swap race.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial delay before first retry (milliseconds).
    pub initial_delay_ms: u64,
    /// Maximum delay between retries (milliseconds).
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 5,
            max_delay_ms: 250,
            multiplier: 2.0_f32,
        }
    }
}

impl RetryPolicy {
    /// Backoff schedule for `backon`.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_max_times(self.max_retries as usize)
            .with_min_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_factor(self.multiplier)
            .with_jitter()
    }

    /// Total attempts including the first one.
    pub fn attempts(&self) -> usize {
        self.max_retries as usize + 1
    }
}

/// Main rewind configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewindConfig {
    /// Path to the ledger database; `None` keeps the ledger in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_db_path: Option<PathBuf>,
    /// Record store configuration.
    pub record_store: RecordStoreConfig,
    /// Contention retry policy.
    pub retry: RetryPolicy,
    /// Timeout applied to every ledger and record store call (milliseconds).
    pub operation_timeout_ms: u64,
    /// Name given to the root branch.
    pub main_branch_name: String,
}

fn rewind_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".rewind"))
        .unwrap_or_else(|| PathBuf::from(".rewind"))
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            ledger_db_path: Some(rewind_dir().join("ledger.db")),
            record_store: RecordStoreConfig::default(),
            retry: RetryPolicy::default(),
            operation_timeout_ms: 30_000,
            main_branch_name: "main".to_string(),
        }
    }
}

impl RewindConfig {
    /// Everything in memory; used by tests and throwaway sessions.
    pub fn in_memory(provider: RecordStoreProvider) -> Self {
        Self {
            ledger_db_path: None,
            record_store: RecordStoreConfig::in_memory(provider),
            ..Self::default()
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Load configuration from a file (TOML, JSON, or YAML).
    pub fn from_file(path: impl AsRef<std::path::Path>) -> RewindResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let ext = path.as_ref().extension().and_then(|e| e.to_str());

        match ext {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| RewindError::Configuration(e.to_string()))
            }
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| RewindError::Configuration(e.to_string())),
            Some("yaml" | "yml") => serde_yaml::from_str(&content)
                .map_err(|e| RewindError::Configuration(e.to_string())),
            _ => Err(RewindError::Configuration(
                "Unsupported config file format. Use .toml, .json, or .yaml".to_string(),
            )),
        }
    }

    /// Load configuration from `REWIND_*` environment variables.
    pub fn from_env() -> RewindResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("REWIND_LEDGER_DB_PATH") {
            config.ledger_db_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("REWIND_RECORD_STORE_PATH") {
            config.record_store.path = Some(PathBuf::from(path));
        }
        if let Ok(provider) = std::env::var("REWIND_RECORD_STORE_PROVIDER") {
            config.record_store.provider = match provider.to_lowercase().as_str() {
                "sqlite" => RecordStoreProvider::Sqlite,
                "sqlite_vec" | "sqlite-vec" => RecordStoreProvider::SqliteVec,
                other => {
                    return Err(RewindError::Configuration(format!(
                        "Unknown record store provider '{}'",
                        other
                    )))
                }
            };
        }
        if let Ok(timeout) = std::env::var("REWIND_OPERATION_TIMEOUT_MS") {
            config.operation_timeout_ms = timeout.parse().map_err(|_| {
                RewindError::Configuration(format!(
                    "REWIND_OPERATION_TIMEOUT_MS must be an integer, got '{}'",
                    timeout
                ))
            })?;
        }
        if let Ok(retries) = std::env::var("REWIND_MAX_RETRIES") {
            config.retry.max_retries = retries.parse().map_err(|_| {
                RewindError::Configuration(format!(
                    "REWIND_MAX_RETRIES must be an integer, got '{}'",
                    retries
                ))
            })?;
        }

        Ok(config)
    }

    /// Build configuration using builder pattern.
    pub fn builder() -> RewindConfigBuilder {
        RewindConfigBuilder::default()
    }
}

/// Builder for RewindConfig.
#[derive(Default)]
pub struct RewindConfigBuilder {
    config: RewindConfig,
}

impl RewindConfigBuilder {
    /// Set ledger database path.
    pub fn ledger_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ledger_db_path = Some(path.into());
        self
    }

    /// Keep the ledger in memory.
    pub fn in_memory_ledger(mut self) -> Self {
        self.config.ledger_db_path = None;
        self
    }

    /// Set record store configuration.
    pub fn record_store(mut self, config: RecordStoreConfig) -> Self {
        self.config.record_store = config;
        self
    }

    /// Set retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Set the per-operation timeout.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the root branch name.
    pub fn main_branch_name(mut self, name: impl Into<String>) -> Self {
        self.config.main_branch_name = name.into();
        self
    }

    /// Build the configuration.
    pub fn build(self) -> RewindConfig {
        self.config
    }
}
