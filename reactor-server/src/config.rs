//! Configuration loading for the reactor.
//!
//! Configuration is loaded from a TOML file (default: `reactor.toml`).
//! Every section and every field is optional.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::MigrationStrategy;

/// Root configuration for the reactor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Job processor configuration.
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Event emitter configuration.
    #[serde(default)]
    pub events: EventsConfig,
    /// Signing and verification configuration.
    #[serde(default)]
    pub signing: SigningConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Which relational engine backs the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Embedded SQLite file
    #[default]
    Sqlite,
    /// Networked PostgreSQL server
    Postgres,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Storage engine (default: sqlite).
    #[serde(default)]
    pub backend: StorageBackend,
    /// Path to the SQLite database file (default: reactor.db).
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    /// PostgreSQL connection URL, required for the postgres backend.
    #[serde(default)]
    pub url: Option<String>,
    /// Connection pool size (default: 10).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// When schema migrations run (default: auto).
    #[serde(default)]
    pub migration_strategy: MigrationStrategy,
}

/// Job processor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Jobs executed concurrently, across different documents (default: 4).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Jobs allowed to wait in the queue (default: 10000).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Retries after transient storage failures (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay in milliseconds (default: 100).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Retry delay cap in milliseconds (default: 5000).
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Re-executions after index conflicts (default: 3).
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

/// Event emitter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Debounce window for listener delivery in milliseconds (default: 250).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Maximum strands returned by one pull (default: 100).
    #[serde(default = "default_max_pull_batch")]
    pub max_pull_batch: usize,
    /// First retry delay after a failed push in milliseconds (default: 500).
    #[serde(default = "default_push_retry_base_ms")]
    pub push_retry_base_ms: u64,
    /// Longest delay between push retries in milliseconds (default: 60000).
    #[serde(default = "default_push_retry_max_ms")]
    pub push_retry_max_ms: u64,
    /// Strands a push listener may queue before they are dropped and
    /// replayed from the log once it recovers (default: 10000).
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

/// Signing and verification configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    /// Hex-encoded ed25519 secret key file. Actions are left unsigned when absent.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Verify signatures of operations received from remotes (default: true).
    #[serde(default = "default_verify_remote")]
    pub verify_remote: bool,
    /// Accept only these signers (`ed25519:<hex>`). Empty accepts any.
    #[serde(default)]
    pub trusted_keys: Vec<String>,
    /// Accept unsigned remote operations (default: false).
    #[serde(default)]
    pub allow_unsigned: bool,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address for HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("reactor.db")
}

fn default_max_connections() -> u32 {
    10
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_max_conflict_retries() -> u32 {
    3
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_max_pull_batch() -> usize {
    100
}

fn default_push_retry_base_ms() -> u64 {
    500
}

fn default_push_retry_max_ms() -> u64 {
    60_000
}

fn default_max_pending() -> usize {
    10_000
}

fn default_verify_remote() -> bool {
    true
}

fn default_http_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_database_path(),
            url: None,
            max_connections: default_max_connections(),
            migration_strategy: MigrationStrategy::default(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

impl ProcessorConfig {
    /// Retry limits for the per-document state machine.
    pub fn retry_policy(&self) -> reactor_core::RetryPolicy {
        reactor_core::RetryPolicy {
            max_retries: self.max_retries,
            max_conflict_retries: self.max_conflict_retries,
            backoff: reactor_core::Backoff::new(
                Duration::from_millis(self.retry_base_delay_ms),
                Duration::from_millis(self.retry_max_delay_ms),
            ),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_pull_batch: default_max_pull_batch(),
            push_retry_base_ms: default_push_retry_base_ms(),
            push_retry_max_ms: default_push_retry_max_ms(),
            max_pending: default_max_pending(),
        }
    }
}

impl EventsConfig {
    /// The debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Delay between retries of a failing push listener.
    pub fn push_backoff(&self) -> reactor_core::Backoff {
        reactor_core::Backoff::new(
            Duration::from_millis(self.push_retry_base_ms),
            Duration::from_millis(self.push_retry_max_ms),
        )
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_path: None,
            verify_remote: default_verify_remote(),
            trusted_keys: Vec::new(),
            allow_unsigned: false,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_http_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.storage.path, PathBuf::from("reactor.db"));
        assert_eq!(config.storage.migration_strategy, MigrationStrategy::Auto);
        assert_eq!(config.processor.workers, 4);
        assert_eq!(config.processor.queue_capacity, 10_000);
        assert_eq!(config.events.debounce_ms, 250);
        assert_eq!(config.events.max_pull_batch, 100);
        assert_eq!(config.events.max_pending, 10_000);
        assert_eq!(config.events.push_backoff().delay(1), Duration::from_millis(500));
        assert!(config.signing.verify_remote);
        assert_eq!(config.http.bind_address, "0.0.0.0:8080");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            backend = "postgres"
            url = "postgres://localhost/reactor"
            migration_strategy = "manual"

            [processor]
            workers = 8

            [signing]
            trusted_keys = ["ed25519:abcd"]
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Postgres);
        assert_eq!(config.storage.migration_strategy, MigrationStrategy::Manual);
        assert_eq!(config.storage.max_connections, 10);
        assert_eq!(config.processor.workers, 8);
        assert_eq!(config.processor.max_retries, 5);
        assert_eq!(config.signing.trusted_keys, vec!["ed25519:abcd".to_string()]);
    }

    #[test]
    fn retry_policy_from_config() {
        let policy = ProcessorConfig::default().retry_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.max_conflict_retries, 3);
        assert_eq!(policy.backoff.delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff.delay(10), Duration::from_millis(5000));
    }

    #[test]
    fn from_file_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[processor]\nworkers = \"many\"").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/reactor.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
