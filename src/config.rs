//! Configuration for the roll-up store
//!
//! [`StoreConfig`] carries the batching and scan parameters handed to the
//! sorted store. [`RollupConfig`] is the full TOML file used by the CLI, with
//! environment variable overrides and defaults for every field:
//!
//! ```toml
//! [table]
//! name = "metrics"
//!
//! [store]
//! max_query_threads = 1
//! max_memory = 100000
//! max_latency_ms = 100
//! max_write_threads = 10
//!
//! [backend]
//! kind = "redis"
//! redis_url = "redis://127.0.0.1:6379"
//! namespace = "rollup"
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use crate::engine::traits::BatchWriterConfig;
use crate::error::{Error, Result};
use crate::redis::RedisConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Batching parameters for the writers and concurrency for scans
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Concurrent row fetches per scan
    #[serde(default = "default_max_query_threads")]
    pub max_query_threads: usize,

    /// Buffered bytes per writer before a flush
    #[serde(default = "default_max_memory")]
    pub max_memory: usize,

    /// Age of the oldest buffered mutation before a flush
    #[serde(
        default = "default_max_latency",
        rename = "max_latency_ms",
        with = "duration_ms"
    )]
    pub max_latency: Duration,

    /// Concurrent writes per flush
    #[serde(default = "default_max_write_threads")]
    pub max_write_threads: usize,
}

fn default_max_query_threads() -> usize { 1 }
fn default_max_memory() -> usize { 100_000 }
fn default_max_latency() -> Duration { Duration::from_millis(100) }
fn default_max_write_threads() -> usize { 10 }
fn default_table_name() -> String { "metrics".to_string() }
fn default_redis_url() -> String { "redis://127.0.0.1:6379".to_string() }
fn default_namespace() -> String { "rollup".to_string() }
fn default_pool_size() -> u32 { 16 }
fn default_log_level() -> String { "info".to_string() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_query_threads: default_max_query_threads(),
            max_memory: default_max_memory(),
            max_latency: default_max_latency(),
            max_write_threads: default_max_write_threads(),
        }
    }
}

impl StoreConfig {
    /// Reject zero limits
    pub fn validate(&self) -> Result<()> {
        if self.max_query_threads == 0 {
            return Err(Error::Configuration("max_query_threads must be > 0".into()));
        }
        if self.max_memory == 0 {
            return Err(Error::Configuration("max_memory must be > 0".into()));
        }
        if self.max_latency.is_zero() {
            return Err(Error::Configuration("max_latency must be > 0".into()));
        }
        if self.max_write_threads == 0 {
            return Err(Error::Configuration("max_write_threads must be > 0".into()));
        }
        Ok(())
    }

    /// Writer settings derived from this configuration
    pub fn batch_writer_config(&self) -> BatchWriterConfig {
        BatchWriterConfig {
            max_memory: self.max_memory,
            max_latency: self.max_latency,
            max_write_threads: self.max_write_threads,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Table naming
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TableConfig {
    /// Base name; the group index uses it as is, the type index appends `_reverse`
    #[serde(default = "default_table_name")]
    pub name: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            name: default_table_name(),
        }
    }
}

/// Which sorted store implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process store, nothing persists
    Memory,
    /// Redis server
    #[default]
    Redis,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "redis" => Ok(BackendKind::Redis),
            other => Err(Error::Configuration(format!("unknown backend: {}", other))),
        }
    }
}

/// Backend selection and connection settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Store implementation
    #[serde(default)]
    pub kind: BackendKind,

    /// Redis server URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Key prefix inside Redis
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Maximum Redis commands in flight
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            redis_url: default_redis_url(),
            namespace: default_namespace(),
            pool_size: default_pool_size(),
        }
    }
}

/// Logging output
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Complete configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RollupConfig {
    /// Table naming
    #[serde(default)]
    pub table: TableConfig,

    /// Batching and scan parameters
    #[serde(default)]
    pub store: StoreConfig,

    /// Backend selection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RollupConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Load a TOML file, then apply environment overrides
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `ROLLUP_*` and `RUST_LOG` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(table) = lookup("ROLLUP_TABLE") {
            self.table.name = table;
        }
        if let Some(kind) = lookup("ROLLUP_BACKEND") {
            self.backend.kind = kind.parse()?;
        }
        if let Some(url) = lookup("ROLLUP_REDIS_URL") {
            self.backend.redis_url = url;
        }
        if let Some(namespace) = lookup("ROLLUP_NAMESPACE") {
            self.backend.namespace = namespace;
        }
        if let Some(level) = lookup("RUST_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        if self.table.name.is_empty() {
            return Err(Error::Configuration("table name cannot be empty".into()));
        }
        if self.table.name.contains(crate::codec::DELIM) {
            return Err(Error::Configuration(
                "table name cannot contain the key delimiter".into(),
            ));
        }
        self.store.validate()?;
        if self.backend.kind == BackendKind::Redis {
            self.redis_config().validate().map_err(Error::Configuration)?;
        }
        EnvFilter::try_new(&self.logging.level).map_err(|e| {
            Error::Configuration(format!("invalid log level {:?}: {}", self.logging.level, e))
        })?;
        Ok(())
    }

    /// Redis connection settings for this configuration
    pub fn redis_config(&self) -> RedisConfig {
        RedisConfig::with_url(self.backend.redis_url.clone())
            .namespace(self.backend.namespace.clone())
            .pool_size(self.backend.pool_size)
    }

    /// Save configuration as TOML
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Install the global `tracing` subscriber
///
/// `RUST_LOG` takes precedence over `config.level`. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let installed = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    };
    installed.map_err(|e| Error::Configuration(format!("Failed to initialize logging: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.max_query_threads, 1);
        assert_eq!(config.max_memory, 100_000);
        assert_eq!(config.max_latency, Duration::from_millis(100));
        assert_eq!(config.max_write_threads, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_config_rejects_zero() {
        for broken in [
            StoreConfig { max_query_threads: 0, ..Default::default() },
            StoreConfig { max_memory: 0, ..Default::default() },
            StoreConfig { max_latency: Duration::ZERO, ..Default::default() },
            StoreConfig { max_write_threads: 0, ..Default::default() },
        ] {
            assert!(matches!(broken.validate(), Err(Error::Configuration(_))));
        }
    }

    #[test]
    fn test_batch_writer_config() {
        let config = StoreConfig {
            max_memory: 42,
            ..Default::default()
        };
        let writer = config.batch_writer_config();
        assert_eq!(writer.max_memory, 42);
        assert_eq!(writer.max_latency, Duration::from_millis(100));
        assert_eq!(writer.max_write_threads, 10);
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = RollupConfig::default();
        assert_eq!(config.table.name, "metrics");
        assert_eq!(config.backend.kind, BackendKind::Redis);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: RollupConfig = toml::from_str(
            r#"
            [store]
            max_latency_ms = 250

            [backend]
            kind = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.store.max_latency, Duration::from_millis(250));
        assert_eq!(config.store.max_memory, 100_000);
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.table.name, "metrics");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ROLLUP_TABLE", "stats"),
            ("ROLLUP_BACKEND", "memory"),
            ("ROLLUP_NAMESPACE", "test"),
            ("RUST_LOG", "debug"),
        ]);
        let mut config = RollupConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.table.name, "stats");
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.backend.namespace, "test");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.backend.redis_url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_bad_backend_override() {
        let mut config = RollupConfig::default();
        let result = config.apply_overrides(|name| {
            (name == "ROLLUP_BACKEND").then(|| "cassandra".to_string())
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validation() {
        let mut config = RollupConfig::default();
        config.table.name = String::new();
        assert!(config.validate().is_err());

        let mut config = RollupConfig::default();
        config.backend.redis_url = "http://nope".into();
        assert!(config.validate().is_err());

        // the URL is irrelevant for the memory backend
        config.backend.kind = BackendKind::Memory;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollup.toml");

        let mut config = RollupConfig::default();
        config.table.name = "app_metrics".into();
        config.store.max_latency = Duration::from_millis(750);
        config.logging.json = true;
        config.save_to_file(&path).unwrap();

        let loaded = RollupConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let result = RollupConfig::from_file("/nonexistent/rollup.toml");
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
