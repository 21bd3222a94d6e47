//! Redis connection pool with retry logic
//!
//! A single multiplexed connection is shared by every caller; a semaphore caps
//! the number of commands in flight. Transport failures (dropped connection,
//! IO error, timeout, server still loading) are retried with exponential
//! backoff and jitter. Anything else, including script errors, is returned on
//! the first failure.
//!
//! # Example
//!
//! ```rust,no_run
//! use rollup_tsdb::redis::{RedisConfig, RedisPool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = RedisPool::new(RedisConfig::with_url("redis://localhost:6379")).await?;
//! pool.ping().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::StoreError;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};

use super::util::{connection_error_message, safe_redis_error, sanitize_url};

/// Connection settings for the Redis store
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Server URL, `redis://` or `rediss://`
    pub url: String,

    /// Prefix for every key the store touches
    pub namespace: String,

    /// Maximum commands in flight
    /// Default: 16
    pub pool_size: u32,

    /// Default: 5 seconds
    pub connection_timeout: Duration,

    /// Default: 2 seconds
    pub command_timeout: Duration,

    /// Retry policy for transport failures
    pub retry_policy: RetryPolicy,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            namespace: "rollup".to_string(),
            pool_size: 16,
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl RedisConfig {
    /// Default settings for `url`
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the key namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the maximum number of commands in flight
    pub fn pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the per-command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
            return Err(format!(
                "Redis URL must use redis:// or rediss://, got {}",
                sanitize_url(&self.url)
            ));
        }
        #[cfg(not(feature = "redis-tls"))]
        if self.url.starts_with("rediss://") {
            return Err("rediss:// requires the 'redis-tls' feature".to_string());
        }
        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err(format!(
                "Namespace must be non-empty and free of ':', got {:?}",
                self.namespace
            ));
        }
        if self.pool_size == 0 || self.pool_size > 1000 {
            return Err("Pool size must be between 1 and 1000".to_string());
        }
        Ok(())
    }
}

/// Retry policy with exponential backoff
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Default: 3
    pub max_retries: u32,

    /// Default: 50ms
    pub initial_delay: Duration,

    /// Default: 2 seconds
    pub max_delay: Duration,

    /// Default: 2.0
    pub multiplier: f64,

    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let delay = if self.jitter {
            capped * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            capped
        };
        Duration::from_millis(delay as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Pool activity counters
#[derive(Debug, Default)]
pub struct PoolMetrics {
    connections: AtomicU64,
    connection_failures: AtomicU64,
    commands: AtomicU64,
    command_failures: AtomicU64,
    retries: AtomicU64,
    latency_us: AtomicU64,
}

impl PoolMetrics {
    fn record_command(&self, latency: Duration) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        self.latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        let commands = self.commands.load(Ordering::Relaxed);
        let latency = self.latency_us.load(Ordering::Relaxed);
        PoolMetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            commands,
            command_failures: self.command_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            average_latency_us: if commands == 0 {
                0.0
            } else {
                latency as f64 / commands as f64
            },
        }
    }
}

/// Snapshot of [`PoolMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMetricsSnapshot {
    /// Connections established
    pub connections: u64,
    /// Failed connection attempts
    pub connection_failures: u64,
    /// Successful commands
    pub commands: u64,
    /// Failed command attempts
    pub command_failures: u64,
    /// Retries performed
    pub retries: u64,
    /// Mean latency of successful commands
    pub average_latency_us: f64,
}

/// Shared Redis connection with bounded concurrency
pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    config: RedisConfig,
    metrics: Arc<PoolMetrics>,
    semaphore: Arc<Semaphore>,
}

impl RedisPool {
    /// Validate `config` and open the first connection
    pub async fn new(config: RedisConfig) -> Result<Self, StoreError> {
        config.validate().map_err(StoreError::Connection)?;

        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::Connection(safe_redis_error(&config.url, &e)))?;

        let pool = Self {
            client,
            connection: RwLock::new(None),
            semaphore: Arc::new(Semaphore::new(config.pool_size as usize)),
            metrics: Arc::new(PoolMetrics::default()),
            config,
        };
        pool.connect().await?;

        debug!(url = %sanitize_url(&pool.config.url), "Redis pool ready");
        Ok(pool)
    }

    async fn connect(&self) -> Result<MultiplexedConnection, StoreError> {
        let start = Instant::now();
        let conn = tokio::time::timeout(
            self.config.connection_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            self.metrics.connection_failures.fetch_add(1, Ordering::Relaxed);
            StoreError::Connection(connection_error_message(&self.config.url, "timed out"))
        })?
        .map_err(|e| {
            self.metrics.connection_failures.fetch_add(1, Ordering::Relaxed);
            StoreError::Connection(safe_redis_error(&self.config.url, &e))
        })?;

        *self.connection.write().await = Some(conn.clone());
        self.metrics.connections.fetch_add(1, Ordering::Relaxed);
        debug!("Redis connection established in {:?}", start.elapsed());
        Ok(conn)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let existing = self.connection.read().await.clone();
        match existing {
            Some(conn) => Ok(conn),
            None => self.connect().await,
        }
    }

    /// Run `f` against a connection, retrying transport failures
    ///
    /// Script and response errors are mapped through `on_rejected`, so callers
    /// can tell a refused write from an unreachable server.
    pub async fn execute<F, Fut, T>(
        &self,
        on_rejected: fn(String) -> StoreError,
        f: F,
    ) -> Result<T, StoreError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| StoreError::Connection("Redis pool closed".to_string()))?;

        let mut attempt = 0;
        loop {
            let conn = self.connection().await?;
            let start = Instant::now();

            let failure = match tokio::time::timeout(self.config.command_timeout, f(conn)).await {
                Ok(Ok(value)) => {
                    self.metrics.record_command(start.elapsed());
                    return Ok(value);
                },
                Ok(Err(e)) if !is_retriable(&e) => {
                    self.metrics.command_failures.fetch_add(1, Ordering::Relaxed);
                    let message = safe_redis_error(&self.config.url, &e);
                    return Err(if is_rejection(&e) {
                        on_rejected(message)
                    } else {
                        StoreError::Connection(message)
                    });
                },
                Ok(Err(e)) => {
                    if e.is_connection_dropped() || e.is_io_error() {
                        *self.connection.write().await = None;
                    }
                    safe_redis_error(&self.config.url, &e)
                },
                Err(_) => connection_error_message(&self.config.url, "command timed out"),
            };

            self.metrics.command_failures.fetch_add(1, Ordering::Relaxed);
            if !self.config.retry_policy.should_retry(attempt) {
                return Err(StoreError::Connection(failure));
            }

            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            let delay = self.config.retry_policy.delay_for_attempt(attempt);
            warn!(
                "Redis command failed (attempt {}), retrying in {:?}: {}",
                attempt + 1,
                delay,
                failure
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Round-trip a PING
    pub async fn ping(&self) -> Result<Duration, StoreError> {
        let start = Instant::now();
        self.execute(StoreError::Backend, |mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await?;
        Ok(start.elapsed())
    }

    /// Pool activity counters
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The pool configuration
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

fn is_retriable(e: &RedisError) -> bool {
    e.is_connection_dropped()
        || e.is_timeout()
        || e.is_io_error()
        || matches!(e.kind(), redis::ErrorKind::BusyLoadingError)
}

fn is_rejection(e: &RedisError) -> bool {
    matches!(
        e.kind(),
        redis::ErrorKind::ResponseError | redis::ErrorKind::ExtensionError | redis::ErrorKind::TypeError
    )
}
