//! Service configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use courier_delivery::{circuit::CircuitConfig, client::ClientConfig, DeliveryConfig, RetryPolicy};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";

/// Service configuration with defaults, file and environment overrides.
///
/// Loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Keys in `courier.toml` are the lowercase forms of the environment
/// variables, e.g. `worker_pool_size = 20`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,

    // Shared store
    /// Redis URL for shared coordination state. Unset keeps it in memory.
    ///
    /// Environment variable: `REDIS_URL`
    #[serde(default, alias = "REDIS_URL")]
    pub redis_url: Option<String>,

    // Workers
    /// Maximum attempts in flight.
    ///
    /// Environment variable: `WORKER_POOL_SIZE`
    #[serde(default = "default_worker_count", alias = "WORKER_POOL_SIZE")]
    pub worker_pool_size: usize,
    /// How often the retry poller looks for due deliveries, in milliseconds.
    ///
    /// Environment variable: `RETRY_POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "RETRY_POLL_INTERVAL_MS")]
    pub retry_poll_interval_ms: u64,
    /// Deliveries claimed per poll.
    ///
    /// Environment variable: `RETRY_BATCH_SIZE`
    #[serde(default = "default_retry_batch_size", alias = "RETRY_BATCH_SIZE")]
    pub retry_batch_size: usize,

    // Retry
    /// Delay before the first retry in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Upper bound on the retry delay in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor", alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,
    /// Timeout tiers in seconds; the last tier repeats.
    ///
    /// Environment variable: `ATTEMPT_TIMEOUTS_SECONDS`, e.g. `[5,10,20]`
    #[serde(default = "default_attempt_timeouts", alias = "ATTEMPT_TIMEOUTS_SECONDS")]
    pub attempt_timeouts_seconds: Vec<u64>,

    // Circuit breaker
    /// Failures within the window that open a circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_FAILURE_THRESHOLD`
    #[serde(default = "default_failure_threshold", alias = "CIRCUIT_BREAKER_FAILURE_THRESHOLD")]
    pub circuit_breaker_failure_threshold: u32,
    /// Half-open successes that close a circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_SUCCESS_THRESHOLD`
    #[serde(default = "default_success_threshold", alias = "CIRCUIT_BREAKER_SUCCESS_THRESHOLD")]
    pub circuit_breaker_success_threshold: u32,
    /// Seconds an open circuit waits before probing.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_RESET_TIMEOUT_SECONDS`
    #[serde(default = "default_reset_timeout", alias = "CIRCUIT_BREAKER_RESET_TIMEOUT_SECONDS")]
    pub circuit_breaker_reset_timeout_seconds: u64,

    // Admission
    /// Retention of idempotency keys in seconds.
    ///
    /// Environment variable: `IDEMPOTENCY_TTL_SECONDS`
    #[serde(default = "default_idempotency_ttl", alias = "IDEMPOTENCY_TTL_SECONDS")]
    pub idempotency_ttl_seconds: u64,

    // Batching
    /// Maximum wait for batches whose subscription sets none, in
    /// milliseconds.
    ///
    /// Environment variable: `BATCH_DEFAULT_MAX_WAIT_MS`
    #[serde(default = "default_batch_max_wait_ms", alias = "BATCH_DEFAULT_MAX_WAIT_MS")]
    pub batch_default_max_wait_ms: u64,
    /// How often stale batches are flushed, in milliseconds.
    ///
    /// Environment variable: `BATCH_SWEEP_INTERVAL_MS`
    #[serde(default = "default_batch_sweep_ms", alias = "BATCH_SWEEP_INTERVAL_MS")]
    pub batch_sweep_interval_ms: u64,

    // Lifecycle
    /// Seconds to wait for in-flight attempts on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Logging
    /// Log filter used when `RUST_LOG` is not set at startup.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Loads defaults, then `courier.toml`, then environment overrides.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Converts to the engine configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_count: self.worker_pool_size,
            poll_interval: Duration::from_millis(self.retry_poll_interval_ms),
            claim_batch_size: self.retry_batch_size,
            retry: self.to_retry_policy(),
            circuit: self.to_circuit_config(),
            idempotency_ttl: Duration::from_secs(self.idempotency_ttl_seconds),
            default_batch_max_wait: Duration::from_millis(self.batch_default_max_wait_ms),
            batch_sweep_interval: Duration::from_millis(self.batch_sweep_interval_ms),
            client: ClientConfig::default(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            ..DeliveryConfig::default()
        }
    }

    /// Converts to the retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            timeouts: self.attempt_timeouts_seconds.iter().copied().map(Duration::from_secs).collect(),
        }
    }

    /// Converts to circuit breaker thresholds.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            reset_timeout: Duration::from_secs(self.circuit_breaker_reset_timeout_seconds),
            success_threshold: self.circuit_breaker_success_threshold,
        }
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        mask_password(&self.database_url)
    }

    fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("database_url must be set");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be greater than 0");
        }

        if self.retry_batch_size == 0 {
            anyhow::bail!("retry_batch_size must be greater than 0");
        }

        if self.retry_poll_interval_ms == 0 {
            anyhow::bail!("retry_poll_interval_ms must be greater than 0");
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("retry_base_delay_ms cannot exceed retry_max_delay_ms");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.attempt_timeouts_seconds.is_empty() || self.attempt_timeouts_seconds.contains(&0) {
            anyhow::bail!("attempt_timeouts_seconds must list at least one non-zero timeout");
        }

        if self.circuit_breaker_failure_threshold == 0 || self.circuit_breaker_success_threshold == 0 {
            anyhow::bail!("circuit breaker thresholds must be greater than 0");
        }

        if self.idempotency_ttl_seconds == 0 {
            anyhow::bail!("idempotency_ttl_seconds must be greater than 0");
        }

        if self.batch_sweep_interval_ms == 0 {
            anyhow::bail!("batch_sweep_interval_ms must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            redis_url: None,
            worker_pool_size: default_worker_count(),
            retry_poll_interval_ms: default_poll_interval_ms(),
            retry_batch_size: default_retry_batch_size(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_jitter_factor: default_jitter_factor(),
            attempt_timeouts_seconds: default_attempt_timeouts(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_success_threshold: default_success_threshold(),
            circuit_breaker_reset_timeout_seconds: default_reset_timeout(),
            idempotency_ttl_seconds: default_idempotency_ttl(),
            batch_default_max_wait_ms: default_batch_max_wait_ms(),
            batch_sweep_interval_ms: default_batch_sweep_ms(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            // A colon right after the scheme means there is no password.
            if !url[colon_pos..].starts_with("://") {
                let mut masked = url.to_string();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
    }
    url.to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_worker_count() -> usize {
    courier_delivery::DEFAULT_WORKER_COUNT
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_retry_batch_size() -> usize {
    courier_delivery::DEFAULT_CLAIM_BATCH_SIZE
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_jitter_factor() -> f64 {
    0.25
}

fn default_attempt_timeouts() -> Vec<u64> {
    vec![5, 10, 20]
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_reset_timeout() -> u64 {
    30
}

fn default_idempotency_ttl() -> u64 {
    24 * 60 * 60
}

fn default_batch_max_wait_ms() -> u64 {
    5_000
}

fn default_batch_sweep_ms() -> u64 {
    1_000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info,courier=debug".to_string()
}
