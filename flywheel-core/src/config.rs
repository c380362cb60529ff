use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{pool::PoolOptions, PgPool};

use crate::health::DbHealthStatus;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_EXPIRED_AFTER_MINUTES: i64 = 60;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;

// A pool config object, designed to be passable across API boundaries
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub db_url: String,
    pub max_connections: Option<u32>,         // Default to 10
    pub min_connections: Option<u32>,         // Default to 1
    pub acquire_timeout_seconds: Option<u64>, // Default to 30
    pub max_lifetime_seconds: Option<u64>,    // Default to 300
    pub idle_timeout_seconds: Option<u64>,    // Default to 60
}

impl PoolConfig {
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        let builder = PoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(10))
            .min_connections(self.min_connections.unwrap_or(1))
            .max_lifetime(Duration::from_secs(
                self.max_lifetime_seconds.unwrap_or(300),
            ))
            .idle_timeout(Duration::from_secs(self.idle_timeout_seconds.unwrap_or(60)))
            .acquire_timeout(Duration::from_secs(
                self.acquire_timeout_seconds.unwrap_or(30),
            ));

        builder.connect(&self.db_url).await
    }
}

/// Retry settings for the transient-error wrapper around store operations.
/// Disabled unless set on [`ManagerConfig::db_retry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u32,
    /// SQLSTATE codes (or substrings of driver messages) treated as
    /// retryable, on top of the structurally-transient sqlx errors.
    pub retryable_codes: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2,
            retryable_codes: vec![
                // PostgreSQL connection-class SQLSTATEs.
                "08000".to_owned(),
                "08003".to_owned(),
                "08006".to_owned(),
                "57P03".to_owned(),
            ],
        }
    }
}

pub type HealthCallback = Arc<dyn Fn(&DbHealthStatus) + Send + Sync>;

/// Settings for the periodic database prober. Disabled unless set on
/// [`ManagerConfig::db_health_check`].
#[derive(Clone, Default)]
pub struct HealthCheckConfig {
    /// Probe cadence; defaults to 30s when zero.
    pub interval_ms: u64,
    /// Invoked once per healthy -> unhealthy transition.
    pub on_unhealthy: Option<HealthCallback>,
    /// Invoked once per unhealthy -> healthy transition.
    pub on_healthy: Option<HealthCallback>,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        if self.interval_ms == 0 {
            Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MS)
        } else {
            Duration::from_millis(self.interval_ms)
        }
    }
}

impl std::fmt::Debug for HealthCheckConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckConfig")
            .field("interval_ms", &self.interval_ms)
            .field("on_unhealthy", &self.on_unhealthy.is_some())
            .field("on_healthy", &self.on_healthy.is_some())
            .finish()
    }
}

/// Manager-wide settings. `Default` matches the documented defaults: 1s
/// polling, graceful SIGTERM handling on, subscription dedup on, DB retry
/// and health probing off.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Prepended to both table names; may carry a schema qualifier
    /// (`"myschema.prefix_"`).
    pub table_prefix: String,
    /// Worker idle wait between empty claims.
    pub poll_interval_ms: u64,
    /// Age at which `cleanup()` moves running rows to expired.
    pub expired_after_minutes: i64,
    /// Register a process termination hook that drains the workers.
    pub graceful_shutdown: bool,
    /// Collapse duplicate subscriptions of the same callback to one.
    pub dedupe_subscriptions: bool,
    pub db_retry: Option<RetryConfig>,
    pub db_health_check: Option<HealthCheckConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            table_prefix: String::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            expired_after_minutes: DEFAULT_EXPIRED_AFTER_MINUTES,
            graceful_shutdown: true,
            dedupe_subscriptions: true,
            db_retry: None,
            db_health_check: None,
        }
    }
}

impl ManagerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
