use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{HealthCallback, HealthCheckConfig};

/// One observation of the database connection, as recorded by the prober.
#[derive(Debug, Clone, Serialize)]
pub struct DbHealthStatus {
    pub healthy: bool,
    pub latency_ms: u64,
    /// Driver error string when the probe failed.
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
    /// Version token extracted from `SELECT version()`, e.g. "16.2".
    pub server_version: Option<String>,
}

/// Periodic database prober. Issues `SELECT version(), NOW()` on an
/// interval, keeps the last observed status, and invokes the configured
/// callbacks exactly once per healthy/unhealthy transition.
pub struct HealthMonitor {
    pool: PgPool,
    config: HealthCheckConfig,
    last: Arc<RwLock<Option<DbHealthStatus>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(pool: PgPool, config: HealthCheckConfig) -> Self {
        Self {
            pool,
            config,
            last: Arc::new(RwLock::new(None)),
            task: Mutex::new(None),
        }
    }

    /// Start probing. A second call restarts the timer.
    pub fn start(&self) {
        self.stop();

        let pool = self.pool.clone();
        let last = self.last.clone();
        let interval = self.config.interval();
        let on_healthy = self.config.on_healthy.clone();
        let on_unhealthy = self.config.on_unhealthy.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let status = probe(&pool).await;
                record(&last, status, on_healthy.as_ref(), on_unhealthy.as_ref());
            }
        });

        *self.task.lock().unwrap() = Some(handle);
    }

    /// Clear the timer. The last observed status stays readable.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Last observed status, or none if no probe has run yet.
    pub fn last_status(&self) -> Option<DbHealthStatus> {
        self.last.read().unwrap().clone()
    }

    /// Probe immediately, recording the observation (and firing transition
    /// callbacks) as if the timer had fired.
    pub async fn check_now(&self) -> DbHealthStatus {
        let status = probe(&self.pool).await;
        record(
            &self.last,
            status.clone(),
            self.config.on_healthy.as_ref(),
            self.config.on_unhealthy.as_ref(),
        );
        status
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record(
    last: &Arc<RwLock<Option<DbHealthStatus>>>,
    status: DbHealthStatus,
    on_healthy: Option<&HealthCallback>,
    on_unhealthy: Option<&HealthCallback>,
) {
    let previous_healthy = {
        let mut guard = last.write().unwrap();
        let previous = guard.as_ref().map(|s| s.healthy);
        *guard = Some(status.clone());
        previous
    };

    // Only a transition fires a callback; steady state stays quiet.
    match (previous_healthy, status.healthy) {
        (Some(false) | None, true) => {
            if previous_healthy.is_some() {
                info!(latency_ms = status.latency_ms, "database became healthy");
            }
            if let Some(callback) = on_healthy {
                callback(&status);
            }
        }
        (Some(true) | None, false) => {
            warn!(
                error = status.error.as_deref().unwrap_or("unknown"),
                "database became unhealthy"
            );
            if let Some(callback) = on_unhealthy {
                callback(&status);
            }
        }
        _ => {}
    }
}

/// One-shot probe used by both the timer and `check_db_health`.
pub async fn probe(pool: &PgPool) -> DbHealthStatus {
    let started = std::time::Instant::now();
    let result: Result<(String, DateTime<Utc>), sqlx::Error> =
        sqlx::query_as("SELECT version(), NOW()").fetch_one(pool).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok((version, _now)) => DbHealthStatus {
            healthy: true,
            latency_ms,
            error: None,
            checked_at: Utc::now(),
            server_version: extract_version_token(&version),
        },
        Err(error) => DbHealthStatus {
            healthy: false,
            latency_ms,
            error: Some(error.to_string()),
            checked_at: Utc::now(),
            server_version: None,
        },
    }
}

/// "PostgreSQL 16.2 on x86_64-pc-linux-gnu, ..." -> "16.2"
fn extract_version_token(version: &str) -> Option<String> {
    version.split_whitespace().nth(1).map(str::to_owned)
}
