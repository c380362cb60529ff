use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::db_retry;
use crate::error::{JobError, QueueError};
use crate::ops;
use crate::ops::janitor::HealthPreviewRow;
use crate::ops::meta::JobFilter;
use crate::schema::TableNames;
use crate::types::{Job, JobAttempt, NewJob};

/// Thin transactional accessor over the raw operations. Mostly exists so
/// the manager, workers and executor share one place that knows the table
/// names and the optional transient-error retry policy.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    tables: TableNames,
    retry: Option<RetryConfig>,
}

impl Store {
    pub fn new(pool: PgPool, tables: TableNames) -> Self {
        Self {
            pool,
            tables,
            retry: None,
        }
    }

    pub fn with_retry(mut self, config: Option<RetryConfig>) -> Self {
        self.retry = config;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    async fn run<T, F, Fut>(&self, f: F) -> Result<T, QueueError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, QueueError>>,
    {
        match &self.retry {
            Some(config) => db_retry::with_retry(config, f).await,
            None => f().await,
        }
    }

    /// Validate and insert a new job; the returned row carries the
    /// server-assigned id and uid.
    pub async fn insert(&self, new: &NewJob) -> Result<Job, QueueError> {
        new.validate()?;
        self.run(|| ops::manager::create_job(&self.pool, &self.tables, new))
            .await
    }

    /// Atomically claim the oldest eligible pending job, if any. The claim
    /// itself moves the row to `running` and increments `attempts`; under N
    /// concurrent claimers each eligible row is returned to exactly one.
    pub async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        self.run(|| ops::worker::claim_next(&self.pool, &self.tables))
            .await
    }

    pub async fn log_attempt_start(&self, job: &Job) -> Result<i32, QueueError> {
        self.run(|| ops::worker::log_attempt_start(&self.pool, &self.tables, job))
            .await
    }

    pub async fn complete(
        &self,
        job_id: i32,
        attempt_log_id: i32,
        result: &Value,
    ) -> Result<Job, QueueError> {
        self.run(|| ops::worker::complete_job(&self.pool, &self.tables, job_id, attempt_log_id, result))
            .await
    }

    pub async fn fail_or_requeue(
        &self,
        job: &Job,
        attempt_log_id: i32,
        error: &JobError,
    ) -> Result<Job, QueueError> {
        self.run(|| ops::worker::fail_or_requeue(&self.pool, &self.tables, job, attempt_log_id, error))
            .await
    }

    pub async fn find(&self, uid: Uuid) -> Result<Option<Job>, QueueError> {
        self.run(|| ops::meta::find_job(&self.pool, &self.tables, uid))
            .await
    }

    pub async fn fetch_all(&self, filter: &JobFilter) -> Result<Vec<Job>, QueueError> {
        self.run(|| ops::meta::fetch_all(&self.pool, &self.tables, filter))
            .await
    }

    pub async fn fetch_attempts(&self, job_id: i32) -> Result<Vec<JobAttempt>, QueueError> {
        self.run(|| ops::meta::fetch_attempts(&self.pool, &self.tables, job_id))
            .await
    }

    pub async fn mark_expired(&self, max_running_minutes: i64) -> Result<u64, QueueError> {
        self.run(|| ops::janitor::mark_expired(&self.pool, &self.tables, max_running_minutes))
            .await
    }

    pub async fn health_preview(
        &self,
        since_minutes: i64,
    ) -> Result<Vec<HealthPreviewRow>, QueueError> {
        self.run(|| ops::janitor::health_preview(&self.pool, &self.tables, since_minutes))
            .await
    }

    pub async fn count_pending(&self) -> Result<u64, QueueError> {
        self.run(|| ops::janitor::count_pending(&self.pool, &self.tables))
            .await
    }
}
