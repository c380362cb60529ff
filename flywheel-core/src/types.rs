use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgValueRef;
use tracing::warn;
use uuid::Uuid;

use crate::error::{JobError, QueueError};

/// Enumeration of possible statuses for a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// A job that is waiting for a worker to pick it up, or a failed job
    /// waiting for its retry time.
    Pending,
    /// A job currently held by exactly one worker.
    Running,
    /// A job that was successfully completed by a worker.
    Completed,
    /// A job whose attempts are exhausted.
    Failed,
    /// A job whose worker likely died while it was running. Cleanup-only,
    /// never claimed again.
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
        }
    }

    /// True for statuses a job never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Expired
        )
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "expired" => Ok(JobStatus::Expired),
            invalid => Err(QueueError::InvalidInput(format!(
                "{invalid} is not a valid job status"
            ))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// The column is VARCHAR rather than a PG enum, and decoding must go through
// FromStr, so the codec is written out instead of derived. Encoding binds
// as_str() at the call sites.
impl sqlx::Type<sqlx::Postgres> for JobStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <&str as sqlx::Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

/// How the retry delay grows between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// Wait `2^attempts` seconds before the next attempt.
    #[default]
    Exp,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::None => "none",
            BackoffStrategy::Exp => "exp",
        }
    }

    /// Parse a strategy, falling back to `Exp` (with a warning) on anything
    /// unrecognized. Used when decoding rows, so a bad value in the table
    /// degrades instead of wedging the worker.
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "none" => BackoffStrategy::None,
            "exp" => BackoffStrategy::Exp,
            other => {
                warn!(strategy = other, "unknown backoff strategy, using exp");
                BackoffStrategy::Exp
            }
        }
    }
}

impl FromStr for BackoffStrategy {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(BackoffStrategy::None),
            "exp" => Ok(BackoffStrategy::Exp),
            invalid => Err(QueueError::InvalidInput(format!(
                "{invalid} is not a valid backoff strategy"
            ))),
        }
    }
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// The column is VARCHAR rather than a PG enum, and decoding must go through
// parse_lossy, so the codec is written out instead of derived. Encoding binds
// as_str() at the call sites.
impl sqlx::Type<sqlx::Postgres> for BackoffStrategy {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <&str as sqlx::Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for BackoffStrategy {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(BackoffStrategy::parse_lossy(s))
    }
}

/// Terminal status of a single job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Success,
    Error,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Error => "error",
        }
    }
}

// The column is VARCHAR rather than a PG enum, and decoding must go through
// a manual match, so the codec is written out instead of derived. Encoding
// binds as_str() at the call sites.
impl sqlx::Type<sqlx::Postgres> for AttemptStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <&str as sqlx::Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for AttemptStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        match s {
            "success" => Ok(AttemptStatus::Success),
            "error" => Ok(AttemptStatus::Error),
            other => Err(format!("{other} is not a valid attempt status").into()),
        }
    }
}

/// A persistent unit of work with a retry policy, identified externally by
/// `uid`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    /// Server-assigned monotonic id. Claim ordering follows this.
    pub id: i32,
    /// Opaque unique identifier external consumers reference jobs by.
    pub uid: Uuid,
    /// Routing key used to resolve the handler.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    /// Outcome of the successful attempt, `{}` until then.
    pub result: Value,
    /// Number of attempts started so far. Incremented by the claim itself.
    pub attempts: i32,
    pub max_attempts: i32,
    /// Per-attempt deadline in milliseconds. 0 means no deadline.
    pub max_attempt_duration_ms: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job is eligible for a claim.
    pub run_at: DateTime<Utc>,
    /// Claim time of the current attempt. Overwritten on every claim.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the job reaches completed, failed or expired.
    pub completed_at: Option<DateTime<Utc>>,
    pub backoff_strategy: BackoffStrategy,
}

/// A single physical execution of a job, logged as its own row. Rows are
/// never deleted by the core.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct JobAttempt {
    pub id: i32,
    pub job_id: i32,
    /// 1-based, sequential per job.
    pub attempt_number: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Null while the attempt is in flight.
    pub status: Option<AttemptStatus>,
    pub error_message: Option<String>,
    pub error_details: Option<Value>,
}

/// The chunk of data needed to enqueue a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Value,
    pub max_attempts: i32,
    pub backoff_strategy: BackoffStrategy,
    pub max_attempt_duration_ms: i32,
    /// When unset, the job is eligible immediately.
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: Value::Object(Default::default()),
            max_attempts: 3,
            backoff_strategy: BackoffStrategy::Exp,
            max_attempt_duration_ms: 0,
            run_at: None,
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn backoff_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    pub fn max_attempt_duration_ms(mut self, ms: i32) -> Self {
        self.max_attempt_duration_ms = ms;
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), QueueError> {
        if self.job_type.trim().is_empty() {
            return Err(QueueError::InvalidInput(
                "job type must not be empty".to_owned(),
            ));
        }
        if self.max_attempts < 1 {
            return Err(QueueError::InvalidInput(format!(
                "max_attempts must be at least 1, got {}",
                self.max_attempts
            )));
        }
        if self.max_attempt_duration_ms < 0 {
            return Err(QueueError::InvalidInput(format!(
                "max_attempt_duration_ms must not be negative, got {}",
                self.max_attempt_duration_ms
            )));
        }
        Ok(())
    }
}

/// What a handler resolves to on success.
pub type HandlerResult = Result<Value, JobError>;

/// Type-erased job handler. Invoked once per attempt with a snapshot of the
/// claimed row.
pub type JobHandler = Arc<dyn Fn(Job) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap an async closure returning any serializable value into a
/// [`JobHandler`]. If the value cannot be represented as JSON the job still
/// completes, with a stub result explaining why.
pub fn job_handler<F, Fut, T>(f: F) -> JobHandler
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<T, JobError>> + Send + 'static,
    T: Serialize + 'static,
{
    Arc::new(move |job| {
        let fut = f(job);
        async move { Ok(serialize_result(&fut.await?)) }.boxed()
    })
}

/// Handler used when no per-type handler matches and no fallback is set.
/// Lets the pipeline record a completion without user code.
pub fn noop_handler() -> JobHandler {
    Arc::new(|_job| async { Ok(serde_json::json!({ "noop": true })) }.boxed())
}

pub(crate) fn serialize_result<T: Serialize>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(v) => v,
        Err(err) => serde_json::json!({
            "message": "Unable to serialize completed job result",
            "details": err.to_string(),
        }),
    }
}
