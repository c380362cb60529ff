use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

use crate::backoff::backoff_interval;
use crate::error::{JobError, QueueError};
use crate::schema::TableNames;
use crate::types::Job;

// The query that follows uses a FOR UPDATE SKIP LOCKED clause, which is what
// keeps concurrent claimers from ever being handed the same row. For more
// details on this see: 2ndquadrant.com/en/blog/what-is-select-skip-locked-for-in-postgresql-9-5.
pub async fn claim_next<'c, E>(executor: E, tables: &TableNames) -> Result<Option<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = format!(
        r#"
WITH eligible AS (
    SELECT id
    FROM {job}
    WHERE
        status = 'pending'
        AND run_at <= NOW()
    ORDER BY id ASC
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE {job} AS j
SET
    status = 'running',
    started_at = NOW(),
    updated_at = NOW(),
    attempts = j.attempts + 1
FROM eligible
WHERE j.id = eligible.id
RETURNING j.*
        "#,
        job = tables.job()
    );

    let job = sqlx::query_as::<_, Job>(&query)
        .fetch_optional(executor)
        .await?;

    Ok(job)
}

/// Record the start of a physical attempt. Called after the claim, so
/// `job.attempts` already carries the 1-based attempt number.
pub async fn log_attempt_start<'c, E>(
    executor: E,
    tables: &TableNames,
    job: &Job,
) -> Result<i32, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = format!(
        "INSERT INTO {attempts} (job_id, attempt_number) VALUES ($1, $2) RETURNING id",
        attempts = tables.attempts()
    );

    let id = sqlx::query_scalar::<_, i32>(&query)
        .bind(job.id)
        .bind(job.attempts)
        .fetch_one(executor)
        .await?;

    Ok(id)
}

/// Transition a job to completed and close its attempt row, in one
/// transaction.
pub async fn complete_job(
    pool: &PgPool,
    tables: &TableNames,
    job_id: i32,
    attempt_log_id: i32,
    result: &Value,
) -> Result<Job, QueueError> {
    let mut tx = pool.begin().await?;

    let update_job = format!(
        r#"
UPDATE {job} AS j
SET
    status = 'completed',
    result = $2,
    completed_at = NOW(),
    updated_at = NOW()
WHERE j.id = $1
RETURNING j.*
        "#,
        job = tables.job()
    );
    let job = sqlx::query_as::<_, Job>(&update_job)
        .bind(job_id)
        .bind(result)
        .fetch_one(&mut *tx)
        .await?;

    let update_attempt = format!(
        "UPDATE {attempts} SET status = 'success', completed_at = NOW() WHERE id = $1",
        attempts = tables.attempts()
    );
    sqlx::query(&update_attempt)
        .bind(attempt_log_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(job)
}

/// Close the attempt row with the error, then either fail the job (attempts
/// exhausted) or requeue it with a backed-off `run_at`. One transaction, so
/// the attempt log and the job row never disagree.
pub async fn fail_or_requeue(
    pool: &PgPool,
    tables: &TableNames,
    job: &Job,
    attempt_log_id: i32,
    error: &JobError,
) -> Result<Job, QueueError> {
    let mut tx = pool.begin().await?;

    let update_attempt = format!(
        r#"
UPDATE {attempts}
SET
    status = 'error',
    completed_at = NOW(),
    error_message = $2,
    error_details = $3
WHERE id = $1
        "#,
        attempts = tables.attempts()
    );
    sqlx::query(&update_attempt)
        .bind(attempt_log_id)
        .bind(&error.message)
        .bind(error.details.as_ref())
        .execute(&mut *tx)
        .await?;

    let updated = if job.attempts >= job.max_attempts {
        let fail = format!(
            r#"
UPDATE {job} AS j
SET
    status = 'failed',
    completed_at = NOW(),
    updated_at = NOW()
WHERE j.id = $1
RETURNING j.*
            "#,
            job = tables.job()
        );
        sqlx::query_as::<_, Job>(&fail)
            .bind(job.id)
            .fetch_one(&mut *tx)
            .await?
    } else {
        let run_at = Utc::now() + backoff_interval(job.attempts, job.backoff_strategy);
        let requeue = format!(
            r#"
UPDATE {job} AS j
SET
    status = 'pending',
    run_at = $2,
    updated_at = NOW()
WHERE j.id = $1
RETURNING j.*
            "#,
            job = tables.job()
        );
        sqlx::query_as::<_, Job>(&requeue)
            .bind(job.id)
            .bind(run_at)
            .fetch_one(&mut *tx)
            .await?
    };

    tx.commit().await?;
    Ok(updated)
}
