use crate::error::QueueError;
use crate::schema::TableNames;
use crate::types::{Job, NewJob};

/// Insert a job row and return it. `uid`, `status`, `attempts` and the
/// timestamps are all server-assigned; `run_at` falls back to NOW() when
/// the caller did not defer the job.
pub async fn create_job<'c, E>(
    executor: E,
    tables: &TableNames,
    new: &NewJob,
) -> Result<Job, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = format!(
        r#"
INSERT INTO {job}
    (type, payload, max_attempts, backoff_strategy, max_attempt_duration_ms, run_at)
VALUES
    ($1, $2, $3, $4, $5, COALESCE($6, NOW()))
RETURNING *
        "#,
        job = tables.job()
    );

    let job = sqlx::query_as::<_, Job>(&query)
        .bind(&new.job_type)
        .bind(&new.payload)
        .bind(new.max_attempts)
        .bind(new.backoff_strategy.as_str())
        .bind(new.max_attempt_duration_ms)
        .bind(new.run_at)
        .fetch_one(executor)
        .await?;

    Ok(job)
}
