use chrono::{Duration, Utc};

use crate::error::QueueError;
use crate::schema::TableNames;
use crate::types::JobStatus;

/// Aggregated per-status row returned by the health preview.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct HealthPreviewRow {
    pub status: JobStatus,
    pub count: i64,
    /// Mean `completed_at - started_at` in seconds; null when no row in the
    /// group has both stamps.
    pub avg_duration_seconds: Option<f64>,
}

/// Move rows stuck in `running` beyond the threshold to `expired`. Attempt
/// rows are left untouched; nothing resurrects expired jobs.
pub async fn mark_expired<'c, E>(
    executor: E,
    tables: &TableNames,
    max_running_minutes: i64,
) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let oldest_valid_start = Utc::now() - Duration::minutes(max_running_minutes);
    let query = format!(
        r#"
UPDATE {job}
SET
    status = 'expired',
    completed_at = NOW(),
    updated_at = NOW()
WHERE
    status = 'running'
    AND started_at < $1
        "#,
        job = tables.job()
    );

    let result = sqlx::query(&query)
        .bind(oldest_valid_start)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Per-status counts and average attempt duration over jobs created in the
/// window.
pub async fn health_preview<'c, E>(
    executor: E,
    tables: &TableNames,
    since_minutes: i64,
) -> Result<Vec<HealthPreviewRow>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let window_start = Utc::now() - Duration::minutes(since_minutes);
    let query = format!(
        r#"
SELECT
    status,
    COUNT(*) AS count,
    AVG(EXTRACT(EPOCH FROM (completed_at - started_at)))::float8 AS avg_duration_seconds
FROM {job}
WHERE created_at >= $1
GROUP BY status
ORDER BY status
        "#,
        job = tables.job()
    );

    let rows = sqlx::query_as::<_, HealthPreviewRow>(&query)
        .bind(window_start)
        .fetch_all(executor)
        .await?;

    Ok(rows)
}

pub async fn count_pending<'c, E>(executor: E, tables: &TableNames) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = format!(
        "SELECT COUNT(*) FROM {job} WHERE status = 'pending' AND run_at <= NOW()",
        job = tables.job()
    );

    let count = sqlx::query_scalar::<_, i64>(&query)
        .fetch_one(executor)
        .await?;

    Ok(count.max(0) as u64)
}
