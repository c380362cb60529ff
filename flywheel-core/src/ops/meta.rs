use chrono::{Duration, Utc};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::QueueError;
use crate::schema::TableNames;
use crate::types::{Job, JobAttempt, JobStatus};

/// Listing filter for `fetch_all`. Defaults: any status, newest first,
/// first 100 rows.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: i64,
    pub offset: i64,
    pub ascending: bool,
    pub since_minutes_ago: Option<i64>,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 100,
            offset: 0,
            ascending: false,
            since_minutes_ago: None,
        }
    }
}

pub async fn find_job<'c, E>(
    executor: E,
    tables: &TableNames,
    uid: Uuid,
) -> Result<Option<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = format!("SELECT * FROM {job} WHERE uid = $1", job = tables.job());

    let job = sqlx::query_as::<_, Job>(&query)
        .bind(uid)
        .fetch_optional(executor)
        .await?;

    Ok(job)
}

pub async fn fetch_all<'c, E>(
    executor: E,
    tables: &TableNames,
    filter: &JobFilter,
) -> Result<Vec<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let mut query: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("SELECT * FROM {} WHERE 1 = 1", tables.job()));

    if let Some(status) = filter.status {
        query.push(" AND status = ");
        query.push_bind(status.as_str());
    }
    if let Some(minutes) = filter.since_minutes_ago {
        query.push(" AND created_at >= ");
        query.push_bind(Utc::now() - Duration::minutes(minutes));
    }
    query.push(if filter.ascending {
        " ORDER BY id ASC"
    } else {
        " ORDER BY id DESC"
    });
    query.push(" LIMIT ");
    query.push_bind(filter.limit);
    query.push(" OFFSET ");
    query.push_bind(filter.offset);

    let jobs = query
        .build_query_as::<Job>()
        .fetch_all(executor)
        .await?;

    Ok(jobs)
}

pub async fn fetch_attempts<'c, E>(
    executor: E,
    tables: &TableNames,
    job_id: i32,
) -> Result<Vec<JobAttempt>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = format!(
        "SELECT * FROM {attempts} WHERE job_id = $1 ORDER BY id ASC",
        attempts = tables.attempts()
    );

    let attempts = sqlx::query_as::<_, JobAttempt>(&query)
        .bind(job_id)
        .fetch_all(executor)
        .await?;

    Ok(attempts)
}
