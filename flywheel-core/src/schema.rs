use sqlx::PgPool;
use tracing::debug;

use crate::error::QueueError;

const JOB_SUFFIX: &str = "job";
const ATTEMPT_SUFFIX: &str = "job_attempt_log";

/// Resolved, quoted table identifiers for one manager instance. The prefix
/// may carry a schema qualifier (`"myschema.prefix_"`); each dot-separated
/// part is quoted separately.
#[derive(Debug, Clone)]
pub struct TableNames {
    job: String,
    attempts: String,
    job_ident: String,
    attempts_ident: String,
}

impl TableNames {
    pub fn new(prefix: &str) -> Self {
        let job_ident = format!("{prefix}{JOB_SUFFIX}");
        let attempts_ident = format!("{prefix}{ATTEMPT_SUFFIX}");
        Self {
            job: quote_qualified(&job_ident),
            attempts: quote_qualified(&attempts_ident),
            job_ident,
            attempts_ident,
        }
    }

    /// Quoted, possibly schema-qualified job table name, ready to splice
    /// into SQL.
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Quoted attempt-log table name.
    pub fn attempts(&self) -> &str {
        &self.attempts
    }

    fn index_name(&self, table_ident: &str, columns: &[&str]) -> String {
        sanitize_ident(&format!("idx_{}_{}", table_ident, columns.join("_")))
    }
}

/// Quote a possibly schema-qualified identifier for the PostgreSQL dialect.
fn quote_qualified(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Strip anything that is not a word character so the result is a bare,
/// valid identifier (index names cannot be schema-qualified).
fn sanitize_ident(ident: &str) -> String {
    ident
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Bring the schema to the expected shape. Idempotent; safe to call on
/// every manager start. With `hard` the two tables are dropped first.
pub async fn initialize(pool: &PgPool, tables: &TableNames, hard: bool) -> Result<(), QueueError> {
    if hard {
        drop_tables(pool, tables).await?;
    }

    let create_job = format!(
        r#"
CREATE TABLE IF NOT EXISTS {job} (
    id SERIAL PRIMARY KEY,
    uid UUID NOT NULL DEFAULT gen_random_uuid(),
    type VARCHAR(255) NOT NULL,
    payload JSONB NOT NULL DEFAULT '{{}}',
    status VARCHAR(20) NOT NULL DEFAULT 'pending',
    result JSONB NOT NULL DEFAULT '{{}}',
    attempts INTEGER DEFAULT 0,
    max_attempts INTEGER DEFAULT 3,
    max_attempt_duration_ms INTEGER DEFAULT 0,
    created_at TIMESTAMPTZ DEFAULT NOW(),
    updated_at TIMESTAMPTZ DEFAULT NOW(),
    run_at TIMESTAMPTZ DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    backoff_strategy VARCHAR(20) NOT NULL DEFAULT 'exp'
)
        "#,
        job = tables.job()
    );

    let create_attempts = format!(
        r#"
CREATE TABLE IF NOT EXISTS {attempts} (
    id SERIAL PRIMARY KEY,
    job_id INTEGER REFERENCES {job}(id),
    attempt_number INTEGER NOT NULL,
    started_at TIMESTAMPTZ DEFAULT NOW(),
    completed_at TIMESTAMPTZ,
    status VARCHAR(20),
    error_message TEXT,
    error_details JSONB
)
        "#,
        attempts = tables.attempts(),
        job = tables.job()
    );

    sqlx::query(&create_job).execute(pool).await?;
    sqlx::query(&create_attempts).execute(pool).await?;

    let indexes = [
        (
            tables.index_name(&tables.job_ident, &["status", "run_at"]),
            tables.job(),
            "(status, run_at)",
        ),
        (
            tables.index_name(&tables.job_ident, &["uid"]),
            tables.job(),
            "(uid)",
        ),
        (
            tables.index_name(&tables.job_ident, &["status"]),
            tables.job(),
            "(status)",
        ),
        (
            tables.index_name(&tables.attempts_ident, &["job_id"]),
            tables.attempts(),
            "(job_id)",
        ),
    ];
    for (name, table, columns) in indexes {
        let stmt = format!("CREATE INDEX IF NOT EXISTS \"{name}\" ON {table} {columns}");
        sqlx::query(&stmt).execute(pool).await?;
    }

    debug!(job = tables.job(), hard, "schema initialized");
    Ok(())
}

/// Drop the two tables. Attempt log first, it holds the foreign key.
pub async fn uninstall(pool: &PgPool, tables: &TableNames) -> Result<(), QueueError> {
    drop_tables(pool, tables).await?;
    debug!(job = tables.job(), "schema uninstalled");
    Ok(())
}

async fn drop_tables(pool: &PgPool, tables: &TableNames) -> Result<(), QueueError> {
    let drop_attempts = format!("DROP TABLE IF EXISTS {}", tables.attempts());
    let drop_job = format!("DROP TABLE IF EXISTS {}", tables.job());
    sqlx::query(&drop_attempts).execute(pool).await?;
    sqlx::query(&drop_job).execute(pool).await?;
    Ok(())
}
