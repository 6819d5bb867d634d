use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgConnection;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::db::models::QueuedJob;
use crate::db::types::{FailureCode, JobStatus};

pub(crate) const CURRENT_QUEUE_TABLE: &str = "learning_submission_jobs";
pub(crate) const LEGACY_QUEUE_TABLE: &str = "learning_submission_ocr_jobs";

/// The queue table the worker was cleared to use at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueTable {
    name: &'static str,
}

impl QueueTable {
    pub(crate) fn current() -> Self {
        Self { name: CURRENT_QUEUE_TABLE }
    }

    pub(crate) fn name(self) -> &'static str {
        self.name
    }
}

#[derive(Debug, Error)]
pub(crate) enum QueueError {
    #[error(
        "only the deprecated queue table {LEGACY_QUEUE_TABLE} exists; it lacks the worker grants, \
         apply migrations that create {CURRENT_QUEUE_TABLE}"
    )]
    LegacyOnly,
    #[error("queue table {CURRENT_QUEUE_TABLE} does not exist")]
    Missing,
    #[error("lease of {0} runs past the latest representable time")]
    LeaseOverflow(Duration),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub(crate) fn select_queue_table(
    current_exists: bool,
    legacy_exists: bool,
) -> Result<QueueTable, QueueError> {
    match (current_exists, legacy_exists) {
        (true, _) => Ok(QueueTable::current()),
        (false, true) => Err(QueueError::LegacyOnly),
        (false, false) => Err(QueueError::Missing),
    }
}

pub(crate) async fn resolve_queue_table(conn: &mut PgConnection) -> Result<QueueTable, QueueError> {
    let current_exists = table_exists(conn, CURRENT_QUEUE_TABLE).await?;
    let legacy_exists = table_exists(conn, LEGACY_QUEUE_TABLE).await?;

    if current_exists && legacy_exists {
        tracing::warn!(
            legacy = LEGACY_QUEUE_TABLE,
            "Deprecated queue table still present; it is ignored"
        );
    }

    select_queue_table(current_exists, legacy_exists)
}

pub(crate) async fn table_exists(conn: &mut PgConnection, table: &str) -> Result<bool, sqlx::Error> {
    let regclass = sqlx::query_scalar::<_, Option<String>>("SELECT to_regclass($1)::text")
        .bind(format!("public.{table}"))
        .fetch_one(conn)
        .await?;
    Ok(regclass.is_some())
}

pub(crate) fn lease_expiry(
    now: OffsetDateTime,
    lease_duration: Duration,
) -> Result<OffsetDateTime, QueueError> {
    now.checked_add(lease_duration).ok_or(QueueError::LeaseOverflow(lease_duration))
}

/// Leases the oldest visible job, or one whose previous lease has expired.
///
/// `SKIP LOCKED` keeps concurrent workers off rows another transaction holds.
pub(crate) async fn lease_next(
    conn: &mut PgConnection,
    queue: QueueTable,
    now: OffsetDateTime,
    lease_duration: Duration,
) -> Result<Option<QueuedJob>, QueueError> {
    let lease_key = Uuid::new_v4();
    let leased_until = lease_expiry(now, lease_duration)?;
    let table = queue.name();

    let query = format!(
        "WITH candidate AS (
            SELECT id
            FROM {table}
            WHERE (status = $1 AND visible_at <= $3)
               OR (status = $2 AND leased_until <= $3)
            ORDER BY visible_at ASC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE {table} AS jobs
        SET status = $2,
            lease_key = $4,
            leased_until = $5,
            updated_at = now()
        FROM candidate
        WHERE jobs.id = candidate.id
        RETURNING jobs.id, jobs.submission_id, jobs.retry_count, jobs.payload"
    );

    let row = sqlx::query_as::<_, (Uuid, Uuid, i32, Json<Value>)>(&query)
        .bind(JobStatus::Queued)
        .bind(JobStatus::Leased)
        .bind(now)
        .bind(lease_key)
        .bind(leased_until)
        .fetch_optional(conn)
        .await?;

    Ok(row.map(|(id, submission_id, retry_count, payload)| QueuedJob {
        id,
        submission_id,
        retry_count,
        payload: payload.0,
    }))
}

/// Puts the job back in line; the job-level error code is reserved for terminal failures.
pub(crate) async fn requeue(
    conn: &mut PgConnection,
    queue: QueueTable,
    job_id: Uuid,
    retry_count: i32,
    visible_at: OffsetDateTime,
) -> Result<(), sqlx::Error> {
    let query = format!(
        "UPDATE {} SET status = $1, retry_count = $2, visible_at = $3, lease_key = NULL,
             leased_until = NULL, error_code = NULL, updated_at = now()
         WHERE id = $4",
        queue.name()
    );
    sqlx::query(&query)
        .bind(JobStatus::Queued)
        .bind(retry_count)
        .bind(visible_at)
        .bind(job_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Terminal failure; the row is kept for audit and never leased again.
pub(crate) async fn mark_failed(
    conn: &mut PgConnection,
    queue: QueueTable,
    job_id: Uuid,
    error_code: FailureCode,
) -> Result<(), sqlx::Error> {
    let query = format!(
        "UPDATE {} SET status = $1, error_code = $2, lease_key = NULL, leased_until = NULL,
             updated_at = now()
         WHERE id = $3",
        queue.name()
    );
    sqlx::query(&query)
        .bind(JobStatus::Failed)
        .bind(error_code.as_str())
        .bind(job_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub(crate) async fn delete(
    conn: &mut PgConnection,
    queue: QueueTable,
    job_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let query = format!("DELETE FROM {} WHERE id = $1", queue.name());
    let result = sqlx::query(&query).bind(job_id).execute(conn).await?;
    Ok(result.rows_affected())
}
