use sqlx::types::Json;
use sqlx::PgConnection;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::types::{FailureCode, RetryPhase};

use super::types::CompletedUpdate;

// All three helpers are SECURITY DEFINER functions that re-check ownership and
// that the row is still pending/extracted. They return whether a row changed.

pub(crate) async fn mark_completed(
    conn: &mut PgConnection,
    submission_id: Uuid,
    update: &CompletedUpdate,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(
        "SELECT learning_worker_update_completed($1, $2, $3, $4)",
    )
    .bind(submission_id)
    .bind(&update.text_md)
    .bind(&update.feedback_md)
    .bind(Json(&update.analysis_json))
    .fetch_one(conn)
    .await
}

pub(crate) async fn mark_failed(
    conn: &mut PgConnection,
    submission_id: Uuid,
    error_code: FailureCode,
    message: &str,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>("SELECT learning_worker_update_failed($1, $2, $3)")
        .bind(submission_id)
        .bind(error_code.as_str())
        .bind(message)
        .fetch_one(conn)
        .await
}

pub(crate) async fn mark_retry(
    conn: &mut PgConnection,
    submission_id: Uuid,
    phase: RetryPhase,
    message: &str,
    attempted_at: OffsetDateTime,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>("SELECT learning_worker_mark_retry($1, $2, $3, $4)")
        .bind(submission_id)
        .bind(phase.as_str())
        .bind(message)
        .bind(attempted_at)
        .fetch_one(conn)
        .await
}
