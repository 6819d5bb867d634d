use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::models::Submission;

use super::types::COLUMNS;

/// Rows hidden by the owner policy come back as `None`, same as deleted ones.
pub(crate) async fn find_by_id(
    conn: &mut PgConnection,
    submission_id: Uuid,
) -> Result<Option<Submission>, sqlx::Error> {
    let query = format!("SELECT {COLUMNS} FROM learning_submissions WHERE id = $1");
    sqlx::query_as::<_, Submission>(&query).bind(submission_id).fetch_optional(conn).await
}
