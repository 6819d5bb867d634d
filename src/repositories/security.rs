use sqlx::PgConnection;

/// Binds `app.current_sub` for the rest of the current transaction.
///
/// Row policies on `learning_submissions` compare against this setting, so it
/// must be set before every read or write of a submission row.
pub(crate) async fn bind_subject(conn: &mut PgConnection, subject: &str) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT set_config('app.current_sub', $1, true)")
        .bind(subject)
        .execute(conn)
        .await?;
    Ok(())
}
