use sqlx::Row;

fn database_url() -> Option<String> {
    // Integration tests read .env directly; they do not go through app config.
    dotenvy::dotenv().ok();

    std::env::var("LEARNING_TEST_DATABASE_URL").ok().filter(|url| !url.trim().is_empty())
}

#[tokio::test]
async fn migrations_apply_and_worker_objects_exist() -> anyhow::Result<()> {
    let Some(database_url) = database_url() else {
        eprintln!("LEARNING_TEST_DATABASE_URL is not set; skipping");
        return Ok(());
    };

    let pool =
        sqlx::postgres::PgPoolOptions::new().max_connections(1).connect(&database_url).await?;

    let migrations_dir =
        std::env::var("LEARNING_MIGRATIONS_DIR").unwrap_or_else(|_| "migrations".to_string());
    let migrator = sqlx::migrate::Migrator::new(std::path::Path::new(&migrations_dir)).await?;
    migrator.run(&pool).await?;

    for table in ["learning_submissions", "learning_submission_jobs"] {
        let row = sqlx::query("SELECT to_regclass($1)::text").bind(table).fetch_one(&pool).await?;
        let regclass: Option<String> = row.try_get(0)?;
        assert!(regclass.is_some(), "expected table {table} to exist after migrations");
    }

    let legacy: Option<String> =
        sqlx::query_scalar("SELECT to_regclass('learning_submission_ocr_jobs')::text")
            .fetch_one(&pool)
            .await?;
    assert!(legacy.is_none(), "deprecated queue table should be dropped");

    for signature in [
        "learning_worker_update_completed(uuid, text, text, jsonb)",
        "learning_worker_update_failed(uuid, text, text)",
        "learning_worker_mark_retry(uuid, text, text, timestamptz)",
    ] {
        let found: Option<String> = sqlx::query_scalar("SELECT to_regprocedure($1)::text")
            .bind(signature)
            .fetch_one(&pool)
            .await?;
        assert!(found.is_some(), "expected function {signature} to exist after migrations");
    }

    let forced: bool = sqlx::query_scalar(
        "SELECT relforcerowsecurity FROM pg_class WHERE relname = 'learning_submissions'",
    )
    .fetch_one(&pool)
    .await?;
    assert!(forced, "row policies must apply to the table owner too");

    Ok(())
}
