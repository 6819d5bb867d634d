pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod repositories;
pub(crate) mod services;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use anyhow::Context;

use crate::core::{config::Settings, metrics::MetricsRegistry, state::AppState, telemetry};

pub async fn run_worker() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await.context("Failed to connect to Postgres")?;
    if settings.database().run_migrations {
        db::run_migrations(&db_pool).await.context("Failed to apply migrations")?;
    }

    let queue = {
        let mut conn = db_pool.acquire().await.context("Failed to acquire connection")?;
        repositories::jobs::resolve_queue_table(&mut conn).await?
    };

    let state = AppState::new(settings, db_pool, queue, MetricsRegistry::new());
    let shutdown = core::shutdown::shutdown_channel();

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;
    tracing::info!(
        addr = %state.settings().server_addr(),
        environment = state.settings().runtime().environment.as_str(),
        queue = state.queue().name(),
        "Learning worker health endpoint listening"
    );

    let mut http_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    let result = tasks::scheduler::run(state, shutdown).await;

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "Health server failed"),
        Err(err) => tracing::error!(error = %err, "Health server join failed"),
    }

    result
}
