use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;

use crate::core::state::AppState;
use crate::repositories::store::PgWorkerStore;
use crate::services::Adapters;
use crate::tasks::learning::Worker;

/// Runs `WORKER_CONCURRENCY` independent loops until `shutdown` flips.
///
/// Each loop finishes the job it holds before exiting.
pub(crate) async fn run(state: AppState, shutdown: watch::Receiver<bool>) -> Result<()> {
    let adapters = Adapters::from_settings(state.settings())?;
    let store = Arc::new(PgWorkerStore::new(state.db().clone(), state.queue()));
    let worker = Worker::new(
        store,
        adapters,
        state.settings().worker().clone(),
        state.metrics().clone(),
    );

    let concurrency = state.settings().worker().concurrency;
    tracing::info!(
        concurrency,
        queue = state.queue().name(),
        lease_seconds = state.settings().worker().lease_seconds,
        max_retries = state.settings().worker().max_retries,
        "Learning worker started"
    );

    let mut handles = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run_forever(shutdown).await }));
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Worker loop join failed");
        }
    }

    tracing::info!("Learning worker stopped");
    Ok(())
}
