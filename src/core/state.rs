use std::sync::Arc;

use sqlx::PgPool;

use crate::core::{config::Settings, metrics::MetricsRegistry};
use crate::repositories::jobs::QueueTable;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    db: PgPool,
    queue: QueueTable,
    metrics: MetricsRegistry,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        db: PgPool,
        queue: QueueTable,
        metrics: MetricsRegistry,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, db, queue, metrics }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub(crate) fn queue(&self) -> QueueTable {
        self.inner.queue
    }

    pub(crate) fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }
}
