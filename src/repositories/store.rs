use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::db::models::{QueuedJob, Submission};
use crate::db::types::{FailureCode, RetryPhase};
use crate::repositories::jobs::{self, QueueTable};
use crate::repositories::submissions::{self, CompletedUpdate};
use crate::repositories::security;

/// Opens the transaction a single lease-process-commit cycle runs in.
#[async_trait]
pub(crate) trait WorkerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn WorkerTx>>;
}

/// Every operation the worker performs against the queue and submission tables.
///
/// Nothing is visible to other sessions until `commit`; dropping the value
/// without committing rolls everything back, lease included.
#[async_trait]
pub(crate) trait WorkerTx: Send {
    async fn lease_next(
        &mut self,
        now: OffsetDateTime,
        lease_duration: Duration,
    ) -> Result<Option<QueuedJob>>;

    async fn bind_subject(&mut self, subject: &str) -> Result<()>;

    async fn fetch_submission(&mut self, submission_id: Uuid) -> Result<Option<Submission>>;

    async fn mark_completed(&mut self, submission_id: Uuid, update: &CompletedUpdate)
        -> Result<bool>;

    async fn mark_failed(
        &mut self,
        submission_id: Uuid,
        error_code: FailureCode,
        message: &str,
    ) -> Result<bool>;

    async fn mark_retry(
        &mut self,
        submission_id: Uuid,
        phase: RetryPhase,
        message: &str,
        attempted_at: OffsetDateTime,
    ) -> Result<bool>;

    async fn requeue_job(
        &mut self,
        job_id: Uuid,
        retry_count: i32,
        visible_at: OffsetDateTime,
    ) -> Result<()>;

    async fn mark_job_failed(&mut self, job_id: Uuid, error_code: FailureCode) -> Result<()>;

    async fn delete_job(&mut self, job_id: Uuid) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[derive(Clone)]
pub(crate) struct PgWorkerStore {
    pool: PgPool,
    queue: QueueTable,
}

impl PgWorkerStore {
    pub(crate) fn new(pool: PgPool, queue: QueueTable) -> Self {
        Self { pool, queue }
    }
}

#[async_trait]
impl WorkerStore for PgWorkerStore {
    async fn begin(&self) -> Result<Box<dyn WorkerTx>> {
        let tx = self.pool.begin().await.context("Failed to open worker transaction")?;
        Ok(Box::new(PgWorkerTx { tx, queue: self.queue }))
    }
}

pub(crate) struct PgWorkerTx {
    tx: Transaction<'static, Postgres>,
    queue: QueueTable,
}

#[async_trait]
impl WorkerTx for PgWorkerTx {
    async fn lease_next(
        &mut self,
        now: OffsetDateTime,
        lease_duration: Duration,
    ) -> Result<Option<QueuedJob>> {
        jobs::lease_next(&mut self.tx, self.queue, now, lease_duration)
            .await
            .context("Failed to lease job")
    }

    async fn bind_subject(&mut self, subject: &str) -> Result<()> {
        security::bind_subject(&mut self.tx, subject).await.context("Failed to bind app.current_sub")
    }

    async fn fetch_submission(&mut self, submission_id: Uuid) -> Result<Option<Submission>> {
        submissions::find_by_id(&mut self.tx, submission_id)
            .await
            .context("Failed to fetch submission")
    }

    async fn mark_completed(
        &mut self,
        submission_id: Uuid,
        update: &CompletedUpdate,
    ) -> Result<bool> {
        submissions::mark_completed(&mut self.tx, submission_id, update)
            .await
            .context("Failed to mark submission completed")
    }

    async fn mark_failed(
        &mut self,
        submission_id: Uuid,
        error_code: FailureCode,
        message: &str,
    ) -> Result<bool> {
        submissions::mark_failed(&mut self.tx, submission_id, error_code, message)
            .await
            .context("Failed to mark submission failed")
    }

    async fn mark_retry(
        &mut self,
        submission_id: Uuid,
        phase: RetryPhase,
        message: &str,
        attempted_at: OffsetDateTime,
    ) -> Result<bool> {
        submissions::mark_retry(&mut self.tx, submission_id, phase, message, attempted_at)
            .await
            .context("Failed to record retry metadata")
    }

    async fn requeue_job(
        &mut self,
        job_id: Uuid,
        retry_count: i32,
        visible_at: OffsetDateTime,
    ) -> Result<()> {
        jobs::requeue(&mut self.tx, self.queue, job_id, retry_count, visible_at)
            .await
            .context("Failed to requeue job")
    }

    async fn mark_job_failed(&mut self, job_id: Uuid, error_code: FailureCode) -> Result<()> {
        jobs::mark_failed(&mut self.tx, self.queue, job_id, error_code)
            .await
            .context("Failed to mark job failed")
    }

    async fn delete_job(&mut self, job_id: Uuid) -> Result<u64> {
        jobs::delete(&mut self.tx, self.queue, job_id).await.context("Failed to delete job")
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("Failed to commit worker transaction")
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.context("Failed to roll back worker transaction")
    }
}
