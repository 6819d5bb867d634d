use std::sync::Arc;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::core::config::WorkerSettings;
use crate::core::metrics::{
    MetricsRegistry, JOBS_FAILED, JOBS_INFLIGHT, JOBS_PROCESSED, JOBS_RETRIED,
};
use crate::core::time::{format_offset, now_utc};
use crate::db::models::{JobPayload, QueuedJob, Submission};
use crate::db::types::{AnalysisStatus, FailureCode, RetryPhase, SubmissionKind};
use crate::repositories::store::{WorkerStore, WorkerTx};
use crate::repositories::submissions::CompletedUpdate;
use crate::services::ports::{
    AdapterError, FeedbackAdapter, FeedbackCapabilities, FeedbackRequest, VisionAdapter,
};
use crate::services::Adapters;

use super::retry::{retries_remaining, schedule_retry};

pub(crate) const MAX_ERROR_MESSAGE_CHARS: usize = 1024;

/// What one leased job ended in; recorded only after the transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Completed,
    Skipped,
    Retried(RetryPhase),
    Failed(FailureCode),
}

/// One lease-process-commit loop over the learning submission queue.
#[derive(Clone)]
pub(crate) struct Worker {
    store: Arc<dyn WorkerStore>,
    vision: Arc<dyn VisionAdapter>,
    feedback: Arc<dyn FeedbackAdapter>,
    capabilities: FeedbackCapabilities,
    settings: WorkerSettings,
    metrics: MetricsRegistry,
}

impl Worker {
    pub(crate) fn new(
        store: Arc<dyn WorkerStore>,
        adapters: Adapters,
        settings: WorkerSettings,
        metrics: MetricsRegistry,
    ) -> Self {
        let capabilities = adapters.feedback.capabilities();
        Self {
            store,
            vision: adapters.vision,
            feedback: adapters.feedback,
            capabilities,
            settings,
            metrics,
        }
    }

    /// Processes at most one job. Returns `false` when nothing was eligible.
    pub(crate) async fn run_once(&self, now: OffsetDateTime) -> Result<bool> {
        let mut tx = self.store.begin().await?;

        let Some(job) = tx.lease_next(now, self.settings.lease_duration()).await? else {
            tx.rollback().await?;
            return Ok(false);
        };

        self.metrics.adjust_gauge(JOBS_INFLIGHT, 1.0, &[]);
        let result = self.finish(tx, &job, now).await;
        self.metrics.adjust_gauge(JOBS_INFLIGHT, -1.0, &[]);

        let outcome = result?;
        self.record(outcome);
        Ok(true)
    }

    async fn finish(
        &self,
        mut tx: Box<dyn WorkerTx>,
        job: &QueuedJob,
        now: OffsetDateTime,
    ) -> Result<JobOutcome> {
        match self.process_job(tx.as_mut(), job, now).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(
                        job_id = %job.id,
                        error = %rollback_err,
                        "Failed to roll back after worker error"
                    );
                }
                Err(err.context(format!("Failed to process learning job {}", job.id)))
            }
        }
    }

    async fn process_job(
        &self,
        tx: &mut dyn WorkerTx,
        job: &QueuedJob,
        now: OffsetDateTime,
    ) -> Result<JobOutcome> {
        let payload = JobPayload::from_value(&job.payload);

        // The owner policy hides every submission until a subject is bound.
        if !payload.student_sub.is_empty() {
            tx.bind_subject(&payload.student_sub).await?;
        }

        let Some(submission) = tx.fetch_submission(job.submission_id).await? else {
            tracing::warn!(
                job_id = %job.id,
                submission_id = %job.submission_id,
                "Submission missing; deleting job"
            );
            tx.delete_job(job.id).await?;
            return Ok(JobOutcome::Skipped);
        };

        if !submission.student_sub.is_empty() && submission.student_sub != payload.student_sub {
            tx.bind_subject(&submission.student_sub).await?;
        }

        if !submission.analysis_status.is_processable() {
            tracing::debug!(
                job_id = %job.id,
                submission_id = %submission.id,
                status = submission.analysis_status.as_str(),
                "Submission already final; deleting job"
            );
            tx.delete_job(job.id).await?;
            return Ok(JobOutcome::Skipped);
        }

        let text_md = match self.extract_text(&submission, &payload).await {
            Ok(text_md) => text_md,
            Err(err) => {
                return self.handle_adapter_error(tx, job, &submission, RetryPhase::Vision, err, now)
                    .await
            }
        };

        let request = FeedbackRequest {
            text_md: &text_md,
            criteria: &payload.criteria,
            instruction_md: payload
                .instruction_md
                .as_deref()
                .filter(|_| self.capabilities.instruction_md),
            hints_md: payload.hints_md.as_deref().filter(|_| self.capabilities.hints_md),
        };

        let feedback = match self.feedback.analyze(request).await {
            Ok(feedback) => feedback,
            Err(err) => {
                return self
                    .handle_adapter_error(tx, job, &submission, RetryPhase::Feedback, err, now)
                    .await
            }
        };

        let update = CompletedUpdate {
            text_md,
            feedback_md: feedback.feedback_md,
            analysis_json: feedback.analysis_json,
        };
        if !tx.mark_completed(submission.id, &update).await? {
            // Another writer finalized the row after it was read; nothing of ours landed.
            tracing::warn!(
                job_id = %job.id,
                submission_id = %submission.id,
                "Completion changed no rows; skipping"
            );
            tx.delete_job(job.id).await?;
            return Ok(JobOutcome::Skipped);
        }
        tx.delete_job(job.id).await?;

        tracing::info!(
            job_id = %job.id,
            submission_id = %submission.id,
            parse_status = feedback.parse_status.as_deref().unwrap_or("unknown"),
            "Learning submission completed"
        );
        Ok(JobOutcome::Completed)
    }

    async fn extract_text(
        &self,
        submission: &Submission,
        payload: &JobPayload,
    ) -> Result<String, AdapterError> {
        // Students' own words reach feedback untouched.
        if submission.kind == SubmissionKind::Text {
            return Ok(submission.text_body.clone().unwrap_or_default());
        }

        if submission.analysis_status == AnalysisStatus::Extracted {
            if let Some(cached) = &payload.cached_text_md {
                tracing::debug!(submission_id = %submission.id, "Using cached extraction");
                return Ok(cached.clone());
            }
        }

        let result = self.vision.extract(submission, payload).await?;
        Ok(result.text_md)
    }

    async fn handle_adapter_error(
        &self,
        tx: &mut dyn WorkerTx,
        job: &QueuedJob,
        submission: &Submission,
        phase: RetryPhase,
        err: AdapterError,
        now: OffsetDateTime,
    ) -> Result<JobOutcome> {
        match (err.phase(), err) {
            (Some(raised), err) if raised == phase => {
                let message = sanitize_error_message(&err.to_string());

                if err.is_transient() && retries_remaining(job.retry_count, self.settings.max_retries)
                {
                    if !tx.mark_retry(submission.id, phase, &message, now).await? {
                        tracing::warn!(
                            job_id = %job.id,
                            submission_id = %submission.id,
                            "Retry bookkeeping changed no rows"
                        );
                    }
                    let next_visible_at =
                        schedule_retry(tx, job, now, self.settings.backoff_seconds).await?;
                    tracing::warn!(
                        job_id = %job.id,
                        submission_id = %submission.id,
                        phase = phase.as_str(),
                        retry = job.retry_count.saturating_add(1),
                        next_visible_at = %format_offset(next_visible_at),
                        reason = %message,
                        "Retry scheduled"
                    );
                    return Ok(JobOutcome::Retried(phase));
                }

                let error_code = err.failure_code();
                if !tx.mark_failed(submission.id, error_code, &message).await? {
                    tracing::warn!(
                        job_id = %job.id,
                        submission_id = %submission.id,
                        "Failure bookkeeping changed no rows"
                    );
                }
                tx.mark_job_failed(job.id, error_code.job_code()).await?;
                tracing::warn!(
                    job_id = %job.id,
                    submission_id = %submission.id,
                    phase = phase.as_str(),
                    error_code = error_code.as_str(),
                    retry = job.retry_count,
                    reason = %message,
                    "Learning submission failed"
                );
                Ok(JobOutcome::Failed(error_code))
            }
            (_, AdapterError::Unexpected(inner)) => {
                Err(inner.context(format!("{} adapter failed unexpectedly", phase.as_str())))
            }
            (Some(raised), _) => Err(anyhow::anyhow!(
                "{} adapter raised a {} error",
                phase.as_str(),
                raised.as_str()
            )),
            (None, err) => Err(anyhow::Error::new(err)),
        }
    }

    fn record(&self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => {
                self.metrics.increment_counter(JOBS_PROCESSED, &[("status", "completed")]);
            }
            JobOutcome::Skipped => {
                self.metrics.increment_counter(JOBS_PROCESSED, &[("status", "skipped")]);
            }
            JobOutcome::Retried(phase) => {
                self.metrics.increment_counter(JOBS_RETRIED, &[("phase", phase.as_str())]);
            }
            JobOutcome::Failed(code) => {
                self.metrics.increment_counter(JOBS_PROCESSED, &[("status", "failed")]);
                self.metrics.increment_counter(JOBS_FAILED, &[("error_code", code.as_str())]);
            }
        }
    }

    /// Polls until `shutdown` flips; sleeps only when the queue was empty.
    pub(crate) async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        let poll_interval = self.settings.poll_interval;
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once(now_utc()).await.context("Worker iteration failed") {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => tracing::error!(error = %format!("{err:#}"), "Learning worker error"),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(poll_interval) => {}
            }
        }
    }
}

/// Trimmed and capped so adapter noise never bloats a row.
pub(crate) fn sanitize_error_message(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        return trimmed.to_string();
    }
    let mut truncated: String = trimmed.chars().take(MAX_ERROR_MESSAGE_CHARS - 3).collect();
    truncated.push_str("...");
    truncated
}
