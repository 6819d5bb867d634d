use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::db::models::{JobPayload, QueuedJob, Submission};
use crate::db::types::{AnalysisStatus, FailureCode, JobStatus, RetryPhase, SubmissionKind};
use crate::repositories::store::{WorkerStore, WorkerTx};
use crate::repositories::submissions::CompletedUpdate;
use crate::services::ports::{
    AdapterError, FeedbackAdapter, FeedbackCapabilities, FeedbackRequest, FeedbackResult,
    VisionAdapter, VisionResult,
};

const TEST_DATABASE_URL_ENV: &str = "LEARNING_TEST_DATABASE_URL";

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

/// Serializes tests that lease from the shared test database.
pub(crate) async fn pg_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    std::env::set_var("LEARNING_ENV", "test");
    std::env::set_var("LEARNING_STRICT_CONFIG", "0");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    std::env::remove_var("ENVIRONMENT");
    std::env::remove_var("DATABASE_URL");
    std::env::remove_var("LEARNING_DATABASE_URL");
    for key in [
        "WORKER_LEASE_SECONDS",
        "WORKER_MAX_RETRIES",
        "WORKER_BACKOFF_SECONDS",
        "WORKER_POLL_INTERVAL",
        "WORKER_CONCURRENCY",
        "WORKER_HTTP_HOST",
        "WORKER_HTTP_PORT",
        "AI_BACKEND",
        "AI_TIMEOUT_VISION",
        "AI_TIMEOUT_FEEDBACK",
        "OLLAMA_BASE_URL",
        "LEARNING_MAX_UPLOAD_BYTES",
    ] {
        std::env::remove_var(key);
    }
}

/// Pool for Postgres-backed tests; `None` skips them when no database is configured.
pub(crate) async fn test_pool() -> Option<PgPool> {
    let url = std::env::var(TEST_DATABASE_URL_ENV).ok().filter(|url| !url.trim().is_empty())?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("test database");
    crate::db::run_migrations(&pool).await.expect("migrations");
    Some(pool)
}

/// Inserts a submission and one queued job for it, committed so other sessions see both.
pub(crate) async fn seed_pg_job(
    pool: &PgPool,
    submission: &Submission,
    payload: Value,
    visible_at: OffsetDateTime,
) -> Result<Uuid> {
    let mut tx = pool.begin().await?;
    crate::repositories::security::bind_subject(&mut *tx, &submission.student_sub).await?;
    sqlx::query(
        "INSERT INTO learning_submissions
             (id, course_id, task_id, student_sub, kind, text_body, storage_key, mime_type,
              size_bytes, sha256, analysis_status)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(submission.id)
    .bind(submission.course_id)
    .bind(submission.task_id)
    .bind(&submission.student_sub)
    .bind(submission.kind)
    .bind(&submission.text_body)
    .bind(&submission.storage_key)
    .bind(&submission.mime_type)
    .bind(submission.size_bytes)
    .bind(&submission.sha256)
    .bind(submission.analysis_status)
    .execute(&mut *tx)
    .await?;
    let job_id = sqlx::query_scalar::<_, Uuid>(
        "INSERT INTO learning_submission_jobs (submission_id, payload, visible_at, created_at)
         VALUES ($1, $2, $3, $3)
         RETURNING id",
    )
    .bind(submission.id)
    .bind(sqlx::types::Json(payload))
    .bind(visible_at)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(job_id)
}

/// Deletes a seeded submission; its jobs go with it.
pub(crate) async fn remove_pg_submission(pool: &PgPool, submission: &Submission) -> Result<()> {
    let mut tx = pool.begin().await?;
    crate::repositories::security::bind_subject(&mut *tx, &submission.student_sub).await?;
    sqlx::query("DELETE FROM learning_submissions WHERE id = $1")
        .bind(submission.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub(crate) fn fixed_now() -> OffsetDateTime {
    time::macros::datetime!(2025-03-01 12:00:00 UTC)
}

#[derive(Debug, Clone)]
pub(crate) struct StoredJob {
    pub(crate) id: Uuid,
    pub(crate) submission_id: Uuid,
    pub(crate) status: JobStatus,
    pub(crate) retry_count: i32,
    pub(crate) payload: Value,
    pub(crate) lease_key: Option<Uuid>,
    pub(crate) leased_until: Option<OffsetDateTime>,
    pub(crate) visible_at: OffsetDateTime,
    pub(crate) error_code: Option<String>,
    pub(crate) created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub(crate) struct StoredSubmission {
    pub(crate) row: Submission,
    pub(crate) text_md: Option<String>,
    pub(crate) feedback_md: Option<String>,
    pub(crate) analysis_json: Option<Value>,
    pub(crate) error_code: Option<String>,
    pub(crate) vision_attempts: i32,
    pub(crate) vision_last_error: Option<String>,
    pub(crate) vision_last_attempt_at: Option<OffsetDateTime>,
    pub(crate) feedback_last_error: Option<String>,
    pub(crate) feedback_last_attempt_at: Option<OffsetDateTime>,
    pub(crate) completed: bool,
}

impl StoredSubmission {
    fn new(row: Submission) -> Self {
        Self {
            row,
            text_md: None,
            feedback_md: None,
            analysis_json: None,
            error_code: None,
            vision_attempts: 0,
            vision_last_error: None,
            vision_last_attempt_at: None,
            feedback_last_error: None,
            feedback_last_attempt_at: None,
            completed: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryState {
    pub(crate) jobs: Vec<StoredJob>,
    pub(crate) submissions: HashMap<Uuid, StoredSubmission>,
    /// Rows whose privileged writes change nothing, as when another writer got there first.
    pub(crate) finalized_elsewhere: HashSet<Uuid>,
    pub(crate) commits: usize,
    pub(crate) rollbacks: usize,
}

/// Transactional in-memory stand-in for the Postgres queue and submission tables.
///
/// A transaction works on a private copy and holds the store lock until it
/// commits or is dropped, so uncommitted writes are never observed.
#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn insert_submission(&self, row: Submission) {
        self.state.lock().await.submissions.insert(row.id, StoredSubmission::new(row));
    }

    pub(crate) async fn enqueue(&self, submission: &Submission, payload: Value) -> Uuid {
        let mut state = self.state.lock().await;
        let id = Uuid::new_v4();
        let created_at = fixed_now() + Duration::milliseconds(state.jobs.len() as i64);
        state.jobs.push(StoredJob {
            id,
            submission_id: submission.id,
            status: JobStatus::Queued,
            retry_count: 0,
            payload,
            lease_key: None,
            leased_until: None,
            visible_at: fixed_now() - Duration::seconds(1),
            error_code: None,
            created_at,
        });
        id
    }

    pub(crate) async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    pub(crate) async fn job(&self, job_id: Uuid) -> Option<StoredJob> {
        self.state.lock().await.jobs.iter().find(|job| job.id == job_id).cloned()
    }

    pub(crate) async fn submission(&self, submission_id: Uuid) -> Option<StoredSubmission> {
        self.state.lock().await.submissions.get(&submission_id).cloned()
    }

    /// Makes every privileged write to the submission a no-op while reads still see it.
    pub(crate) async fn finalize_elsewhere(&self, submission_id: Uuid) {
        self.state.lock().await.finalized_elsewhere.insert(submission_id);
    }

    pub(crate) async fn update_job(&self, job_id: Uuid, update: impl FnOnce(&mut StoredJob)) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.iter_mut().find(|job| job.id == job_id) {
            update(job);
        }
    }
}

#[async_trait]
impl WorkerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn WorkerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working, subject: None }))
    }
}

pub(crate) struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    subject: Option<String>,
}

impl MemoryTx {
    /// Mirrors the ownership and status checks of the privileged SQL functions.
    fn writable(&mut self, submission_id: Uuid) -> Option<&mut StoredSubmission> {
        let subject = self.subject.clone()?;
        if self.working.finalized_elsewhere.contains(&submission_id) {
            return None;
        }
        self.working.submissions.get_mut(&submission_id).filter(|stored| {
            stored.row.student_sub == subject && stored.row.analysis_status.is_processable()
        })
    }

    fn job_mut(&mut self, job_id: Uuid) -> Option<&mut StoredJob> {
        self.working.jobs.iter_mut().find(|job| job.id == job_id)
    }
}

#[async_trait]
impl WorkerTx for MemoryTx {
    async fn lease_next(
        &mut self,
        now: OffsetDateTime,
        lease_duration: Duration,
    ) -> Result<Option<QueuedJob>> {
        let leased_until = crate::repositories::jobs::lease_expiry(now, lease_duration)?;
        let candidate = self
            .working
            .jobs
            .iter_mut()
            .filter(|job| match job.status {
                JobStatus::Queued => job.visible_at <= now,
                JobStatus::Leased => job.leased_until.is_some_and(|until| until <= now),
                JobStatus::Failed => false,
            })
            .min_by_key(|job| (job.visible_at, job.created_at));

        Ok(candidate.map(|job| {
            job.status = JobStatus::Leased;
            job.lease_key = Some(Uuid::new_v4());
            job.leased_until = Some(leased_until);
            QueuedJob {
                id: job.id,
                submission_id: job.submission_id,
                retry_count: job.retry_count,
                payload: job.payload.clone(),
            }
        }))
    }

    async fn bind_subject(&mut self, subject: &str) -> Result<()> {
        self.subject = Some(subject.to_string());
        Ok(())
    }

    async fn fetch_submission(&mut self, submission_id: Uuid) -> Result<Option<Submission>> {
        let subject = self.subject.as_deref();
        Ok(self
            .working
            .submissions
            .get(&submission_id)
            .filter(|stored| Some(stored.row.student_sub.as_str()) == subject)
            .map(|stored| stored.row.clone()))
    }

    async fn mark_completed(
        &mut self,
        submission_id: Uuid,
        update: &CompletedUpdate,
    ) -> Result<bool> {
        let Some(stored) = self.writable(submission_id) else {
            return Ok(false);
        };
        stored.row.analysis_status = AnalysisStatus::Completed;
        stored.text_md = Some(update.text_md.clone());
        stored.feedback_md = Some(update.feedback_md.clone());
        stored.analysis_json = Some(update.analysis_json.clone());
        stored.error_code = None;
        stored.completed = true;
        Ok(true)
    }

    async fn mark_failed(
        &mut self,
        submission_id: Uuid,
        error_code: FailureCode,
        message: &str,
    ) -> Result<bool> {
        let Some(stored) = self.writable(submission_id) else {
            return Ok(false);
        };
        stored.row.analysis_status = AnalysisStatus::Failed;
        stored.error_code = Some(error_code.as_str().to_string());
        match error_code {
            FailureCode::VisionFailed => {
                stored.vision_attempts += 1;
                stored.vision_last_error = Some(message.to_string());
                stored.vision_last_attempt_at = Some(fixed_now());
            }
            FailureCode::FeedbackFailed => {
                stored.feedback_last_error = Some(message.to_string());
                stored.feedback_last_attempt_at = Some(fixed_now());
            }
            FailureCode::InputCorrupt | FailureCode::InputUnsupported | FailureCode::InputTooLarge => {
                stored.vision_last_error = Some(message.to_string());
            }
        }
        Ok(true)
    }

    async fn mark_retry(
        &mut self,
        submission_id: Uuid,
        phase: RetryPhase,
        message: &str,
        attempted_at: OffsetDateTime,
    ) -> Result<bool> {
        let Some(stored) = self.writable(submission_id) else {
            return Ok(false);
        };
        stored.error_code = Some(phase.retrying_code().to_string());
        match phase {
            RetryPhase::Vision => {
                stored.vision_attempts += 1;
                stored.vision_last_error = Some(message.to_string());
                stored.vision_last_attempt_at = Some(attempted_at);
            }
            RetryPhase::Feedback => {
                stored.feedback_last_error = Some(message.to_string());
                stored.feedback_last_attempt_at = Some(attempted_at);
            }
        }
        Ok(true)
    }

    async fn requeue_job(
        &mut self,
        job_id: Uuid,
        retry_count: i32,
        visible_at: OffsetDateTime,
    ) -> Result<()> {
        if let Some(job) = self.job_mut(job_id) {
            job.status = JobStatus::Queued;
            job.retry_count = retry_count;
            job.visible_at = visible_at;
            job.lease_key = None;
            job.leased_until = None;
            job.error_code = None;
        }
        Ok(())
    }

    async fn mark_job_failed(&mut self, job_id: Uuid, error_code: FailureCode) -> Result<()> {
        if let Some(job) = self.job_mut(job_id) {
            job.status = JobStatus::Failed;
            job.error_code = Some(error_code.as_str().to_string());
            job.lease_key = None;
            job.leased_until = None;
        }
        Ok(())
    }

    async fn delete_job(&mut self, job_id: Uuid) -> Result<u64> {
        let before = self.working.jobs.len();
        self.working.jobs.retain(|job| job.id != job_id);
        Ok((before - self.working.jobs.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, mut working, .. } = *self;
        working.commits = guard.commits + 1;
        working.rollbacks = guard.rollbacks;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut guard = self.guard;
        guard.rollbacks += 1;
        Ok(())
    }
}

pub(crate) fn submission(kind: SubmissionKind, student_sub: &str) -> Submission {
    Submission {
        id: Uuid::new_v4(),
        course_id: Uuid::new_v4(),
        task_id: Uuid::new_v4(),
        student_sub: student_sub.to_string(),
        kind,
        text_body: None,
        storage_key: None,
        mime_type: None,
        size_bytes: None,
        sha256: None,
        analysis_status: AnalysisStatus::Pending,
    }
}

pub(crate) fn text_submission(student_sub: &str, text_body: &str) -> Submission {
    Submission { text_body: Some(text_body.to_string()), ..submission(SubmissionKind::Text, student_sub) }
}

pub(crate) fn image_submission(student_sub: &str) -> Submission {
    Submission {
        storage_key: Some(format!("submissions/{student_sub}/page.png")),
        mime_type: Some("image/png".to_string()),
        size_bytes: Some(2048),
        sha256: Some("a".repeat(64)),
        ..submission(SubmissionKind::Image, student_sub)
    }
}

pub(crate) fn job_payload(student_sub: &str, criteria: &[&str]) -> Value {
    json!({ "student_sub": student_sub, "criteria": criteria })
}

/// Vision adapter that replays a script, then succeeds with a fixed text.
#[derive(Default)]
pub(crate) struct ScriptedVision {
    script: StdMutex<VecDeque<Result<VisionResult, AdapterError>>>,
    calls: AtomicUsize,
}

impl ScriptedVision {
    pub(crate) fn new(script: Vec<Result<VisionResult, AdapterError>>) -> Self {
        Self { script: StdMutex::new(script.into()), calls: AtomicUsize::new(0) }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub(crate) fn vision_text(text_md: &str) -> VisionResult {
    VisionResult { text_md: text_md.to_string(), raw_metadata: json!({ "adapter": "scripted" }) }
}

#[async_trait]
impl VisionAdapter for ScriptedVision {
    async fn extract(
        &self,
        _submission: &Submission,
        _payload: &JobPayload,
    ) -> Result<VisionResult, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().expect("script lock").pop_front();
        next.unwrap_or_else(|| Ok(vision_text("## Extracted text")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedFeedback {
    pub(crate) text_md: String,
    pub(crate) criteria: Vec<String>,
    pub(crate) instruction_md: Option<String>,
    pub(crate) hints_md: Option<String>,
}

/// Feedback adapter that records every request and replays a script.
pub(crate) struct ScriptedFeedback {
    script: StdMutex<VecDeque<Result<FeedbackResult, AdapterError>>>,
    requests: StdMutex<Vec<RecordedFeedback>>,
    capabilities: FeedbackCapabilities,
    capability_queries: AtomicUsize,
}

impl ScriptedFeedback {
    pub(crate) fn new(script: Vec<Result<FeedbackResult, AdapterError>>) -> Self {
        Self::with_capabilities(script, FeedbackCapabilities::all())
    }

    pub(crate) fn with_capabilities(
        script: Vec<Result<FeedbackResult, AdapterError>>,
        capabilities: FeedbackCapabilities,
    ) -> Self {
        Self {
            script: StdMutex::new(script.into()),
            requests: StdMutex::new(Vec::new()),
            capabilities,
            capability_queries: AtomicUsize::new(0),
        }
    }

    pub(crate) fn requests(&self) -> Vec<RecordedFeedback> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub(crate) fn capability_queries(&self) -> usize {
        self.capability_queries.load(Ordering::SeqCst)
    }
}

pub(crate) fn feedback_ok() -> FeedbackResult {
    FeedbackResult {
        feedback_md: "**Feedback**\n\n- Strengths: clear.".to_string(),
        analysis_json: json!({
            "schema": "criteria.v2",
            "score": 3,
            "criteria_results": [
                { "criterion": "Clarity", "max_score": 10, "score": 6, "explanation_md": "ok" }
            ]
        }),
        parse_status: Some("model".to_string()),
    }
}

#[async_trait]
impl FeedbackAdapter for ScriptedFeedback {
    fn capabilities(&self) -> FeedbackCapabilities {
        self.capability_queries.fetch_add(1, Ordering::SeqCst);
        self.capabilities
    }

    async fn analyze(&self, request: FeedbackRequest<'_>) -> Result<FeedbackResult, AdapterError> {
        self.requests.lock().expect("requests lock").push(RecordedFeedback {
            text_md: request.text_md.to_string(),
            criteria: request.criteria.to_vec(),
            instruction_md: request.instruction_md.map(str::to_string),
            hints_md: request.hints_md.map(str::to_string),
        });
        let next = self.script.lock().expect("script lock").pop_front();
        next.unwrap_or_else(|| Ok(feedback_ok()))
    }
}
