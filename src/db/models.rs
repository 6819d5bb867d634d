use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::types::{AnalysisStatus, SubmissionKind};

/// Submission columns the worker and its adapters are allowed to see.
#[derive(Debug, Clone, Serialize, FromRow)]
pub(crate) struct Submission {
    pub(crate) id: Uuid,
    pub(crate) course_id: Uuid,
    pub(crate) task_id: Uuid,
    pub(crate) student_sub: String,
    pub(crate) kind: SubmissionKind,
    pub(crate) text_body: Option<String>,
    pub(crate) storage_key: Option<String>,
    pub(crate) mime_type: Option<String>,
    pub(crate) size_bytes: Option<i64>,
    pub(crate) sha256: Option<String>,
    pub(crate) analysis_status: AnalysisStatus,
}

/// Snapshot of a leased queue row.
#[derive(Debug, Clone)]
pub(crate) struct QueuedJob {
    pub(crate) id: Uuid,
    pub(crate) submission_id: Uuid,
    pub(crate) retry_count: i32,
    pub(crate) payload: Value,
}

/// Typed view over the fields of a job payload the worker consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct JobPayload {
    pub(crate) student_sub: String,
    pub(crate) criteria: Vec<String>,
    pub(crate) instruction_md: Option<String>,
    pub(crate) hints_md: Option<String>,
    pub(crate) cached_text_md: Option<String>,
}

impl JobPayload {
    /// Lenient: unknown or mistyped fields are ignored rather than failing the job.
    pub(crate) fn from_value(payload: &Value) -> Self {
        let text = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .map(|value| value.to_string())
                .filter(|value| !value.trim().is_empty())
        };

        let criteria = payload
            .get("criteria")
            .and_then(Value::as_array)
            .map(|items| {
                items.iter().filter_map(Value::as_str).map(|item| item.to_string()).collect()
            })
            .unwrap_or_default();

        Self {
            student_sub: payload
                .get("student_sub")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            criteria,
            instruction_md: text("instruction_md"),
            hints_md: text("hints_md"),
            cached_text_md: payload
                .get("cached_text_md")
                .and_then(Value::as_str)
                .map(|value| value.to_string()),
        }
    }
}
