use serde_json::Value;

pub(crate) const COLUMNS: &str = "\
    id, course_id, task_id, student_sub, kind, text_body, storage_key, mime_type, \
    size_bytes, sha256, analysis_status";

/// Final analysis written in one statement so readers never see half a result.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompletedUpdate {
    pub(crate) text_md: String,
    pub(crate) feedback_md: String,
    pub(crate) analysis_json: Value,
}
