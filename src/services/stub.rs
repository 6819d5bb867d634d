use async_trait::async_trait;
use serde_json::{json, Value};

use crate::db::models::{JobPayload, Submission};
use crate::db::types::SubmissionKind;
use crate::services::ports::{
    AdapterError, FeedbackAdapter, FeedbackCapabilities, FeedbackRequest, FeedbackResult,
    VisionAdapter, VisionResult,
};

const CRITERION_MAX_SCORE: i64 = 10;

/// Deterministic vision for development and tests. It describes the upload, never its content.
#[derive(Debug, Clone, Default)]
pub(crate) struct StubVision;

#[async_trait]
impl VisionAdapter for StubVision {
    async fn extract(
        &self,
        submission: &Submission,
        _payload: &JobPayload,
    ) -> Result<VisionResult, AdapterError> {
        if submission.kind == SubmissionKind::Text {
            return Ok(VisionResult {
                text_md: submission.text_body.clone().unwrap_or_default(),
                raw_metadata: json!({ "adapter": "stub", "backend": "pass_through" }),
            });
        }

        let mime = submission.mime_type.as_deref().unwrap_or("application/octet-stream");
        let size = submission.size_bytes.unwrap_or(0);
        Ok(VisionResult {
            text_md: format!("# Extracted upload\n\n- mime: {mime}\n- bytes: {size}\n"),
            raw_metadata: json!({ "adapter": "stub", "backend": "stub", "mime_type": mime }),
        })
    }
}

/// Deterministic `criteria.v2` feedback; scores only depend on the text length.
#[derive(Debug, Clone, Default)]
pub(crate) struct StubFeedback;

#[async_trait]
impl FeedbackAdapter for StubFeedback {
    fn capabilities(&self) -> FeedbackCapabilities {
        FeedbackCapabilities::all()
    }

    async fn analyze(&self, request: FeedbackRequest<'_>) -> Result<FeedbackResult, AdapterError> {
        let length = i64::try_from(request.text_md.trim().chars().count()).unwrap_or(i64::MAX);
        let score = (length / 40).clamp(0, CRITERION_MAX_SCORE);

        let criteria_results: Vec<Value> = request
            .criteria
            .iter()
            .map(|criterion| {
                json!({
                    "criterion": criterion,
                    "max_score": CRITERION_MAX_SCORE,
                    "score": score,
                    "explanation_md": format!("Assessed against \"{criterion}\"."),
                })
            })
            .collect();

        let overall = if criteria_results.is_empty() { 0 } else { score / 2 };

        let mut feedback_md = String::from("**Feedback**\n\n");
        if score >= CRITERION_MAX_SCORE / 2 {
            feedback_md.push_str("- Strengths: the answer is developed in detail.\n");
        } else {
            feedback_md.push_str("- Strengths: a first answer is in place.\n");
        }
        feedback_md.push_str("- Next steps: expand the reasoning for each criterion.\n");
        if request.instruction_md.is_some() {
            feedback_md.push_str("- The task instructions were taken into account.\n");
        }
        if request.hints_md.is_some() {
            feedback_md.push_str("- Compare your answer with the solution hints.\n");
        }

        Ok(FeedbackResult {
            feedback_md,
            analysis_json: json!({
                "schema": "criteria.v2",
                "score": overall,
                "criteria_results": criteria_results,
            }),
            parse_status: Some("stub".to_string()),
        })
    }
}
