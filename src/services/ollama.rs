use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::core::config::Settings;
use crate::db::models::{JobPayload, Submission};
use crate::db::types::{FailureCode, SubmissionKind};
use crate::services::ports::{
    AdapterError, FeedbackAdapter, FeedbackCapabilities, FeedbackRequest, FeedbackResult,
    VisionAdapter, VisionResult,
};
use crate::services::storage::{LocalStorage, StorageFault};

const SUPPORTED_IMAGE_MIME: [&str; 2] = ["image/jpeg", "image/png"];
const PDF_MIME: &str = "application/pdf";
/// Pages rendered upstream beyond this count are not sent to the model.
const MAX_PDF_PAGES: usize = 5;
const CRITERION_MAX_SCORE: i64 = 10;

const VISION_PROMPT: &str = "Transcribe the exact visible text as Markdown.\n\
- Verbatim OCR: do not summarize or invent structure.\n\
- No placeholders, no fabrications, no disclaimers.\n\
- Preserve line breaks; omit decorative headers and footers.\n\
Return only the text you can read.";

const FEEDBACK_PROMPT: &str = "You give short formative feedback on a student answer.\n\
Answer with one JSON object and nothing else:\n\
{\"feedback_md\": \"<Markdown feedback for the student>\", \"score\": <0..5>, \
\"criteria_results\": [{\"criterion\": \"<name>\", \"max_score\": 10, \"score\": <0..10>, \
\"explanation_md\": \"<one or two sentences>\"}]}\n\
Evaluate every criterion exactly once, in the given order.";

/// Outcome of one `/api/generate` call, before it is attributed to a phase.
#[derive(Debug)]
enum CallFailure {
    Transient(String),
    Permanent(String),
}

#[derive(Debug, Clone)]
struct OllamaClient {
    client: Client,
    base_url: String,
}

impl OllamaClient {
    fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .context("Failed to build Ollama HTTP client")?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    async fn generate(&self, body: Value) -> Result<String, CallFailure> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self.client.post(&url).json(&body).send().await.map_err(|err| {
            if err.is_timeout() {
                CallFailure::Transient("ollama request timed out".to_string())
            } else if err.is_connect() {
                CallFailure::Transient("ollama unreachable".to_string())
            } else {
                CallFailure::Transient(format!("ollama request failed: {err}"))
            }
        })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CallFailure::Transient(format!("ollama returned {status}")));
        }
        if !status.is_success() {
            return Err(CallFailure::Permanent(format!("ollama returned {status}")));
        }

        let parsed: Value = response.json().await.map_err(|err| {
            if err.is_timeout() {
                CallFailure::Transient("ollama response timed out".to_string())
            } else {
                CallFailure::Permanent("ollama returned a non-JSON body".to_string())
            }
        })?;

        parsed
            .get("response")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| CallFailure::Permanent("ollama response field missing".to_string()))
    }
}

/// Models sometimes wrap their whole answer in a fenced block.
fn unwrap_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !(trimmed.starts_with("```") && trimmed.ends_with("```")) {
        return trimmed;
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() < 3 {
        return trimmed;
    }
    let start = trimmed.find('\n').map_or(0, |idx| idx + 1);
    let end = trimmed.rfind("```").unwrap_or(trimmed.len());
    trimmed.get(start..end).map_or(trimmed, str::trim)
}

#[derive(Debug, Clone)]
pub(crate) struct LocalVision {
    client: OllamaClient,
    storage: LocalStorage,
    model: String,
}

impl LocalVision {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let ai = settings.ai();
        Ok(Self {
            client: OllamaClient::new(
                &ai.ollama_base_url,
                Duration::from_secs(ai.timeout_vision_seconds),
            )?,
            storage: LocalStorage::from_settings(settings),
            model: ai.vision_model.clone(),
        })
    }

    fn check_declared_size(&self, submission: &Submission) -> Result<(), AdapterError> {
        let declared = submission.size_bytes.and_then(|size| u64::try_from(size).ok());
        if declared.is_some_and(|size| size > self.storage.max_bytes()) {
            return Err(AdapterError::input(FailureCode::InputTooLarge, "upload exceeds size limit"));
        }
        Ok(())
    }

    async fn load_image(&self, submission: &Submission) -> Result<Vec<u8>, AdapterError> {
        let storage_key = submission
            .storage_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| AdapterError::input(FailureCode::InputCorrupt, "storage key missing"))?;

        self.storage
            .read_verified(storage_key, submission.size_bytes, submission.sha256.as_deref())
            .await
            .map_err(|fault| storage_failure(fault, "image_unavailable"))
    }

    /// Page images an upstream step rendered from the PDF; the PDF itself is never parsed here.
    async fn load_pdf_pages(&self, submission: &Submission) -> Result<Vec<Vec<u8>>, AdapterError> {
        let mut pages = Vec::new();
        for key in pdf_page_keys(submission) {
            match self.storage.read_verified(&key, None, None).await {
                Ok(bytes) if !bytes.is_empty() => pages.push(bytes),
                Ok(_) | Err(StorageFault::Missing) => {}
                Err(fault) => return Err(storage_failure(fault, "pdf_images_unavailable")),
            }
        }

        if pages.is_empty() {
            return Err(AdapterError::VisionTransient("pdf_images_unavailable".into()));
        }
        Ok(pages)
    }
}

fn storage_failure(fault: StorageFault, missing: &str) -> AdapterError {
    match fault {
        StorageFault::Missing => AdapterError::VisionTransient(missing.to_string()),
        StorageFault::TooLarge { .. } => {
            AdapterError::input(FailureCode::InputTooLarge, fault.to_string())
        }
        StorageFault::PathEscape | StorageFault::SizeMismatch | StorageFault::HashMismatch => {
            AdapterError::input(FailureCode::InputCorrupt, fault.to_string())
        }
        StorageFault::Read(_) => AdapterError::vision_permanent("read_error"),
    }
}

/// `<course>/<task>/<student>/derived/<submission>/page_0001.png` and onward.
fn pdf_page_keys(submission: &Submission) -> Vec<String> {
    (1..=MAX_PDF_PAGES)
        .map(|page| {
            format!(
                "{}/{}/{}/derived/{}/page_{page:04}.png",
                submission.course_id, submission.task_id, submission.student_sub, submission.id
            )
        })
        .collect()
}

#[async_trait]
impl VisionAdapter for LocalVision {
    async fn extract(
        &self,
        submission: &Submission,
        _payload: &JobPayload,
    ) -> Result<VisionResult, AdapterError> {
        if submission.kind == SubmissionKind::Text {
            return Ok(VisionResult {
                text_md: submission.text_body.clone().unwrap_or_default(),
                raw_metadata: json!({ "adapter": "local", "backend": "pass_through" }),
            });
        }

        let mime = submission.mime_type.as_deref().unwrap_or_default();
        let images = if SUPPORTED_IMAGE_MIME.contains(&mime) {
            self.check_declared_size(submission)?;
            vec![self.load_image(submission).await?]
        } else if mime == PDF_MIME {
            self.check_declared_size(submission)?;
            self.load_pdf_pages(submission).await?
        } else {
            return Err(AdapterError::input(
                FailureCode::InputUnsupported,
                format!("unsupported mime: {mime}"),
            ));
        };

        let bytes_read: usize = images.iter().map(Vec::len).sum();
        let encoded: Vec<String> = images
            .iter()
            .map(|image| base64::engine::general_purpose::STANDARD.encode(image))
            .collect();
        let timer = Instant::now();
        let body = json!({
            "model": self.model,
            "prompt": VISION_PROMPT,
            "images": encoded,
            "stream": false,
            "options": { "temperature": 0 },
        });

        let text = self.client.generate(body).await.map_err(|failure| match failure {
            CallFailure::Transient(message) => AdapterError::VisionTransient(message),
            CallFailure::Permanent(message) => AdapterError::vision_permanent(message),
        })?;

        let text = unwrap_fence(&text);
        if text.is_empty() {
            return Err(AdapterError::VisionTransient("empty response from local vision".into()));
        }

        tracing::debug!(
            submission_id = %submission.id,
            bytes_read,
            pages = images.len(),
            duration_seconds = timer.elapsed().as_secs_f64(),
            "Local vision completed"
        );

        Ok(VisionResult {
            text_md: text.to_string(),
            raw_metadata: json!({
                "adapter": "local",
                "backend": "ollama",
                "model": self.model,
                "bytes_read": bytes_read,
                "pages": images.len(),
            }),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LocalFeedback {
    client: OllamaClient,
    model: String,
}

impl LocalFeedback {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let ai = settings.ai();
        Ok(Self {
            client: OllamaClient::new(
                &ai.ollama_base_url,
                Duration::from_secs(ai.timeout_feedback_seconds),
            )?,
            model: ai.feedback_model.clone(),
        })
    }
}

#[async_trait]
impl FeedbackAdapter for LocalFeedback {
    fn capabilities(&self) -> FeedbackCapabilities {
        FeedbackCapabilities::all()
    }

    async fn analyze(&self, request: FeedbackRequest<'_>) -> Result<FeedbackResult, AdapterError> {
        let body = json!({
            "model": self.model,
            "system": FEEDBACK_PROMPT,
            "prompt": feedback_prompt(&request),
            "format": "json",
            "stream": false,
            "options": { "temperature": 0 },
        });

        let raw = self.client.generate(body).await.map_err(|failure| match failure {
            CallFailure::Transient(message) => AdapterError::FeedbackTransient(message),
            CallFailure::Permanent(message) => AdapterError::FeedbackPermanent(message),
        })?;

        if raw.is_empty() {
            return Err(AdapterError::FeedbackTransient("empty response from local feedback".into()));
        }

        let result = parse_feedback(&raw, request.criteria);
        tracing::info!(
            criteria_count = request.criteria.len(),
            parse_status = result.parse_status.as_deref().unwrap_or("unknown"),
            "Local feedback completed"
        );
        Ok(result)
    }
}

fn feedback_prompt(request: &FeedbackRequest<'_>) -> String {
    let mut prompt = String::from("Criteria:\n");
    for criterion in request.criteria {
        prompt.push_str("- ");
        prompt.push_str(criterion);
        prompt.push('\n');
    }
    if let Some(instruction) = request.instruction_md {
        prompt.push_str("\nTask instructions:\n");
        prompt.push_str(instruction);
        prompt.push('\n');
    }
    if let Some(hints) = request.hints_md {
        prompt.push_str("\nSolution hints (do not reveal verbatim):\n");
        prompt.push_str(hints);
        prompt.push('\n');
    }
    prompt.push_str("\nStudent answer:\n");
    prompt.push_str(request.text_md);
    prompt
}

/// Turns model output into a `criteria.v2` result; prose answers degrade to zero scores.
fn parse_feedback(raw: &str, criteria: &[String]) -> FeedbackResult {
    let parsed = serde_json::from_str::<Value>(unwrap_fence(raw)).ok();
    let feedback_md = parsed
        .as_ref()
        .and_then(|value| value.get("feedback_md"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty());

    let Some(feedback_md) = feedback_md else {
        return FeedbackResult {
            feedback_md: raw.trim().to_string(),
            analysis_json: empty_analysis(criteria),
            parse_status: Some("parse_error".to_string()),
        };
    };

    let reported = parsed
        .as_ref()
        .and_then(|value| value.get("criteria_results"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let criteria_results: Vec<Value> = criteria
        .iter()
        .map(|criterion| {
            let item = reported.iter().find(|item| {
                item.get("criterion").and_then(Value::as_str) == Some(criterion.as_str())
            });
            let score = item
                .and_then(|item| item.get("score"))
                .and_then(Value::as_i64)
                .unwrap_or(0)
                .clamp(0, CRITERION_MAX_SCORE);
            let explanation = item
                .and_then(|item| item.get("explanation_md"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            json!({
                "criterion": criterion,
                "max_score": CRITERION_MAX_SCORE,
                "score": score,
                "explanation_md": explanation,
            })
        })
        .collect();

    let score = parsed
        .as_ref()
        .and_then(|value| value.get("score"))
        .and_then(Value::as_i64)
        .unwrap_or(0)
        .clamp(0, 5);

    FeedbackResult {
        feedback_md: feedback_md.to_string(),
        analysis_json: json!({
            "schema": "criteria.v2",
            "score": score,
            "criteria_results": criteria_results,
        }),
        parse_status: Some("model".to_string()),
    }
}

fn empty_analysis(criteria: &[String]) -> Value {
    let criteria_results: Vec<Value> = criteria
        .iter()
        .map(|criterion| {
            json!({
                "criterion": criterion,
                "max_score": CRITERION_MAX_SCORE,
                "score": 0,
                "explanation_md": "",
            })
        })
        .collect();
    json!({ "schema": "criteria.v2", "score": 0, "criteria_results": criteria_results })
}
