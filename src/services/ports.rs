use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::db::models::{JobPayload, Submission};
use crate::db::types::{FailureCode, RetryPhase};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VisionResult {
    pub(crate) text_md: String,
    pub(crate) raw_metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FeedbackRequest<'a> {
    pub(crate) text_md: &'a str,
    pub(crate) criteria: &'a [String],
    pub(crate) instruction_md: Option<&'a str>,
    pub(crate) hints_md: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FeedbackResult {
    pub(crate) feedback_md: String,
    /// Stored verbatim; expected to follow the `criteria.v2` shape.
    pub(crate) analysis_json: Value,
    pub(crate) parse_status: Option<String>,
}

/// Optional inputs a feedback adapter understands beyond text and criteria.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FeedbackCapabilities {
    pub(crate) instruction_md: bool,
    pub(crate) hints_md: bool,
}

impl FeedbackCapabilities {
    pub(crate) fn all() -> Self {
        Self { instruction_md: true, hints_md: true }
    }
}

#[derive(Debug, Error)]
pub(crate) enum AdapterError {
    #[error("{0}")]
    VisionTransient(String),
    #[error("{message}")]
    VisionPermanent { message: String, input: Option<FailureCode> },
    #[error("{0}")]
    FeedbackTransient(String),
    #[error("{0}")]
    FeedbackPermanent(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl AdapterError {
    pub(crate) fn vision_permanent(message: impl Into<String>) -> Self {
        Self::VisionPermanent { message: message.into(), input: None }
    }

    /// Permanent vision failure caused by the uploaded bytes themselves.
    pub(crate) fn input(code: FailureCode, message: impl Into<String>) -> Self {
        Self::VisionPermanent { message: message.into(), input: Some(code) }
    }

    /// `None` for errors no adapter is allowed to raise.
    pub(crate) fn phase(&self) -> Option<RetryPhase> {
        match self {
            Self::VisionTransient(_) | Self::VisionPermanent { .. } => Some(RetryPhase::Vision),
            Self::FeedbackTransient(_) | Self::FeedbackPermanent(_) => Some(RetryPhase::Feedback),
            Self::Unexpected(_) => None,
        }
    }

    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Self::VisionTransient(_) | Self::FeedbackTransient(_))
    }

    /// Code recorded on the submission when this error ends processing.
    pub(crate) fn failure_code(&self) -> FailureCode {
        match self {
            Self::VisionPermanent { input: Some(code), .. }
                if code.job_code() == FailureCode::VisionFailed =>
            {
                *code
            }
            Self::FeedbackTransient(_) | Self::FeedbackPermanent(_) => FailureCode::FeedbackFailed,
            _ => FailureCode::VisionFailed,
        }
    }
}

#[async_trait]
pub(crate) trait VisionAdapter: Send + Sync {
    async fn extract(
        &self,
        submission: &Submission,
        payload: &JobPayload,
    ) -> Result<VisionResult, AdapterError>;
}

#[async_trait]
pub(crate) trait FeedbackAdapter: Send + Sync {
    fn capabilities(&self) -> FeedbackCapabilities {
        FeedbackCapabilities::default()
    }

    async fn analyze(&self, request: FeedbackRequest<'_>) -> Result<FeedbackResult, AdapterError>;
}
