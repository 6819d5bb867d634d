use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "learning_submission_kind", rename_all = "lowercase")]
pub(crate) enum SubmissionKind {
    Text,
    Image,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "learning_analysis_status", rename_all = "lowercase")]
pub(crate) enum AnalysisStatus {
    Pending,
    Extracted,
    Completed,
    Failed,
}

impl AnalysisStatus {
    /// Only these states may still be advanced by the worker.
    pub(crate) fn is_processable(self) -> bool {
        matches!(self, Self::Pending | Self::Extracted)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracted => "extracted",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "learning_job_status", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Queued,
    Leased,
    Failed,
}

/// Terminal failure codes accepted by `learning_worker_update_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum FailureCode {
    VisionFailed,
    FeedbackFailed,
    InputCorrupt,
    InputUnsupported,
    InputTooLarge,
}

impl FailureCode {
    pub(crate) const ALL: [FailureCode; 5] = [
        Self::VisionFailed,
        Self::FeedbackFailed,
        Self::InputCorrupt,
        Self::InputUnsupported,
        Self::InputTooLarge,
    ];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::VisionFailed => "vision_failed",
            Self::FeedbackFailed => "feedback_failed",
            Self::InputCorrupt => "input_corrupt",
            Self::InputUnsupported => "input_unsupported",
            Self::InputTooLarge => "input_too_large",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_str() == value)
    }

    /// The queue row only distinguishes which phase gave up.
    pub(crate) fn job_code(self) -> Self {
        match self {
            Self::FeedbackFailed => Self::FeedbackFailed,
            Self::VisionFailed | Self::InputCorrupt | Self::InputUnsupported | Self::InputTooLarge => {
                Self::VisionFailed
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RetryPhase {
    Vision,
    Feedback,
}

impl RetryPhase {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::Feedback => "feedback",
        }
    }

    /// Submission-level marker while a retry is pending.
    pub(crate) fn retrying_code(self) -> &'static str {
        match self {
            Self::Vision => "vision_retrying",
            Self::Feedback => "feedback_retrying",
        }
    }

    pub(crate) fn failure_code(self) -> FailureCode {
        match self {
            Self::Vision => FailureCode::VisionFailed,
            Self::Feedback => FailureCode::FeedbackFailed,
        }
    }
}
