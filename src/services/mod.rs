pub(crate) mod ollama;
pub(crate) mod ports;
pub(crate) mod storage;
pub(crate) mod stub;

use std::sync::Arc;

use anyhow::Result;

use crate::core::config::{AiBackend, Settings};
use crate::services::ports::{FeedbackAdapter, VisionAdapter};

/// The adapter pair one worker instance is built with.
#[derive(Clone)]
pub(crate) struct Adapters {
    pub(crate) vision: Arc<dyn VisionAdapter>,
    pub(crate) feedback: Arc<dyn FeedbackAdapter>,
}

impl Adapters {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let adapters = match settings.ai().backend {
            AiBackend::Stub => Self {
                vision: Arc::new(stub::StubVision),
                feedback: Arc::new(stub::StubFeedback),
            },
            AiBackend::Local => Self {
                vision: Arc::new(ollama::LocalVision::from_settings(settings)?),
                feedback: Arc::new(ollama::LocalFeedback::from_settings(settings)?),
            },
        };

        tracing::info!(
            backend = settings.ai().backend.as_str(),
            vision_model = %settings.ai().vision_model,
            feedback_model = %settings.ai().feedback_model,
            "Learning adapters configured"
        );

        Ok(adapters)
    }
}
