use thiserror::Error;

use crate::pipeline::transform::TransformError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{operation} failed")]
    AcquisitionFatal {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{operation} timed out")]
    AcquisitionTimeout { operation: &'static str },

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("failed to render {view}")]
    Render {
        view: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to present {label}")]
    Presentation {
        label: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("recording failed")]
    Recording(#[source] anyhow::Error),
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        PipelineError::Configuration(message.into())
    }

    #[cfg(test)]
    pub fn is_configuration(&self) -> bool {
        matches!(self, PipelineError::Configuration(_))
    }
}
