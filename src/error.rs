//! Error taxonomy for the training orchestrator

/// Errors raised while setting up or running a fine-tuning job.
///
/// Only [`Error::Logging`] and [`Error::Metric`] are recoverable; every other
/// variant aborts the run before further writes happen.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or inconsistent run configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing pretrained component, dataset, or unreadable resource
    #[error("failed to load {what}: {reason}")]
    ResourceLoad { what: String, reason: String },

    /// Requested resume target does not exist
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Monitoring sink rejected a report
    #[error("monitoring sink error: {0}")]
    Logging(String),

    /// Evaluation metrics could not be computed
    #[error("metric computation failed: {0}")]
    Metric(String),

    /// Checkpoint content is unusable or could not be written
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A peer replica failed or the process group is unusable
    #[error("distributed worker error: {0}")]
    Distributed(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn resource(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ResourceLoad {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn distributed(message: impl Into<String>) -> Self {
        Self::Distributed(message.into())
    }

    /// Whether the error must abort the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Logging(_) | Error::Metric(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
