use thiserror::Error;

/// Failures surfaced by a generation session.
///
/// Model and cache errors can only occur while a step is running; the
/// session moves to [`Phase::Terminal`](crate::Phase::Terminal) afterwards
/// and never resumes.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid generation configuration: {0}")]
    InvalidConfig(String),
    #[error("prompt must contain at least one token")]
    EmptyPrompt,
    #[error("model forward failed: {0}")]
    Model(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl GenerationError {
    pub(crate) fn model(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Model(Box::new(err))
    }
}
