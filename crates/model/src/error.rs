use attention::CacheError;
use embedding::RopeError;
use layers::LayerError;
use thiserror::Error;

/// Failures while loading an architecture or running the reference model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to parse architecture config: {0}")]
    Format(#[from] serde_json::Error),
    #[error("invalid architecture config: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error(transparent)]
    Rope(#[from] RopeError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}
