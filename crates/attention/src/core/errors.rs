//! Error types emitted by the cache engine.

use candle_core::DType;

/// Failures raised while constructing or updating a key/value cache.
///
/// Capacity is never an error: growable caches grow and rotating caches
/// evict.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Keys or values disagree with the layout fixed by the first update.
    #[error("cache shape mismatch for {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("cache dtype mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch { expected: DType, actual: DType },
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl CacheError {
    pub(crate) fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
