use thiserror::Error;

/// Failures raised while resolving a rotary configuration.
///
/// All of these surface at construction time; applying a built encoder never
/// produces one.
#[derive(Debug, Error)]
pub enum RopeError {
    /// A variant was selected without one of the keys it cannot default.
    #[error("rope variant `{variant}` requires `{key}` in rope_scaling")]
    MissingParameter { variant: String, key: &'static str },
    /// The `type`/`rope_type` string is not a known variant.
    #[error("unsupported rope variant `{0}`")]
    UnsupportedVariant(String),
    #[error("invalid rope configuration: {0}")]
    InvalidConfig(String),
}
