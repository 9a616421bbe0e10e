//! Building blocks for transformer layers.
//!
//! Dense projections, gated activations and MLPs, affine group quantization,
//! MXFP4 unpacking and the mixture-of-experts router and switch layers, all
//! assembled from Candle primitives.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod moe;
pub mod mxfp4;
pub mod norm;
pub mod quant;

use thiserror::Error;

/// Errors raised while assembling layers from configuration or weights.
///
/// Forward passes return `candle_core::Result` directly.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("missing weight `{0}`")]
    MissingWeight(String),
    #[error("invalid layer configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

pub use activations::{ActivationKind, GateActivation};
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit, LinearLayer};
pub use norm::RmsNorm;
pub use mlp::{FeedForwardConfig, FeedForwardLayer, GluMlp};
pub use moe::{ExpertAssignment, MoeConfig, SparseMoeBlock, SwitchGlu, TopKRouter};
pub use quant::{QuantConfig, QuantizedTensor};
