//! Rotary positional encodings and their context-extension variants.

pub mod error;
pub mod rope;
pub mod scaling;

pub use error::RopeError;
pub use rope::{RotaryConfig, RotaryEncoder};
pub use scaling::{FrequencyTable, RopeScalingConfig, RopeVariant};
