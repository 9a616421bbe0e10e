//! Architecture configuration and a reference decoder.
//!
//! [`ArchitectureConfig`] reads the Hugging Face style `config.json` fields
//! that matter to the execution core and derives per-layer cache kinds,
//! the rotary encoder and the MoE shape from them. [`Model`] is a randomly
//! initialised decoder that wires those pieces together; it is what the
//! generation loop drives in tests and from the command line.

pub mod block;
pub mod config;
pub mod error;
pub mod model;

pub use block::{DecoderBlock, FeedForward};
pub use config::{ArchitectureConfig, LayerKind, QuantizationConfig, TokenIds};
pub use error::ModelError;
pub use model::Model;
