//! Autoregressive generation on top of the cache engine.
//!
//! A [`GenerationSession`] owns one cache per layer and drives a
//! [`LanguageModel`] through a batched prompt step followed by one decode
//! step per token, sampling each token with a [`Sampler`].

pub mod config;
pub mod error;
pub mod generator;
pub mod report;
pub mod sampler;

pub use config::GenerationConfig;
pub use error::GenerationError;
pub use generator::{generate, GenerationOutput, GenerationSession, LanguageModel, Phase};
pub use report::{GenerationReport, StopReason};
pub use sampler::Sampler;
