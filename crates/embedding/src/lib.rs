//! Embedding crate
//!
//! The positional module provides the rotary encoder used by every attention
//! layer, including the long-context frequency variants.

pub mod positional;

pub use positional::*;
