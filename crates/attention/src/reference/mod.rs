//! Portable, exact implementations of scaled dot-product attention.
//!
//! These paths favour clarity over absolute performance.

pub mod exact;
pub mod quantized;

pub use exact::{dense_attention, repeat_kv, ExactAttention};
pub use quantized::quantized_attention;
