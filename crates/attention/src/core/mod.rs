//! Core types shared by the cache engine and the attention kernels.
//!
//! Tensors use the layout `[batch, n_heads, seq_len, head_dim]` throughout.

pub mod config;
pub mod errors;

use candle_core::{Result, Tensor};

pub use config::{CacheKind, Config, DEFAULT_STEP};
pub use errors::CacheError;

use crate::{kv_cache::CacheView, masks::MaskMode};

/// Scaled dot-product attention over the contents of a layer cache.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`.
/// * `kv` holds `[batch, n_kv_heads, k_len, head_dim]` keys and values;
///   `n_heads` must be a multiple of `n_kv_heads`.
/// * The returned tensor is `[batch, n_heads, q_len, v_head_dim]` in the dtype
///   of `q`. Softmax is computed in `f32`.
pub trait Attention {
    fn attend(&self, q: &Tensor, kv: &CacheView, mask: &MaskMode, config: &Config) -> Result<Tensor>;
}
