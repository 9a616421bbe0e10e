//! Attention visibility derived from cache state.
//!
//! Caches describe visibility as a [`MaskMode`]. Kernels turn it into an
//! additive `f32` tensor shaped `[q_len, k_len]` whose entries are `0.0` where
//! attention is permitted and `f32::NEG_INFINITY` otherwise.

pub mod causal;
pub mod window;

use candle_core::{bail, DType, Device, Result, Tensor};

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::{build_causal_mask, causal_visibility};
pub use window::{recent_window_visibility, windowed_causal_mask};

/// Visibility pattern for one attention call.
#[derive(Debug, Clone)]
pub enum MaskMode {
    /// Every key is visible.
    None,
    /// Query `i` sees key `j` iff `j <= i + (k_len - q_len)`.
    Causal,
    /// Explicit `u8` `[q_len, k_len]` pattern; `1` marks a visible key.
    Array(Tensor),
}

impl MaskMode {
    pub fn is_none(&self) -> bool {
        matches!(self, MaskMode::None)
    }

    pub fn is_causal(&self) -> bool {
        matches!(self, MaskMode::Causal)
    }

    pub fn as_array(&self) -> Option<&Tensor> {
        match self {
            MaskMode::Array(mask) => Some(mask),
            _ => None,
        }
    }

    /// Materialises the additive mask, `None` when every key is visible.
    pub fn to_additive(&self, q_len: usize, k_len: usize, device: &Device) -> Result<Option<Tensor>> {
        match self {
            MaskMode::None => Ok(None),
            MaskMode::Causal => build_causal_mask(device, q_len, k_len).map(Some),
            MaskMode::Array(visible) => {
                if visible.dims() != [q_len, k_len] {
                    bail!(
                        "mask array {:?} does not match scores [{q_len}, {k_len}]",
                        visible.dims()
                    );
                }
                let keep = Tensor::zeros((q_len, k_len), MASK_DTYPE, device)?;
                let drop = Tensor::full(f32::NEG_INFINITY, (q_len, k_len), device)?;
                visible.to_device(device)?.where_cond(&keep, &drop).map(Some)
            }
        }
    }
}
