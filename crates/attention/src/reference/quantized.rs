//! Attention read directly from a quantized cache.
//!
//! Scores and outputs are computed against packed codes through
//! [`layers::quant::quantized_matmul`]; keys and values are never
//! dequantized as a whole.

use candle_core::{bail, DType, Result, Tensor};
use candle_nn::ops::softmax_last_dim;
use layers::quant::quantized_matmul;

use super::exact::group_size;
use crate::core::Config;
use crate::kv_cache::QuantizedKv;
use crate::masks::MaskMode;

/// `softmax(q k^T * scale + mask) v` over quantized keys and values.
///
/// Query heads are folded into their key/value group so each group's codes
/// are read once: `q` `[B, H, L, D]` becomes `[B, H_kv, (H / H_kv) * L, D]`.
pub fn quantized_attention(q: &Tensor, kv: &QuantizedKv, mask: &MaskMode, config: &Config) -> Result<Tensor> {
    let (batch, heads, q_len, head_dim) = q.dims4()?;
    let k_dims = kv.keys.dims();
    let v_dims = kv.values.dims();
    let (&[kb, kv_heads, k_len, kd], &[vb, vh, vk, value_dim]) = (k_dims.as_slice(), v_dims.as_slice()) else {
        bail!("quantized cache views must be rank 4, got {:?} / {:?}", k_dims, v_dims);
    };
    if kb != batch || kd != head_dim || (vb, vh, vk) != (batch, kv_heads, k_len) {
        bail!(
            "quantized kv {:?} / {:?} do not match queries {:?}",
            k_dims,
            v_dims,
            q.dims()
        );
    }
    let repeats = group_size(heads, kv_heads)?;

    let dtype = q.dtype();
    let scale = config.scale_for(head_dim) as f64;
    let q = q
        .to_dtype(DType::F32)?
        .affine(scale, 0.0)?
        .reshape((batch, kv_heads, repeats * q_len, head_dim))?;

    let scores = quantized_matmul(&q, &kv.keys, true)?;
    let scores = match mask.to_additive(q_len, k_len, q.device())? {
        Some(additive) => scores
            .reshape((batch, kv_heads, repeats, q_len, k_len))?
            .broadcast_add(&additive)?
            .reshape((batch, kv_heads, repeats * q_len, k_len))?,
        None => scores,
    };
    let probs = softmax_last_dim(&scores)?;
    quantized_matmul(&probs, &kv.values, false)?
        .reshape((batch, heads, q_len, value_dim))?
        .to_dtype(dtype)
}
