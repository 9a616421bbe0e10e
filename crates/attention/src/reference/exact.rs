//! Reference scaled dot-product attention.
//!
//! The exact path prioritises numerical fidelity: inputs are promoted to
//! `f32`, grouped key/value heads are repeated to match the query heads, and
//! the result is cast back to the query dtype.

use std::sync::OnceLock;

use candle_core::{bail, DType, Result, Tensor};
use candle_nn::ops::softmax_last_dim;

use super::quantized::quantized_attention;
use crate::core::{Attention, Config};
use crate::kv_cache::CacheView;
use crate::masks::MaskMode;

/// Portable attention kernel over dense or quantized cache views.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ExactAttention {
    fn attend(&self, q: &Tensor, kv: &CacheView, mask: &MaskMode, config: &Config) -> Result<Tensor> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init q={:?} dtype={:?} quantized_kv={} scale={:?}",
                q.dims(),
                q.dtype(),
                kv.is_quantized(),
                config.scale
            );
        }
        match kv {
            CacheView::Dense { keys, values } => dense_attention(q, keys, values, mask, config),
            CacheView::Quantized(kv) => quantized_attention(q, kv, mask, config),
        }
    }
}

/// `softmax(q k^T * scale + mask) v` with grouped-query head sharing.
pub fn dense_attention(
    q: &Tensor,
    keys: &Tensor,
    values: &Tensor,
    mask: &MaskMode,
    config: &Config,
) -> Result<Tensor> {
    let (batch, heads, q_len, head_dim) = q.dims4()?;
    let (kb, kv_heads, k_len, kd) = keys.dims4()?;
    let (vb, vh, vk, _) = values.dims4()?;
    if kb != batch || kd != head_dim {
        bail!(
            "k shape mismatch: expected [{batch}, _, _, {head_dim}] got {:?}",
            keys.dims()
        );
    }
    if (vb, vh, vk) != (batch, kv_heads, k_len) {
        bail!(
            "v shape mismatch: expected [{batch}, {kv_heads}, {k_len}, _] got {:?}",
            values.dims()
        );
    }
    let repeats = group_size(heads, kv_heads)?;

    let dtype = q.dtype();
    let q = q.to_dtype(DType::F32)?;
    let k = repeat_kv(&keys.to_dtype(DType::F32)?, repeats)?;
    let v = repeat_kv(&values.to_dtype(DType::F32)?, repeats)?;

    let scale = config.scale_for(head_dim) as f64;
    let mut scores = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.0)?;
    if let Some(additive) = mask.to_additive(q_len, k_len, q.device())? {
        scores = scores.broadcast_add(&additive)?;
    }
    let probs = softmax_last_dim(&scores)?;
    probs.matmul(&v.contiguous()?)?.to_dtype(dtype)
}

pub(crate) fn group_size(heads: usize, kv_heads: usize) -> Result<usize> {
    if kv_heads == 0 || heads % kv_heads != 0 {
        bail!("query heads {heads} are not a multiple of key/value heads {kv_heads}");
    }
    Ok(heads / kv_heads)
}

/// Repeats each key/value head `repeats` times along the head axis.
pub fn repeat_kv(x: &Tensor, repeats: usize) -> Result<Tensor> {
    if repeats == 1 {
        return Ok(x.clone());
    }
    let (batch, kv_heads, seq, dim) = x.dims4()?;
    x.unsqueeze(2)?
        .broadcast_as((batch, kv_heads, repeats, seq, dim))?
        .reshape((batch, kv_heads * repeats, seq, dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::windowed_causal_mask;
    use candle_core::Device;

    fn build_inputs(device: &Device) -> Result<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    /// Loop-based attention with an optional `[q_len, k_len]` additive mask.
    fn naive_attention(q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, kv_heads, k_len, _) = k.dims4()?;
        let repeats = heads / kv_heads;
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        let q_vec = q.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.flatten_all()?.to_vec1::<f32>()?;
        let mask_vec = match mask {
            Some(m) => Some(m.flatten_all()?.to_vec1::<f32>()?),
            None => None,
        };
        let scale = 1.0 / (head_dim as f32).sqrt();

        for b in 0..batch {
            for h in 0..heads {
                let kh = h / repeats;
                for q_idx in 0..q_len {
                    let mut row = vec![0f32; k_len];
                    let mut max_val = f32::NEG_INFINITY;
                    for (k_idx, slot) in row.iter_mut().enumerate() {
                        let mut dot = 0f32;
                        for d in 0..head_dim {
                            let qi = ((b * heads + h) * q_len + q_idx) * head_dim + d;
                            let ki = ((b * kv_heads + kh) * k_len + k_idx) * head_dim + d;
                            dot += q_vec[qi] * k_vec[ki];
                        }
                        dot *= scale;
                        if let Some(mask_vec) = &mask_vec {
                            dot += mask_vec[q_idx * k_len + k_idx];
                        }
                        *slot = dot;
                        if dot.is_finite() && dot > max_val {
                            max_val = dot;
                        }
                    }
                    let mut denom = 0f32;
                    for val in row.iter_mut() {
                        if *val == f32::NEG_INFINITY {
                            *val = 0.0;
                        } else {
                            *val = (*val - max_val).exp();
                            denom += *val;
                        }
                    }
                    for d in 0..head_dim {
                        let mut acc = 0f32;
                        for (k_idx, weight) in row.iter().enumerate() {
                            let vi = ((b * kv_heads + kh) * k_len + k_idx) * head_dim + d;
                            acc += weight / denom * v_vec[vi];
                        }
                        output[((b * heads + h) * q_len + q_idx) * head_dim + d] = acc;
                    }
                }
            }
        }

        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_vec0::<f32>()
    }

    fn dense(k: &Tensor, v: &Tensor) -> CacheView {
        CacheView::Dense {
            keys: k.clone(),
            values: v.clone(),
        }
    }

    #[test]
    fn exact_attention_matches_naive() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let additive = MaskMode::Causal.to_additive(4, 4, &device)?;
        let output = ExactAttention::new().attend(&q, &dense(&k, &v), &MaskMode::Causal, &Config::default())?;
        let expected = naive_attention(&q, &k, &v, additive.as_ref())?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn grouped_heads_share_keys() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 4, 3, 8), &device)?;
        let k = Tensor::randn(0f32, 1.0, (1, 2, 5, 8), &device)?;
        let v = Tensor::randn(0f32, 1.0, (1, 2, 5, 8), &device)?;
        let mask = windowed_causal_mask(&device, 3, 2, Some(3))?;
        let output = ExactAttention::new().attend(&q, &dense(&k, &v), &mask, &Config::default())?;
        let additive = mask.to_additive(3, 5, &device)?;
        let expected = naive_attention(&q, &k, &v, additive.as_ref())?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 3, 4, 8), DType::F32, &device)?;
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device)?;
        let v = Tensor::zeros((1, 2, 5, 8), DType::F32, &device)?;
        assert!(dense_attention(&q, &k, &v, &MaskMode::None, &Config::default()).is_err());

        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let short_v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        assert!(dense_attention(&q, &k, &short_v, &MaskMode::None, &Config::default()).is_err());
        Ok(())
    }

    #[test]
    fn dtype_matrix() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let reference = dense_attention(&q, &k, &v, &MaskMode::Causal, &Config::default())?;
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let out = dense_attention(
                &q.to_dtype(dtype)?,
                &k.to_dtype(dtype)?,
                &v.to_dtype(dtype)?,
                &MaskMode::Causal,
                &Config::default(),
            )?;
            assert_eq!(out.dtype(), dtype);
            let diff = max_diff(&out, &reference)?;
            assert!(diff < 5e-2, "dtype {:?} diverged by {diff}", dtype);
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() -> Result<()> {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device)?;
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device)?;
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device)?;
        let out = dense_attention(&q, &k, &v, &MaskMode::None, &Config::default())?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(out.iter().all(|value| value.is_finite()));
        Ok(())
    }

    #[test]
    fn explicit_scale_overrides_default() -> Result<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let default = dense_attention(&q, &k, &v, &MaskMode::None, &Config::default())?;
        let same = dense_attention(&q, &k, &v, &MaskMode::None, &Config::with_scale(1.0 / 8f32.sqrt()))?;
        assert!(max_diff(&default, &same)? < 1e-6);
        Ok(())
    }
}
