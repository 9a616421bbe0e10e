//! Builders for causal attention masks.

use candle_core::{Device, Result, Tensor};

/// Construct an additive causal mask shaped `[q_len, k_len]`.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn build_causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let mut data = vec![0f32; q_len * k_len];
    for q in 0..q_len {
        let row = &mut data[q * k_len..(q + 1) * k_len];
        for value in row.iter_mut().skip(q + offset + 1) {
            *value = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(data, (q_len, k_len), device)
}

/// Visibility of `q_len` queries starting at position `offset` over
/// `offset + q_len` keys: query `i` sees key `j` iff `j <= i + offset` and,
/// with a window, `i + offset - j < window`.
pub fn causal_visibility(q_len: usize, offset: usize, window: Option<usize>) -> Vec<u8> {
    let k_len = offset + q_len;
    let mut visible = vec![0u8; q_len * k_len];
    for i in 0..q_len {
        let pos = i + offset;
        let start = window.map_or(0, |w| (pos + 1).saturating_sub(w));
        for slot in &mut visible[i * k_len + start..=i * k_len + pos] {
            *slot = 1;
        }
    }
    visible
}
