//! Sliding-window visibility.

use candle_core::{Device, Result, Tensor};

use super::{causal::causal_visibility, MaskMode};

/// Explicit mask for `q_len` queries at `offset` restricted to the last
/// `window` positions.
pub fn windowed_causal_mask(
    device: &Device,
    q_len: usize,
    offset: usize,
    window: Option<usize>,
) -> Result<MaskMode> {
    let k_len = offset + q_len;
    let visible = causal_visibility(q_len, offset, window);
    Ok(MaskMode::Array(Tensor::from_vec(visible, (q_len, k_len), device)?))
}

/// Single-query visibility over a physically ordered buffer.
///
/// `ranks[p]` is the temporal rank of slot `p` (0 for the oldest retained
/// token). Only the newest `window` tokens stay visible.
pub fn recent_window_visibility(ranks: &[usize], window: usize) -> Vec<u8> {
    let newest = ranks.len();
    ranks
        .iter()
        .map(|&rank| u8::from(rank + window >= newest))
        .collect()
}
