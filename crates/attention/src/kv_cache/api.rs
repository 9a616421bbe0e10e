//! Public traits describing key/value cache behaviour.

use candle_core::{Device, Tensor};

use crate::{
    core::CacheError,
    masks::{windowed_causal_mask, MaskMode},
};

/// Per-layer memory of past keys and values for one generation session.
///
/// Implementations are owned by exactly one session and mutated once per
/// forward step; they carry no internal locking.
pub trait KeyValueCache: Send {
    /// What [`update`](Self::update) hands back to the attention kernel.
    type View;

    /// Logical tokens seen so far.
    fn offset(&self) -> usize;

    /// Appends `[batch, kv_heads, n, head_dim]` keys and values and returns
    /// everything the next attention call may read, in temporal order.
    fn update(&mut self, keys: &Tensor, values: &Tensor) -> Result<Self::View, CacheError>;

    /// Visibility for a query of `query_len` tokens about to be appended.
    fn make_mask(
        &self,
        query_len: usize,
        window: Option<usize>,
        force_array: bool,
        device: &Device,
    ) -> Result<MaskMode, CacheError>;

    fn is_trimmable(&self) -> bool;

    /// Drops up to `n` of the most recent tokens; returns how many were dropped.
    fn trim(&mut self, n: usize) -> usize;

    /// Forgets all tokens and the established layout.
    fn reset(&mut self);

    /// Bound on retained tokens, `None` when unbounded.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// Mask policy of caches that keep every token.
pub fn unbounded_mask(
    offset: usize,
    query_len: usize,
    window: Option<usize>,
    force_array: bool,
    device: &Device,
) -> Result<MaskMode, CacheError> {
    let binding = window.is_some_and(|w| offset + query_len > w);
    if force_array || binding {
        return Ok(windowed_causal_mask(device, query_len, offset, window)?);
    }
    if query_len <= 1 {
        Ok(MaskMode::None)
    } else {
        Ok(MaskMode::Causal)
    }
}

pub(crate) fn grow_steps(step: usize, tokens: usize) -> usize {
    tokens.div_ceil(step) * step
}
