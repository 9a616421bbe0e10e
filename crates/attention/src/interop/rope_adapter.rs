//! Integration with the rotary encoder.
//!
//! Queries and keys are rotated at the positions they will occupy in the
//! cache, i.e. starting at the cache offset *before* the update.

use candle_core::{bail, Result, Tensor};
use embedding::positional::{RopeError, RotaryConfig, RotaryEncoder};

use crate::kv_cache::KeyValueCache;

/// Adapter that bridges attention blocks with the positional embedding crate.
#[derive(Debug, Clone)]
pub struct RopeAdapter {
    encoder: RotaryEncoder,
}

impl RopeAdapter {
    pub fn new(encoder: RotaryEncoder) -> Self {
        Self { encoder }
    }

    pub fn from_config(config: &RotaryConfig) -> std::result::Result<Self, RopeError> {
        RotaryEncoder::new(config).map(Self::new)
    }

    pub fn encoder(&self) -> &RotaryEncoder {
        &self.encoder
    }

    /// Rotates query/key tensors shaped `[batch, heads, seq_len, head_dim]`
    /// as positions starting at `pos_start`.
    pub fn apply(&self, q: &Tensor, k: &Tensor, pos_start: usize) -> Result<(Tensor, Tensor)> {
        if !q.device().same_device(k.device()) {
            bail!("q and k must reside on the same device");
        }
        let (_, _, q_len, _) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        if q_len != k_len {
            bail!("q and k must cover the same positions, got {q_len} and {k_len}");
        }
        Ok((self.encoder.apply(q, pos_start)?, self.encoder.apply(k, pos_start)?))
    }

    /// Rotates at the cache's current offset.
    pub fn apply_at<C: KeyValueCache + ?Sized>(&self, q: &Tensor, k: &Tensor, cache: &C) -> Result<(Tensor, Tensor)> {
        self.apply(q, k, cache.offset())
    }
}
