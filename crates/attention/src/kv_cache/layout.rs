//! Geometry fixed by a cache's first update.
//!
//! Keys and values are `[batch, kv_heads, seq_len, head_dim]`; the value head
//! dimension may differ from the key head dimension.

use candle_core::{DType, Device, Tensor};

use crate::core::CacheError;

/// Batch, head and feature geometry shared by every update of one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    pub batch: usize,
    pub kv_heads: usize,
    pub key_dim: usize,
    pub value_dim: usize,
    pub dtype: DType,
}

impl CacheLayout {
    /// Derives the layout from a first update, returning it with the number of
    /// new tokens.
    pub fn observe(keys: &Tensor, values: &Tensor) -> Result<(Self, usize), CacheError> {
        let (batch, kv_heads, seq, key_dim) = dims4("keys", keys)?;
        let (vb, vh, vs, value_dim) = dims4("values", values)?;
        if (vb, vh, vs) != (batch, kv_heads, seq) {
            return Err(CacheError::shape(
                "values",
                &[batch, kv_heads, seq, value_dim],
                values.dims(),
            ));
        }
        if keys.dtype() != values.dtype() {
            return Err(CacheError::DTypeMismatch {
                expected: keys.dtype(),
                actual: values.dtype(),
            });
        }
        let layout = Self {
            batch,
            kv_heads,
            key_dim,
            value_dim,
            dtype: keys.dtype(),
        };
        Ok((layout, seq))
    }

    /// Checks a later update against this layout and returns its token count.
    pub fn admit(&self, keys: &Tensor, values: &Tensor) -> Result<usize, CacheError> {
        let (observed, seq) = Self::observe(keys, values)?;
        if (observed.batch, observed.kv_heads, observed.key_dim)
            != (self.batch, self.kv_heads, self.key_dim)
        {
            return Err(CacheError::shape(
                "keys",
                &[self.batch, self.kv_heads, seq, self.key_dim],
                keys.dims(),
            ));
        }
        if observed.value_dim != self.value_dim {
            return Err(CacheError::shape(
                "values",
                &[self.batch, self.kv_heads, seq, self.value_dim],
                values.dims(),
            ));
        }
        if observed.dtype != self.dtype {
            return Err(CacheError::DTypeMismatch {
                expected: self.dtype,
                actual: observed.dtype,
            });
        }
        Ok(seq)
    }

    pub(crate) fn zeros_like(
        &self,
        tokens: usize,
        feature: usize,
        dtype: DType,
        device: &Device,
    ) -> candle_core::Result<Tensor> {
        Tensor::zeros((self.batch, self.kv_heads, tokens, feature), dtype, device)
    }
}

/// Admits an update into a cache whose layout may not be fixed yet.
pub(crate) fn admit(
    layout: &mut Option<CacheLayout>,
    keys: &Tensor,
    values: &Tensor,
    kind: &str,
) -> Result<usize, CacheError> {
    match layout {
        Some(existing) => existing.admit(keys, values),
        None => {
            let (observed, seq) = CacheLayout::observe(keys, values)?;
            log::info!(
                "kv-cache init: kind={} batch={} kv_heads={} key_dim={} value_dim={} dtype={:?}",
                kind,
                observed.batch,
                observed.kv_heads,
                observed.key_dim,
                observed.value_dim,
                observed.dtype
            );
            *layout = Some(observed);
            Ok(seq)
        }
    }
}

fn dims4(context: &'static str, t: &Tensor) -> Result<(usize, usize, usize, usize), CacheError> {
    match *t.dims() {
        [b, h, s, d] => Ok((b, h, s, d)),
        _ => Err(CacheError::shape(context, &[0, 0, 0, 0], t.dims())),
    }
}
