//! Unbounded cache for global-attention layers.

use std::{cell::Cell, marker::PhantomData};

use candle_core::{Device, Tensor};

use super::{
    api::{grow_steps, unbounded_mask, KeyValueCache},
    layout::{admit, CacheLayout},
};
use crate::{
    core::{CacheError, DEFAULT_STEP},
    masks::MaskMode,
};

/// Keys and values stored contiguously, growing `step` tokens at a time.
///
/// Views returned by [`update`](KeyValueCache::update) share the buffer and
/// stay valid until the next update.
#[derive(Debug)]
pub struct GrowableKvCache {
    keys: Option<Tensor>,
    values: Option<Tensor>,
    layout: Option<CacheLayout>,
    offset: usize,
    step: usize,
    _not_sync: PhantomData<Cell<()>>,
}

impl GrowableKvCache {
    pub fn new() -> Self {
        Self::with_step(DEFAULT_STEP)
    }

    pub fn with_step(step: usize) -> Self {
        Self {
            keys: None,
            values: None,
            layout: None,
            offset: 0,
            step: step.max(1),
            _not_sync: PhantomData,
        }
    }

    pub fn layout(&self) -> Option<&CacheLayout> {
        self.layout.as_ref()
    }

    /// Token slots currently allocated.
    pub fn allocated(&self) -> usize {
        self.keys.as_ref().map_or(0, |k| k.dims()[2])
    }

    /// The valid prefix of the buffers.
    pub fn state(&self) -> Result<Option<(Tensor, Tensor)>, CacheError> {
        match (&self.keys, &self.values) {
            (Some(k), Some(v)) => Ok(Some((
                k.narrow(2, 0, self.offset)?,
                v.narrow(2, 0, self.offset)?,
            ))),
            _ => Ok(None),
        }
    }

    fn reserve(&mut self, layout: &CacheLayout, tokens: usize, device: &Device) -> candle_core::Result<()> {
        let prev = self.offset;
        if self.keys.is_some() && prev + tokens <= self.allocated() {
            return Ok(());
        }
        let extra = grow_steps(self.step, tokens);
        let new_k = layout.zeros_like(extra, layout.key_dim, layout.dtype, device)?;
        let new_v = layout.zeros_like(extra, layout.value_dim, layout.dtype, device)?;
        let (keys, values) = match (self.keys.take(), self.values.take()) {
            (Some(k), Some(v)) => (
                Tensor::cat(&[&k.narrow(2, 0, prev)?, &new_k], 2)?,
                Tensor::cat(&[&v.narrow(2, 0, prev)?, &new_v], 2)?,
            ),
            _ => (new_k, new_v),
        };
        log::debug!(
            "kv-cache grow: kind=growable offset={} allocated={}",
            prev,
            keys.dims()[2]
        );
        self.keys = Some(keys);
        self.values = Some(values);
        Ok(())
    }
}

impl Default for GrowableKvCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueCache for GrowableKvCache {
    type View = (Tensor, Tensor);

    fn offset(&self) -> usize {
        self.offset
    }

    fn update(&mut self, keys: &Tensor, values: &Tensor) -> Result<Self::View, CacheError> {
        let n = admit(&mut self.layout, keys, values, "growable")?;
        let layout = self.layout.clone().ok_or_else(|| {
            CacheError::InvalidConfig("cache layout missing after admission".to_string())
        })?;
        self.reserve(&layout, n, keys.device())?;

        let prev = self.offset;
        match (&self.keys, &self.values) {
            (Some(k), Some(v)) => {
                if n > 0 {
                    k.slice_set(&keys.contiguous()?, 2, prev)?;
                    v.slice_set(&values.contiguous()?, 2, prev)?;
                }
                self.offset += n;
                Ok((k.narrow(2, 0, self.offset)?, v.narrow(2, 0, self.offset)?))
            }
            _ => Err(CacheError::InvalidConfig(
                "cache buffers missing after reservation".to_string(),
            )),
        }
    }

    fn make_mask(
        &self,
        query_len: usize,
        window: Option<usize>,
        force_array: bool,
        device: &Device,
    ) -> Result<MaskMode, CacheError> {
        unbounded_mask(self.offset, query_len, window, force_array, device)
    }

    fn is_trimmable(&self) -> bool {
        true
    }

    fn trim(&mut self, n: usize) -> usize {
        let n = n.min(self.offset);
        self.offset -= n;
        n
    }

    fn reset(&mut self) {
        self.keys = None;
        self.values = None;
        self.layout = None;
        self.offset = 0;
    }
}
