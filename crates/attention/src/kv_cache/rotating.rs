//! Sliding-window cache with an attention sink.
//!
//! Single-token decode writes in place at the ring index. Multi-token
//! prefill first restores temporal order, drops the oldest evictable tokens
//! so `max_size - 1` remain, then concatenates the new block. The buffer may
//! therefore hold up to `max_size + n - 1` tokens until the next decode step
//! trims it back to `max_size`.

use std::{cell::Cell, marker::PhantomData};

use candle_core::{Device, Tensor};

use super::{
    api::KeyValueCache,
    layout::{admit, CacheLayout},
    ring::RingIndex,
};
use crate::{
    core::{CacheError, CacheKind, DEFAULT_STEP},
    masks::{recent_window_visibility, windowed_causal_mask, MaskMode},
};

#[derive(Debug)]
pub struct RotatingKvCache {
    keys: Option<Tensor>,
    values: Option<Tensor>,
    layout: Option<CacheLayout>,
    ring: RingIndex,
    max_size: usize,
    step: usize,
    _not_sync: PhantomData<Cell<()>>,
}

impl RotatingKvCache {
    pub fn new(max_size: usize, keep: usize) -> Result<Self, CacheError> {
        CacheKind::Rotating { max_size, keep }.validate()?;
        Ok(Self {
            keys: None,
            values: None,
            layout: None,
            ring: RingIndex::new(keep),
            max_size,
            step: DEFAULT_STEP,
            _not_sync: PhantomData,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn keep(&self) -> usize {
        self.ring.keep()
    }

    pub fn ring(&self) -> RingIndex {
        self.ring
    }

    /// Physical slots currently held.
    pub fn buffer_len(&self) -> usize {
        self.keys.as_ref().map_or(0, |k| k.dims()[2])
    }

    /// Retained keys and values in temporal order: the sink, then the tail
    /// from the ring index, then the head before it.
    pub fn state(&self) -> Result<Option<(Tensor, Tensor)>, CacheError> {
        let (Some(k), Some(v)) = (&self.keys, &self.values) else {
            return Ok(None);
        };
        let keys = self.temporal(k)?;
        let values = self.temporal(v)?;
        let len = keys.dims()[2].min(self.ring.offset());
        Ok(Some((keys.narrow(2, 0, len)?, values.narrow(2, 0, len)?)))
    }

    fn temporal(&self, buffer: &Tensor) -> candle_core::Result<Tensor> {
        let len = buffer.dims()[2];
        let ranges = self.ring.linearize(len);
        if ranges.len() == 1 && ranges[0] == (0..len) {
            return Ok(buffer.clone());
        }
        let parts = ranges
            .into_iter()
            .map(|r| buffer.narrow(2, r.start, r.len()))
            .collect::<candle_core::Result<Vec<_>>>()?;
        if parts.is_empty() {
            return buffer.narrow(2, 0, 0);
        }
        Tensor::cat(&parts, 2)
    }

    /// Drops `trim` tokens after the sink and optionally appends a block.
    fn evict(&self, trim: usize, buffer: &Tensor, append: Option<&Tensor>) -> candle_core::Result<Tensor> {
        let len = buffer.dims()[2];
        let keep = self.ring.keep();
        let mut parts = Vec::with_capacity(3);
        if trim > 0 {
            if keep > 0 {
                parts.push(buffer.narrow(2, 0, keep)?);
            }
            parts.push(buffer.narrow(2, keep + trim, len - keep - trim)?);
        } else {
            parts.push(buffer.clone());
        }
        if let Some(block) = append {
            parts.push(block.clone());
        }
        Tensor::cat(&parts, 2)
    }

    fn update_in_place(
        &mut self,
        layout: &CacheLayout,
        keys: &Tensor,
        values: &Tensor,
        n: usize,
    ) -> Result<(Tensor, Tensor), CacheError> {
        let prev = self.ring.offset();
        let len = self.buffer_len();
        if self.keys.is_none() || (prev >= len && len < self.max_size) {
            let extra = self.step.min(self.max_size.saturating_sub(prev)).max(n);
            let device = keys.device();
            let new_k = layout.zeros_like(extra, layout.key_dim, layout.dtype, device)?;
            let new_v = layout.zeros_like(extra, layout.value_dim, layout.dtype, device)?;
            let (k, v) = match (self.keys.take(), self.values.take()) {
                (Some(k), Some(v)) => (Tensor::cat(&[&k, &new_k], 2)?, Tensor::cat(&[&v, &new_v], 2)?),
                _ => (new_k, new_v),
            };
            self.keys = Some(k);
            self.values = Some(v);
            self.ring.seek(prev);
        }

        let len = self.buffer_len();
        if len > self.max_size {
            let trim = len - self.max_size;
            if let (Some(k), Some(v)) = (self.keys.take(), self.values.take()) {
                self.keys = Some(self.evict(trim, &k, None)?);
                self.values = Some(self.evict(trim, &v, None)?);
            }
            self.ring.seek(self.max_size);
        }
        self.ring.wrap(self.max_size);

        let (Some(k), Some(v)) = (&self.keys, &self.values) else {
            return Err(CacheError::InvalidConfig(
                "rotating buffers missing after reservation".to_string(),
            ));
        };
        k.slice_set(&keys.contiguous()?, 2, self.ring.idx())?;
        v.slice_set(&values.contiguous()?, 2, self.ring.idx())?;
        self.ring.advance(n);

        let offset = self.ring.offset();
        if offset < self.max_size {
            return Ok((k.narrow(2, 0, offset)?, v.narrow(2, 0, offset)?));
        }
        Ok((k.clone(), v.clone()))
    }

    fn update_concat(&mut self, keys: &Tensor, values: &Tensor, n: usize) -> Result<(Tensor, Tensor), CacheError> {
        let (k, v) = match (self.keys.take(), self.values.take()) {
            (Some(k), Some(v)) => {
                let k = self.temporal(&k)?;
                let v = self.temporal(&v)?;
                let len = k.dims()[2];
                self.ring.seek(len);
                let trim = (len + 1).saturating_sub(self.max_size);
                (self.evict(trim, &k, Some(keys))?, self.evict(trim, &v, Some(values))?)
            }
            _ => (keys.copy()?, values.copy()?),
        };
        self.ring.extend(n);
        self.ring.seek(k.dims()[2]);
        log::debug!(
            "kv-cache prefill: kind=rotating offset={} held={}",
            self.ring.offset(),
            k.dims()[2]
        );
        self.keys = Some(k.clone());
        self.values = Some(v.clone());
        Ok((k, v))
    }

    /// Ring state and view length right after one more decode token, which
    /// is what a single-token mask has to describe.
    fn decode_preview(&self) -> (RingIndex, usize) {
        let mut ring = self.ring;
        let prev = ring.offset();
        let mut len = self.buffer_len();
        if self.keys.is_none() || (prev >= len && len < self.max_size) {
            len += self.step.min(self.max_size.saturating_sub(prev)).max(1);
            ring.seek(prev);
        }
        if len > self.max_size {
            len = self.max_size;
            ring.seek(self.max_size);
        }
        ring.wrap(self.max_size);
        ring.advance(1);
        let view = if ring.offset() < self.max_size {
            ring.offset()
        } else {
            len
        };
        (ring, view)
    }
}

impl KeyValueCache for RotatingKvCache {
    type View = (Tensor, Tensor);

    fn offset(&self) -> usize {
        self.ring.offset()
    }

    fn update(&mut self, keys: &Tensor, values: &Tensor) -> Result<Self::View, CacheError> {
        let n = admit(&mut self.layout, keys, values, "rotating")?;
        match n {
            0 => match self.state()? {
                Some(state) => Ok(state),
                None => Ok((keys.clone(), values.clone())),
            },
            1 => {
                let layout = self.layout.clone().ok_or_else(|| {
                    CacheError::InvalidConfig("cache layout missing after admission".to_string())
                })?;
                self.update_in_place(&layout, keys, values, n)
            }
            _ => self.update_concat(keys, values, n),
        }
    }

    fn make_mask(
        &self,
        query_len: usize,
        window: Option<usize>,
        force_array: bool,
        device: &Device,
    ) -> Result<MaskMode, CacheError> {
        if query_len > 1 {
            let window = window.unwrap_or(self.max_size);
            let offset = self.ring.offset().min(self.max_size - 1);
            if offset + query_len > window || force_array {
                return Ok(windowed_causal_mask(device, query_len, offset, Some(window))?);
            }
            return Ok(MaskMode::Causal);
        }

        let (ring, view) = self.decode_preview();
        let visible = match window {
            Some(window) if view > window => {
                recent_window_visibility(&ring.temporal_ranks(view), window)
            }
            _ if force_array => vec![1u8; view],
            _ => return Ok(MaskMode::None),
        };
        Ok(MaskMode::Array(Tensor::from_vec(visible, (1, view), device)?))
    }

    fn is_trimmable(&self) -> bool {
        self.ring.offset() < self.max_size
    }

    fn trim(&mut self, n: usize) -> usize {
        if !self.is_trimmable() {
            return 0;
        }
        self.ring.rewind(n)
    }

    fn reset(&mut self) {
        self.keys = None;
        self.values = None;
        self.layout = None;
        self.ring = RingIndex::new(self.ring.keep());
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.max_size)
    }
}
