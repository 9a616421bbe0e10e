//! Cache storing affine-quantized keys and values.
//!
//! Each appended block is quantized on its own along the head dimension and
//! written into preallocated code/scale/bias buffers. Updates hand back a
//! [`QuantizedKv`] so callers must pick a quantization-aware attention path.

use std::{cell::Cell, marker::PhantomData};

use candle_core::{DType, Device, Tensor};
use layers::{quant, QuantConfig, QuantizedTensor};

use super::{
    api::{grow_steps, unbounded_mask, KeyValueCache},
    layout::{admit, CacheLayout},
};
use crate::{
    core::{CacheError, CacheKind, DEFAULT_STEP},
    masks::MaskMode,
};

/// Still-quantized keys and values, `[batch, kv_heads, seq, head_dim]` once
/// dequantized.
#[derive(Debug, Clone)]
pub struct QuantizedKv {
    pub keys: QuantizedTensor,
    pub values: QuantizedTensor,
}

impl QuantizedKv {
    pub fn seq_len(&self) -> usize {
        self.keys.dims()[2]
    }

    /// Dense `f32` copies, for tests and diagnostics.
    pub fn dequantize(&self) -> candle_core::Result<(Tensor, Tensor)> {
        Ok((quant::dequantize(&self.keys)?, quant::dequantize(&self.values)?))
    }

    fn narrow(&self, len: usize) -> candle_core::Result<Self> {
        Ok(Self {
            keys: self.keys.narrow(2, 0, len)?,
            values: self.values.narrow(2, 0, len)?,
        })
    }
}

#[derive(Debug)]
pub struct QuantizedKvCache {
    buffers: Option<QuantizedKv>,
    layout: Option<CacheLayout>,
    config: QuantConfig,
    offset: usize,
    step: usize,
    _not_sync: PhantomData<Cell<()>>,
}

impl QuantizedKvCache {
    pub fn new(group_size: usize, bits: u8) -> Result<Self, CacheError> {
        CacheKind::Quantized { group_size, bits }.validate()?;
        Ok(Self {
            buffers: None,
            layout: None,
            config: QuantConfig::new(group_size, bits),
            offset: 0,
            step: DEFAULT_STEP,
            _not_sync: PhantomData,
        })
    }

    pub fn config(&self) -> QuantConfig {
        self.config
    }

    pub fn allocated(&self) -> usize {
        self.buffers.as_ref().map_or(0, QuantizedKv::seq_len)
    }

    pub fn state(&self) -> Result<Option<QuantizedKv>, CacheError> {
        match &self.buffers {
            Some(buffers) => Ok(Some(buffers.narrow(self.offset)?)),
            None => Ok(None),
        }
    }

    fn check_dims(&self, layout: &CacheLayout) -> Result<(), CacheError> {
        let per_word = self.config.values_per_word();
        for (name, dim) in [("key", layout.key_dim), ("value", layout.value_dim)] {
            if dim % self.config.group_size != 0 || dim % per_word != 0 {
                return Err(CacheError::InvalidConfig(format!(
                    "{name} head dim {dim} is not divisible by group size {} and {} codes per word",
                    self.config.group_size, per_word
                )));
            }
        }
        Ok(())
    }

    fn empty(&self, layout: &CacheLayout, tokens: usize, dim: usize, device: &Device) -> candle_core::Result<QuantizedTensor> {
        QuantizedTensor::from_parts(
            layout.zeros_like(tokens, dim / self.config.values_per_word(), DType::U32, device)?,
            layout.zeros_like(tokens, dim / self.config.group_size, DType::F32, device)?,
            layout.zeros_like(tokens, dim / self.config.group_size, DType::F32, device)?,
            self.config,
        )
    }

    fn reserve(&mut self, layout: &CacheLayout, tokens: usize, device: &Device) -> candle_core::Result<()> {
        let prev = self.offset;
        if self.buffers.is_some() && prev + tokens <= self.allocated() {
            return Ok(());
        }
        let extra = grow_steps(self.step, tokens);
        let fresh = QuantizedKv {
            keys: self.empty(layout, extra, layout.key_dim, device)?,
            values: self.empty(layout, extra, layout.value_dim, device)?,
        };
        let grown = match self.buffers.take() {
            Some(old) => {
                let old = old.narrow(prev)?;
                QuantizedKv {
                    keys: QuantizedTensor::cat(&[&old.keys, &fresh.keys], 2)?,
                    values: QuantizedTensor::cat(&[&old.values, &fresh.values], 2)?,
                }
            }
            None => fresh,
        };
        log::debug!(
            "kv-cache grow: kind=quantized offset={} allocated={}",
            prev,
            grown.seq_len()
        );
        self.buffers = Some(grown);
        Ok(())
    }
}

fn write(dst: &QuantizedTensor, src: &QuantizedTensor, at: usize) -> candle_core::Result<()> {
    dst.codes().slice_set(&src.codes().contiguous()?, 2, at)?;
    dst.scales().slice_set(&src.scales().contiguous()?, 2, at)?;
    dst.biases().slice_set(&src.biases().contiguous()?, 2, at)
}

impl KeyValueCache for QuantizedKvCache {
    type View = QuantizedKv;

    fn offset(&self) -> usize {
        self.offset
    }

    fn update(&mut self, keys: &Tensor, values: &Tensor) -> Result<Self::View, CacheError> {
        let first = self.layout.is_none();
        let n = admit(&mut self.layout, keys, values, "quantized")?;
        let layout = self.layout.clone().ok_or_else(|| {
            CacheError::InvalidConfig("cache layout missing after admission".to_string())
        })?;
        if first {
            if let Err(err) = self.check_dims(&layout) {
                self.layout = None;
                return Err(err);
            }
        }
        self.reserve(&layout, n, keys.device())?;

        let prev = self.offset;
        let buffers = self.buffers.as_ref().ok_or_else(|| {
            CacheError::InvalidConfig("quantized buffers missing after reservation".to_string())
        })?;
        if n > 0 {
            let k = quant::quantize(keys, self.config)?;
            let v = quant::quantize(values, self.config)?;
            write(&buffers.keys, &k, prev)?;
            write(&buffers.values, &v, prev)?;
        }
        self.offset += n;
        Ok(buffers.narrow(self.offset)?)
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
        self.buffers = None;
        self.layout = None;
        self.offset = 0;
    }
}
