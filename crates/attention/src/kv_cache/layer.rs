//! One cache per decoder layer, variant chosen at session start.

use candle_core::{Device, Tensor};

use super::{
    api::KeyValueCache,
    growable::GrowableKvCache,
    quantized::{QuantizedKv, QuantizedKvCache},
    rotating::RotatingKvCache,
};
use crate::{
    core::{CacheError, CacheKind},
    masks::MaskMode,
};

/// Keys and values handed to attention after an update.
#[derive(Debug, Clone)]
pub enum CacheView {
    Dense { keys: Tensor, values: Tensor },
    Quantized(QuantizedKv),
}

impl CacheView {
    pub fn seq_len(&self) -> usize {
        match self {
            CacheView::Dense { keys, .. } => keys.dims()[2],
            CacheView::Quantized(kv) => kv.seq_len(),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, CacheView::Quantized(_))
    }

    pub fn as_dense(&self) -> Option<(&Tensor, &Tensor)> {
        match self {
            CacheView::Dense { keys, values } => Some((keys, values)),
            CacheView::Quantized(_) => None,
        }
    }
}

impl From<(Tensor, Tensor)> for CacheView {
    fn from((keys, values): (Tensor, Tensor)) -> Self {
        CacheView::Dense { keys, values }
    }
}

macro_rules! each_cache {
    ($cache:expr, $c:ident => $body:expr) => {
        match $cache {
            LayerCache::Growable($c) => $body,
            LayerCache::Rotating($c) => $body,
            LayerCache::Quantized($c) => $body,
        }
    };
}

#[derive(Debug)]
pub enum LayerCache {
    Growable(GrowableKvCache),
    Rotating(RotatingKvCache),
    Quantized(QuantizedKvCache),
}

impl LayerCache {
    pub fn new(kind: CacheKind) -> Result<Self, CacheError> {
        kind.validate()?;
        Ok(match kind {
            CacheKind::Growable => LayerCache::Growable(GrowableKvCache::new()),
            CacheKind::Rotating { max_size, keep } => {
                LayerCache::Rotating(RotatingKvCache::new(max_size, keep)?)
            }
            CacheKind::Quantized { group_size, bits } => {
                LayerCache::Quantized(QuantizedKvCache::new(group_size, bits)?)
            }
        })
    }

    pub fn kind(&self) -> CacheKind {
        match self {
            LayerCache::Growable(_) => CacheKind::Growable,
            LayerCache::Rotating(c) => CacheKind::Rotating {
                max_size: c.max_size(),
                keep: c.keep(),
            },
            LayerCache::Quantized(c) => {
                let config = c.config();
                CacheKind::Quantized {
                    group_size: config.group_size,
                    bits: config.bits,
                }
            }
        }
    }

    /// Retained tokens in temporal order without appending anything.
    pub fn state(&self) -> Result<Option<CacheView>, CacheError> {
        Ok(match self {
            LayerCache::Growable(c) => c.state()?.map(CacheView::from),
            LayerCache::Rotating(c) => c.state()?.map(CacheView::from),
            LayerCache::Quantized(c) => c.state()?.map(CacheView::Quantized),
        })
    }
}

impl KeyValueCache for LayerCache {
    type View = CacheView;

    fn offset(&self) -> usize {
        each_cache!(self, c => c.offset())
    }

    fn update(&mut self, keys: &Tensor, values: &Tensor) -> Result<CacheView, CacheError> {
        match self {
            LayerCache::Growable(c) => c.update(keys, values).map(CacheView::from),
            LayerCache::Rotating(c) => c.update(keys, values).map(CacheView::from),
            LayerCache::Quantized(c) => c.update(keys, values).map(CacheView::Quantized),
        }
    }

    fn make_mask(
        &self,
        query_len: usize,
        window: Option<usize>,
        force_array: bool,
        device: &Device,
    ) -> Result<MaskMode, CacheError> {
        each_cache!(self, c => c.make_mask(query_len, window, force_array, device))
    }

    fn is_trimmable(&self) -> bool {
        each_cache!(self, c => c.is_trimmable())
    }

    fn trim(&mut self, n: usize) -> usize {
        each_cache!(self, c => c.trim(n))
    }

    fn reset(&mut self) {
        each_cache!(self, c => c.reset())
    }

    fn capacity(&self) -> Option<usize> {
        each_cache!(self, c => c.capacity())
    }
}

/// Builds one cache per layer.
pub fn make_layer_caches(kinds: &[CacheKind]) -> Result<Vec<LayerCache>, CacheError> {
    kinds.iter().map(|&kind| LayerCache::new(kind)).collect()
}

/// Trims every cache by `n` if all of them can be trimmed.
pub fn trim_all(caches: &mut [LayerCache], n: usize) -> usize {
    if caches.iter().all(|c| c.is_trimmable()) {
        caches.iter_mut().fold(0, |_, c| c.trim(n))
    } else {
        0
    }
}
