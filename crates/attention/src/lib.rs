//! Attention-side execution core: key/value caches, visibility masks and
//! reference attention kernels.
//!
//! Tensors use the layout `[batch, n_heads, seq_len, head_dim]`. Each decoder
//! layer owns one [`LayerCache`]; before a forward step the model asks the
//! cache for a [`MaskMode`], rotates queries and keys at the cache offset,
//! appends the new keys and values, and attends over the returned view.
//!
//! Caches are owned by a single generation session and are not `Sync`.
//! Quantized caches return a distinct [`QuantizedKv`] view, consumed only by
//! the quantization-aware kernel.

pub mod core;
pub mod interop;
pub mod kv_cache;
pub mod masks;
pub mod reference;

pub use crate::core::{Attention, CacheError, CacheKind, Config};
pub use interop::RopeAdapter;
pub use kv_cache::{
    CacheView, GrowableKvCache, KeyValueCache, LayerCache, QuantizedKv, QuantizedKvCache,
    RotatingKvCache,
};
pub use masks::MaskMode;
pub use reference::ExactAttention;
