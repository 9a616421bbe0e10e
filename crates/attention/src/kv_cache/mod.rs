//! Key/value caches persisting context across decoding steps.
//!
//! Three storage strategies share the [`KeyValueCache`] contract:
//! [`GrowableKvCache`] for global layers, [`RotatingKvCache`] for sliding
//! window layers and [`QuantizedKvCache`] for memory-constrained sessions.
//! [`LayerCache`] selects one of them per layer.

pub mod api;
pub mod growable;
pub mod layer;
pub mod layout;
pub mod quantized;
pub mod ring;
pub mod rotating;

pub use api::{unbounded_mask, KeyValueCache};
pub use growable::GrowableKvCache;
pub use layer::{make_layer_caches, trim_all, CacheView, LayerCache};
pub use layout::CacheLayout;
pub use quantized::{QuantizedKv, QuantizedKvCache};
pub use ring::RingIndex;
pub use rotating::RotatingKvCache;
