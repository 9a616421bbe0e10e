//! RMS normalisation for decoder blocks.
//!
//! Normalisation runs over the trailing axis in `f32` and the result is cast
//! back to the storage dtype.

use candle_core::{DType, Device, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Root mean square norm with a learnable per-feature scale.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        checks::expect_rank("rms_norm.weight", &weight, 1)?;
        Ok(Self { weight, eps })
    }

    /// Unit scale, the state of a freshly initialised norm.
    pub fn ones(hidden_size: usize, eps: f64, device: &Device, dtype: DType) -> Result<Self> {
        Self::new(Tensor::ones(hidden_size, dtype, device)?, eps)
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("rms_norm.input", hidden, self.weight.dims()[0])?;
        let x = hidden.to_dtype(DType::F32)?.contiguous()?;
        let weight = self.weight.to_dtype(DType::F32)?;
        let out = candle_nn::ops::rms_norm(&x, &weight, self.eps as f32)?;
        policy.cast_to_storage(&out)
    }
}
