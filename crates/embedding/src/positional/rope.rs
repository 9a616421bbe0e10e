//! Rotary positional embedding.
//!
//! A [`RotaryEncoder`] owns an immutable [`FrequencyTable`] resolved from the
//! architecture configuration. Applying it to a tensor shaped
//! `[..., seq_len, head_dim]` rotates the leading `dims` features of every
//! position `offset + s` and copies the remainder through untouched.
//!
//! Two pairings are supported:
//! * `traditional = true` rotates interleaved pairs `(x[2i], x[2i + 1])`;
//! * `traditional = false` rotates split halves `(x[i], x[i + dims/2])`,
//!   the layout used by most Hugging Face checkpoints.

use candle_core::{bail, DType, Device, Result, Tensor};

use super::error::RopeError;
use super::scaling::{build_table, FrequencyTable, RopeScalingConfig, RopeVariant};

/// Configuration for building a rotary encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryConfig {
    /// Number of leading features rotated per head; must be even.
    pub dims: usize,
    /// Base angle parameter θ (commonly 10k, 500k for llama3 checkpoints).
    pub base: f64,
    /// Interleaved pairing instead of split halves.
    pub traditional: bool,
    /// Extended context length the checkpoint advertises.
    pub max_position_embeddings: usize,
    /// Optional `rope_scaling` block selecting a context-extension variant.
    pub scaling: Option<RopeScalingConfig>,
}

impl Default for RotaryConfig {
    fn default() -> Self {
        Self {
            dims: 0,
            base: 10_000.0,
            traditional: false,
            max_position_embeddings: 2048,
            scaling: None,
        }
    }
}

/// Stateless-after-construction rotary encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryEncoder {
    dims: usize,
    traditional: bool,
    variant: RopeVariant,
    table: FrequencyTable,
}

impl RotaryEncoder {
    /// Resolve the variant and precompute its frequency table.
    pub fn new(config: &RotaryConfig) -> std::result::Result<Self, RopeError> {
        if config.dims == 0 || config.dims % 2 != 0 {
            return Err(RopeError::InvalidConfig(format!(
                "rotary dims must be a positive even number, got {}",
                config.dims
            )));
        }
        if config.base.is_nan() || config.base <= 0.0 {
            return Err(RopeError::InvalidConfig(format!(
                "rotary base must be positive, got {}",
                config.base
            )));
        }

        let default_scaling = RopeScalingConfig::default();
        let scaling = config.scaling.as_ref().unwrap_or(&default_scaling);
        let variant = RopeVariant::parse(scaling.variant_name())?;
        let table = build_table(
            variant,
            config.dims,
            config.base,
            config.max_position_embeddings,
            scaling,
        )?;
        log::debug!(
            "rope table built: variant={} dims={} base={} mscale={:.6} position_scale={:.6}",
            variant,
            config.dims,
            config.base,
            table.mscale,
            table.position_scale
        );

        Ok(Self {
            dims: config.dims,
            traditional: config.traditional,
            variant,
            table,
        })
    }

    pub fn variant(&self) -> RopeVariant {
        self.variant
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Inverse frequencies used for short contexts.
    pub fn inv_freq(&self) -> &[f64] {
        &self.table.inv_freq
    }

    /// Magnitude rescale applied to the rotated features (1.0 for most variants).
    pub fn magnitude_scale(&self) -> f64 {
        self.table.mscale
    }

    pub fn table(&self) -> &FrequencyTable {
        &self.table
    }

    /// Cosine and sine tables shaped `[seq_len, dims/2]` for positions
    /// `offset..offset + seq_len`, with the magnitude rescale folded in.
    pub fn cos_sin(&self, offset: usize, seq_len: usize, device: &Device) -> Result<(Tensor, Tensor)> {
        let inv_freq = self.table.select(offset + seq_len);
        let half = inv_freq.len();
        let mscale = self.table.mscale;

        let mut cos = Vec::with_capacity(seq_len * half);
        let mut sin = Vec::with_capacity(seq_len * half);
        for pos in offset..offset + seq_len {
            let pos = pos as f64 * self.table.position_scale;
            for &freq in inv_freq {
                let angle = pos * freq;
                cos.push((angle.cos() * mscale) as f32);
                sin.push((angle.sin() * mscale) as f32);
            }
        }

        let cos = Tensor::from_vec(cos, (seq_len, half), device)?;
        let sin = Tensor::from_vec(sin, (seq_len, half), device)?;
        Ok((cos, sin))
    }

    /// Rotate `x` (shaped `[..., seq_len, head_dim]`) as positions
    /// `offset..offset + seq_len`. The output keeps the input's shape and dtype.
    pub fn apply(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let rank = x.rank();
        if rank < 2 {
            bail!("rotary input must have rank >= 2, got {:?}", x.dims());
        }
        let last = rank - 1;
        let seq_len = x.dims()[rank - 2];
        let head_dim = x.dims()[last];
        if head_dim < self.dims {
            bail!("head_dim {} is smaller than rotary dims {}", head_dim, self.dims);
        }
        if seq_len == 0 {
            return Ok(x.clone());
        }

        let dtype = x.dtype();
        let (cos, sin) = self.cos_sin(offset, seq_len, x.device())?;
        let main = x.narrow(last, 0, self.dims)?.to_dtype(DType::F32)?;
        let rotated = if self.traditional {
            rotate_interleaved(&main, &cos, &sin)?
        } else {
            rotate_half(&main, &cos, &sin)?
        }
        .to_dtype(dtype)?;

        let tail_dim = head_dim - self.dims;
        if tail_dim == 0 {
            Ok(rotated)
        } else {
            let tail = x.narrow(last, self.dims, tail_dim)?;
            Tensor::cat(&[&rotated, &tail], last)
        }
    }
}

fn rotate_half(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let last = x.rank() - 1;
    let half = x.dims()[last] / 2;
    let x1 = x.narrow(last, 0, half)?;
    let x2 = x.narrow(last, half, half)?;

    let out1 = x1.broadcast_mul(cos)?.sub(&x2.broadcast_mul(sin)?)?;
    let out2 = x2.broadcast_mul(cos)?.add(&x1.broadcast_mul(sin)?)?;
    Tensor::cat(&[&out1, &out2], last)
}

fn rotate_interleaved(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let last = dims.len() - 1;
    let mut paired = dims.clone();
    paired[last] /= 2;
    paired.push(2);

    let pairs = x.reshape(paired)?;
    let even = pairs.narrow(last + 1, 0, 1)?.squeeze(last + 1)?;
    let odd = pairs.narrow(last + 1, 1, 1)?.squeeze(last + 1)?;

    let rotated_even = even.broadcast_mul(cos)?.sub(&odd.broadcast_mul(sin)?)?;
    let rotated_odd = odd.broadcast_mul(cos)?.add(&even.broadcast_mul(sin)?)?;
    Tensor::stack(&[&rotated_even, &rotated_odd], last + 1)?.reshape(dims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder(dims: usize, traditional: bool) -> RotaryEncoder {
        RotaryEncoder::new(&RotaryConfig {
            dims,
            traditional,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn rejects_odd_dims() {
        let err = RotaryEncoder::new(&RotaryConfig {
            dims: 7,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, RopeError::InvalidConfig(_)));
    }

    #[test]
    fn missing_scaling_block_selects_default() {
        assert_eq!(encoder(8, false).variant(), RopeVariant::Default);
    }

    #[test]
    fn unknown_variant_fails_construction() {
        let err = RotaryEncoder::new(&RotaryConfig {
            dims: 8,
            scaling: Some(RopeScalingConfig {
                kind: Some("dynamic".into()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, RopeError::UnsupportedVariant(_)));
    }

    #[test]
    fn cos_sin_start_at_offset() -> Result<()> {
        let rope = encoder(4, false);
        let (cos, sin) = rope.cos_sin(3, 2, &Device::Cpu)?;
        assert_eq!(cos.dims(), &[2, 2]);
        let sin = sin.to_vec2::<f32>()?;
        assert!((sin[0][0] - 3f32.sin()).abs() < 1e-6);
        assert!((sin[1][0] - 4f32.sin()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn single_pair_rotation_matches_closed_form() -> Result<()> {
        for traditional in [false, true] {
            let rope = encoder(2, traditional);
            let x = Tensor::from_vec(vec![1f32, 0.0], (1, 1, 1, 2), &Device::Cpu)?;
            let out = rope.apply(&x, 1)?.flatten_all()?.to_vec1::<f32>()?;
            assert!((out[0] - 1f32.cos()).abs() < 1e-6);
            assert!((out[1] - 1f32.sin()).abs() < 1e-6);
        }
        Ok(())
    }
}
