//! Dense projections used by attention, dense MLPs and the expert router.
//!
//! Inputs may have any number of leading dimensions; the trailing dimension
//! must equal `input_dim` and is replaced by `output_dim`. Weights follow the
//! `[out, in]` checkpoint layout. Parameters are immutable after construction
//! so a layer can be shared across threads without locking.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration of a dense projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    /// Whether a bias vector is applied after the matmul.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a bias-free projection, the common case for decoder checkpoints.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
        }
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    fn config(&self) -> &LinearConfig;

    /// Applies the projection, promoting to the compute dtype when needed.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Weight initialisation used when building randomly initialised models.
#[derive(Debug, Clone)]
pub enum LinearInit {
    XavierUniform,
    XavierNormal,
    /// Zero-mean normal with a fixed standard deviation (`initializer_range`).
    Normal { std: f64 },
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::Normal { std } => Tensor::randn(0f32, *std as f32, shape, device)?,
        };
        if dtype == DType::F32 {
            Ok(weight)
        } else {
            weight.to_dtype(dtype)
        }
    }
}

/// Dense affine projection with an optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a projection from existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_rank("linear.weight", &weight, 2)?;
        checks::expect_shape("linear.weight", &weight, &[config.output_dim, config.input_dim])?;
        checks::expect_dtype_in("linear.weight", &weight, &[DType::F16, DType::BF16, DType::F32])?;
        match (config.bias, &bias) {
            (true, Some(b)) => checks::expect_shape("linear.bias", b, &[config.output_dim])?,
            (false, Some(_)) => return Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => return Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => {}
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a projection with randomly initialised weights and a zero bias.
    pub fn with_init(config: LinearConfig, init: &LinearInit, device: &Device, dtype: DType) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;

        let mut out_dims = hidden.dims().to_vec();
        let rows = hidden.elem_count() / self.config.input_dim;
        if let Some(last) = out_dims.last_mut() {
            *last = self.config.output_dim;
        }

        let input = policy
            .cast_for_matmul(hidden)?
            .reshape((rows, self.config.input_dim))?;
        let weight = policy.cast_for_matmul(&self.weight)?;
        let mut output = input.matmul(&weight.t()?)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }
        policy.cast_to_storage(&output.reshape(out_dims)?)
    }
}
