//! Activation catalogue for dense and expert feed-forward blocks.
//!
//! Activations promote inputs to the compute dtype requested by
//! [`PrecisionPolicy`] before evaluating the non-linearity, then cast back to
//! the storage dtype.
//!
//! # Built-in formulas
//!
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **SiLU / Swish** computes `x * sigmoid(x)` via Candle's fused kernel.
//! * **GPT-OSS gate** clamps both GLU branches to `[-limit, limit]`, then
//!   evaluates `g * sigmoid(alpha * g) * (linear + 1)`.

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::dtypes::PrecisionPolicy;

/// Identifies a single-input non-linearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Identity,
    Gelu,
    Silu,
    Relu,
}

impl ActivationKind {
    /// Maps a Hugging Face `hidden_act` string.
    pub fn from_hidden_act(name: &str) -> Option<Self> {
        match name {
            "silu" | "swish" => Some(Self::Silu),
            "gelu" | "gelu_pytorch_tanh" | "gelu_new" => Some(Self::Gelu),
            "relu" => Some(Self::Relu),
            "identity" | "linear" => Some(Self::Identity),
            _ => None,
        }
    }
}

/// Default GPT-OSS gate parameters.
pub const GPT_OSS_ALPHA: f32 = 1.702;
pub const GPT_OSS_LIMIT: f32 = 7.0;

/// Combination of the gate and linear branches of a GLU body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateActivation {
    /// `act(gate) * linear`; SiLU gives the usual SwiGLU.
    Standard(ActivationKind),
    /// Clipped SwiGLU used by GPT-OSS experts.
    GptOss { alpha: f32, limit: f32 },
}

impl Default for GateActivation {
    fn default() -> Self {
        Self::Standard(ActivationKind::Silu)
    }
}

impl GateActivation {
    pub fn gpt_oss() -> Self {
        Self::GptOss {
            alpha: GPT_OSS_ALPHA,
            limit: GPT_OSS_LIMIT,
        }
    }

    /// Combines `gate` and `linear` (same shape) into the GLU hidden state.
    pub fn apply(&self, gate: &Tensor, linear: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let gate = policy.cast_for_matmul(gate)?;
        let linear = policy.cast_for_matmul(linear)?;
        let out = match *self {
            GateActivation::Standard(kind) => {
                let activated = match kind {
                    ActivationKind::Identity => gate,
                    ActivationKind::Relu => gate.relu()?,
                    ActivationKind::Gelu => gate.gelu_erf()?,
                    ActivationKind::Silu => gate.silu()?,
                };
                activated.mul(&linear)?
            }
            GateActivation::GptOss { alpha, limit } => gpt_oss_glu(&gate, &linear, alpha, limit)?,
        };
        policy.cast_to_storage(&out)
    }
}

/// Clipped SwiGLU: both branches are clamped to `[-limit, limit]`.
pub fn gpt_oss_glu(gate: &Tensor, linear: &Tensor, alpha: f32, limit: f32) -> Result<Tensor> {
    let limit = f64::from(limit);
    let gate = gate.clamp(-limit, limit)?;
    let linear = linear.clamp(-limit, limit)?;
    let glu = gate.mul(&candle_nn::ops::sigmoid(&gate.affine(f64::from(alpha), 0.0)?)?)?;
    glu.mul(&linear.affine(1.0, 1.0)?)
}
