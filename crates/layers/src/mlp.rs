//! Dense gated feed-forward block.
//!
//! Hidden states shaped `(.., hidden)` are projected to `intermediate_size`
//! through parallel gate and up projections, combined by a
//! [`GateActivation`], then contracted back by the down projection:
//! `down(act(gate(x)) * up(x))`. Expert layers in [`crate::moe`] use the same
//! body with per-expert weights.

use candle_core::{DType, Device, Result, Tensor};

use crate::{
    activations::GateActivation,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
};

/// Configuration shared by transformer feed-forward networks.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub activation: GateActivation,
    /// Whether the three projections carry bias vectors.
    pub bias: bool,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation: GateActivation::default(),
            bias: false,
        }
    }
}

/// Shared interface for feed-forward stacks, dense or sparse.
pub trait FeedForwardLayer: Send + Sync {
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// `down(act(gate(x)) * up(x))` with dense projections.
#[derive(Debug, Clone)]
pub struct GluMlp {
    config: FeedForwardConfig,
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl GluMlp {
    pub fn new(config: FeedForwardConfig, gate_proj: Linear, up_proj: Linear, down_proj: Linear) -> Result<Self> {
        let expand = LinearConfig::new(config.hidden_size, config.intermediate_size).with_bias(config.bias);
        let contract = LinearConfig::new(config.intermediate_size, config.hidden_size).with_bias(config.bias);
        for (name, layer, expected) in [
            ("gate_proj", &gate_proj, &expand),
            ("up_proj", &up_proj, &expand),
            ("down_proj", &down_proj, &contract),
        ] {
            if layer.config() != expected {
                candle_core::bail!("mlp.{name}: expected {expected:?}, got {:?}", layer.config());
            }
        }
        Ok(Self {
            config,
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    /// Randomly initialised block, used by reference models and benches.
    pub fn with_init(config: FeedForwardConfig, init: &LinearInit, device: &Device, dtype: DType) -> Result<Self> {
        let expand = LinearConfig::new(config.hidden_size, config.intermediate_size).with_bias(config.bias);
        let contract = LinearConfig::new(config.intermediate_size, config.hidden_size).with_bias(config.bias);
        let gate_proj = Linear::with_init(expand.clone(), init, device, dtype)?;
        let up_proj = Linear::with_init(expand, init, device, dtype)?;
        let down_proj = Linear::with_init(contract, init, device, dtype)?;
        Self::new(config, gate_proj, up_proj, down_proj)
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }
}

impl FeedForwardLayer for GluMlp {
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let gate = self.gate_proj.forward(hidden, policy)?;
        let up = self.up_proj.forward(hidden, policy)?;
        let activated = self.config.activation.apply(&gate, &up, policy)?;
        self.down_proj.forward(&activated, policy)
    }
}
