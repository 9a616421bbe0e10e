use std::fmt;

use attention::{
    core::{Attention, Config as AttentionConfig},
    ExactAttention, KeyValueCache, LayerCache, MaskMode, RopeAdapter,
};
use candle_core::{bail, DType, Device, Result, Tensor};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    mlp::{FeedForwardConfig, FeedForwardLayer, GluMlp},
    moe::SparseMoeBlock,
    norm::RmsNorm,
    QuantConfig,
};

use crate::{config::ArchitectureConfig, error::ModelError};

/// Dense or routed feed-forward half of a decoder block.
#[derive(Debug, Clone)]
pub enum FeedForward {
    Dense(GluMlp),
    Sparse(SparseMoeBlock),
}

impl FeedForward {
    fn with_init(config: &ArchitectureConfig, device: &Device, dtype: DType) -> std::result::Result<Self, ModelError> {
        let init = LinearInit::XavierNormal;
        let Some(moe) = config.moe_config() else {
            let mut dense = FeedForwardConfig::new(config.hidden_size, config.intermediate_size);
            dense.activation = config.gate_activation();
            return Ok(Self::Dense(GluMlp::with_init(dense, &init, device, dtype)?));
        };

        let block = SparseMoeBlock::with_init(&moe, &init, device, dtype)?;
        match config.quantization {
            Some(quant) => {
                let experts = block.experts().quantized(QuantConfig::from(quant))?;
                Ok(Self::Sparse(SparseMoeBlock::new(block.router().clone(), experts)?))
            }
            None => Ok(Self::Sparse(block)),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse(_))
    }
}

impl FeedForwardLayer for FeedForward {
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match self {
            Self::Dense(mlp) => mlp.forward(hidden, policy),
            Self::Sparse(moe) => moe.forward(hidden, policy),
        }
    }
}

/// Pre-norm decoder layer: grouped-query attention over a cache, then a
/// dense or sparse feed-forward, each wrapped in a residual.
pub struct DecoderBlock {
    hidden_size: usize,
    heads: usize,
    kv_heads: usize,
    head_dim: usize,
    policy: PrecisionPolicy,
    input_norm: RmsNorm,
    post_attention_norm: RmsNorm,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    rope: RopeAdapter,
    attention: ExactAttention,
    attention_config: AttentionConfig,
    mlp: FeedForward,
}

impl fmt::Debug for DecoderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderBlock")
            .field("hidden_size", &self.hidden_size)
            .field("heads", &self.heads)
            .field("kv_heads", &self.kv_heads)
            .field("head_dim", &self.head_dim)
            .field("sparse", &self.mlp.is_sparse())
            .finish()
    }
}

impl DecoderBlock {
    /// Randomly initialised block shaped by `config`.
    pub fn with_init(
        config: &ArchitectureConfig,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, ModelError> {
        let hidden = config.hidden_size;
        let heads = config.num_attention_heads;
        let kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();
        let bias = config.is_gpt_oss();
        let init = LinearInit::XavierNormal;
        let proj = |input: usize, output: usize| {
            Linear::with_init(LinearConfig::new(input, output).with_bias(bias), &init, device, dtype)
        };

        Ok(Self {
            hidden_size: hidden,
            heads,
            kv_heads,
            head_dim,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            input_norm: RmsNorm::ones(hidden, config.rms_norm_eps, device, dtype)?,
            post_attention_norm: RmsNorm::ones(hidden, config.rms_norm_eps, device, dtype)?,
            q_proj: proj(hidden, heads * head_dim)?,
            k_proj: proj(hidden, kv_heads * head_dim)?,
            v_proj: proj(hidden, kv_heads * head_dim)?,
            o_proj: proj(heads * head_dim, hidden)?,
            rope: RopeAdapter::from_config(&config.rotary_config())?,
            attention: ExactAttention::new(),
            attention_config: AttentionConfig::default(),
            mlp: FeedForward::with_init(config, device, dtype)?,
        })
    }

    pub fn feed_forward(&self) -> &FeedForward {
        &self.mlp
    }

    fn split_heads(&self, tensor: &Tensor, heads: usize) -> Result<Tensor> {
        let (batch, seq, _) = tensor.dims3()?;
        tensor
            .reshape((batch, seq, heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq, head_dim) = tensor.dims4()?;
        if heads != self.heads || head_dim != self.head_dim {
            bail!(
                "attention output expected {} heads of {}, got {heads} of {head_dim}",
                self.heads,
                self.head_dim
            );
        }
        tensor.transpose(1, 2)?.reshape((batch, seq, heads * head_dim))
    }

    /// Runs `hidden` (`[batch, seq, hidden]`) at the cache's offset,
    /// appending this step's keys and values to `cache`.
    ///
    /// `mask` must have been derived from the cache state before the update.
    pub fn forward(
        &self,
        hidden: &Tensor,
        mask: &MaskMode,
        cache: &mut LayerCache,
    ) -> std::result::Result<Tensor, ModelError> {
        checks::expect_rank("decoder.input", hidden, 3)?;
        checks::expect_last_dim("decoder.input", hidden, self.hidden_size)?;

        let normed = self.input_norm.forward(hidden, &self.policy)?;
        let q = self.split_heads(&self.q_proj.forward(&normed, &self.policy)?, self.heads)?;
        let k = self.split_heads(&self.k_proj.forward(&normed, &self.policy)?, self.kv_heads)?;
        let v = self.split_heads(&self.v_proj.forward(&normed, &self.policy)?, self.kv_heads)?;

        let (q, k) = self.rope.apply_at(&q, &k, &*cache)?;
        let view = cache.update(&k, &v)?;
        let attended = self.attention.attend(&q, &view, mask, &self.attention_config)?;
        let projected = self.o_proj.forward(&self.merge_heads(&attended)?, &self.policy)?;
        let hidden = hidden.add(&projected)?;

        let normed = self.post_attention_norm.forward(&hidden, &self.policy)?;
        Ok(hidden.add(&self.mlp.forward(&normed, &self.policy)?)?)
    }
}
