use attention::{KeyValueCache, LayerCache, MaskMode};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Embedding;
use generation::LanguageModel;
use layers::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    norm::RmsNorm,
};

use crate::{
    block::DecoderBlock,
    config::{ArchitectureConfig, LayerKind},
    error::ModelError,
};

const INITIALIZER_RANGE: f64 = 0.02;

/// Randomly initialised decoder-only transformer.
///
/// Masks are derived once per step: full-attention layers share the mask of
/// the designated global layer's cache and sliding layers share the mask of
/// the first sliding layer's cache.
#[derive(Debug)]
pub struct Model {
    config: ArchitectureConfig,
    device: Device,
    embed_tokens: Embedding,
    blocks: Vec<DecoderBlock>,
    layer_kinds: Vec<LayerKind>,
    global_layer: Option<usize>,
    sliding_layer: Option<usize>,
    norm: RmsNorm,
    lm_head: Linear,
    policy: PrecisionPolicy,
}

impl Model {
    pub fn with_init(config: ArchitectureConfig, device: &Device, dtype: DType) -> Result<Self, ModelError> {
        config.validate()?;
        let hidden = config.hidden_size;
        let vocab = config.vocab_size;

        let embeddings = Tensor::randn(0f32, INITIALIZER_RANGE as f32, (vocab, hidden), device)?.to_dtype(dtype)?;
        let head_config = LinearConfig::new(hidden, vocab);
        let lm_head = if config.tie_word_embeddings {
            Linear::new(head_config, embeddings.clone(), None)?
        } else {
            Linear::with_init(head_config, &LinearInit::Normal { std: INITIALIZER_RANGE }, device, dtype)?
        };

        let blocks = (0..config.num_hidden_layers)
            .map(|_| DecoderBlock::with_init(&config, device, dtype))
            .collect::<Result<Vec<_>, _>>()?;
        let layer_kinds = config.layer_kinds();
        let sliding = layer_kinds
            .iter()
            .filter(|kind| **kind == LayerKind::SlidingAttention)
            .count();
        log::info!(
            "reference model: {} layers ({} sliding), hidden {}, {} experts, dtype {:?}",
            blocks.len(),
            sliding,
            hidden,
            config.num_local_experts.unwrap_or(0),
            dtype
        );

        Ok(Self {
            global_layer: config.designated_global_layer(),
            sliding_layer: config.designated_sliding_layer(),
            layer_kinds,
            embed_tokens: Embedding::new(embeddings, hidden),
            blocks,
            norm: RmsNorm::ones(hidden, config.rms_norm_eps, device, dtype)?,
            lm_head,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            device: device.clone(),
            config,
        })
    }

    pub fn config(&self) -> &ArchitectureConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn blocks(&self) -> &[DecoderBlock] {
        &self.blocks
    }

    /// Global and sliding masks for a query of `query_len` tokens, taken
    /// from the caches before they are updated.
    fn step_masks(&self, query_len: usize, caches: &[LayerCache]) -> Result<(MaskMode, MaskMode), ModelError> {
        let global = match self.global_layer {
            Some(layer) => caches[layer].make_mask(query_len, None, false, &self.device)?,
            None => MaskMode::None,
        };
        let sliding = match self.sliding_layer {
            Some(layer) => caches[layer].make_mask(query_len, self.config.sliding_window, false, &self.device)?,
            None => MaskMode::None,
        };
        Ok((global, sliding))
    }

    /// Runs `input_ids` (`u32` `[batch, seq]`) and returns `f32` logits
    /// `[batch, vocab]` for the last position.
    pub fn forward_ids(&self, input_ids: &Tensor, caches: &mut [LayerCache]) -> Result<Tensor, ModelError> {
        if caches.len() != self.blocks.len() {
            return Err(candle_core::Error::Msg(format!(
                "expected {} layer caches, got {}",
                self.blocks.len(),
                caches.len()
            ))
            .into());
        }
        let (_, seq) = input_ids.dims2()?;
        if seq == 0 {
            return Err(candle_core::Error::Msg("input_ids must contain at least one position".into()).into());
        }

        let (global_mask, sliding_mask) = self.step_masks(seq, caches)?;
        let mut hidden = self.embed_tokens.forward(input_ids)?;
        for ((block, kind), cache) in self.blocks.iter().zip(&self.layer_kinds).zip(caches.iter_mut()) {
            let mask = match kind {
                LayerKind::FullAttention => &global_mask,
                LayerKind::SlidingAttention => &sliding_mask,
            };
            hidden = block.forward(&hidden, mask, cache)?;
        }

        let last = hidden.narrow(1, seq - 1, 1)?;
        let normed = self.norm.forward(&last, &self.policy)?;
        let logits = self.lm_head.forward(&normed, &self.policy)?;
        Ok(logits.squeeze(1)?.to_dtype(DType::F32)?)
    }
}

impl LanguageModel for Model {
    type Error = ModelError;

    fn new_caches(&self) -> Result<Vec<LayerCache>, ModelError> {
        self.config.make_caches()
    }

    fn forward(&self, tokens: &[u32], caches: &mut [LayerCache]) -> Result<Tensor, ModelError> {
        let input_ids = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.forward_ids(&input_ids, caches)?.squeeze(0)?)
    }
}
