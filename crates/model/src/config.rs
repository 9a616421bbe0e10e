use attention::{kv_cache::make_layer_caches, CacheKind, LayerCache};
use embedding::{RopeScalingConfig, RotaryConfig, RotaryEncoder};
use layers::{
    activations::{ActivationKind, GateActivation, GPT_OSS_ALPHA, GPT_OSS_LIMIT},
    MoeConfig, QuantConfig,
};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Tokens kept at the front of a bounded global cache.
pub const GLOBAL_CACHE_KEEP: usize = 4;

/// Attention flavour of one decoder layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    SlidingAttention,
    FullAttention,
}

/// `eos_token_id` may be a single id or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::Single(id) => vec![*id],
            TokenIds::Many(ids) => ids.clone(),
        }
    }
}

/// Weight quantization block of a converted checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub group_size: usize,
    pub bits: u8,
}

impl From<QuantizationConfig> for QuantConfig {
    fn from(config: QuantizationConfig) -> Self {
        QuantConfig::new(config.group_size, config.bits)
    }
}

/// The subset of a model's `config.json` consumed by the execution core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    #[serde(default)]
    pub model_type: Option<String>,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_traditional: bool,
    #[serde(default)]
    pub rope_scaling: Option<RopeScalingConfig>,
    /// Fraction of each head rotated by the positional encoding.
    #[serde(default)]
    pub partial_rotary_factor: Option<f64>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub sliding_window: Option<usize>,
    /// Every `pattern`-th layer is global, the rest slide.
    #[serde(default)]
    pub sliding_window_pattern: Option<usize>,
    /// Explicit per-layer kinds; takes precedence over the pattern.
    #[serde(default)]
    pub layer_types: Option<Vec<LayerKind>>,
    #[serde(default, alias = "num_experts")]
    pub num_local_experts: Option<usize>,
    #[serde(default)]
    pub num_experts_per_tok: Option<usize>,
    #[serde(default)]
    pub moe_intermediate_size: Option<usize>,
    #[serde(default)]
    pub hidden_act: Option<String>,
    #[serde(default)]
    pub swiglu_limit: Option<f32>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub quantization: Option<QuantizationConfig>,
    /// Quantize the global-layer caches with this many bits.
    #[serde(default)]
    pub kv_bits: Option<u8>,
    #[serde(default = "default_kv_group_size")]
    pub kv_group_size: usize,
    /// Bound global-layer caches to this many tokens.
    #[serde(default)]
    pub max_kv_size: Option<usize>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_kv_group_size() -> usize {
    64
}

impl ArchitectureConfig {
    /// Parses and validates a `config.json` document.
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every structural constraint and reports all failures at once.
    pub fn validate(&self) -> Result<(), ModelError> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("hidden_size", self.hidden_size),
            ("num_hidden_layers", self.num_hidden_layers),
            ("num_attention_heads", self.num_attention_heads),
            ("intermediate_size", self.intermediate_size),
            ("vocab_size", self.vocab_size),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }

        let heads = self.num_attention_heads;
        let kv_heads = self.num_kv_heads();
        if kv_heads == 0 || (heads != 0 && heads % kv_heads != 0) {
            errors.push(format!(
                "num_attention_heads ({heads}) must be divisible by num_key_value_heads ({kv_heads})"
            ));
        }
        if self.head_dim.is_none() && heads != 0 && self.hidden_size % heads != 0 {
            errors.push(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({heads}) when head_dim is absent",
                self.hidden_size
            ));
        }

        if let Some(factor) = self.partial_rotary_factor {
            if !(factor > 0.0 && factor <= 1.0) {
                errors.push(format!("partial_rotary_factor must be in (0, 1], got {factor}"));
            }
        }
        if self.head_dim() > 0 {
            if let Err(err) = RotaryEncoder::new(&self.rotary_config()) {
                errors.push(err.to_string());
            }
        }

        if let Some(types) = &self.layer_types {
            if self.sliding_window_pattern.is_some() {
                log::warn!("sliding_window_pattern is ignored when layer_types is present");
            }
            if types.len() != self.num_hidden_layers {
                errors.push(format!(
                    "layer_types lists {} layers but num_hidden_layers is {}",
                    types.len(),
                    self.num_hidden_layers
                ));
            }
        }
        if self.sliding_window_pattern == Some(0) {
            errors.push("sliding_window_pattern must be greater than 0".to_string());
        }
        if self.sliding_window == Some(0) {
            errors.push("sliding_window must be greater than 0".to_string());
        }
        let slides = self.layer_kinds().contains(&LayerKind::SlidingAttention);
        if slides && self.sliding_window.is_none() {
            errors.push("sliding layers require sliding_window".to_string());
        }

        if let Some(max) = self.max_kv_size {
            if max <= GLOBAL_CACHE_KEEP {
                errors.push(format!("max_kv_size must exceed {GLOBAL_CACHE_KEEP}, got {max}"));
            }
        }
        if let Some(bits) = self.kv_bits {
            if let Err(err) = QuantConfig::new(self.kv_group_size, bits).validate() {
                errors.push(format!("kv cache quantization: {err}"));
            }
            if self.max_kv_size.is_some() {
                errors.push("kv_bits cannot be combined with max_kv_size".to_string());
            }
        }

        if let Some(name) = self.hidden_act.as_deref() {
            if ActivationKind::from_hidden_act(name).is_none() {
                errors.push(format!("unsupported hidden_act `{name}`"));
            }
        }

        if let Some(moe) = self.moe_config() {
            if let Err(err) = moe.validate() {
                errors.push(err.to_string());
            }
            if let Some(quant) = self.quantization {
                let quant = QuantConfig::from(quant);
                if let Err(err) = quant.validate() {
                    errors.push(format!("quantization: {err}"));
                } else if moe.hidden_size % quant.group_size != 0 || moe.intermediate_size % quant.group_size != 0 {
                    errors.push(format!(
                        "expert widths ({}, {}) must be multiples of quantization group_size {}",
                        moe.hidden_size, moe.intermediate_size, quant.group_size
                    ));
                }
            }
        } else if self.num_experts_per_tok.is_some() {
            errors.push("num_experts_per_tok requires num_local_experts".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Validation(errors))
        }
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or_else(|| self.hidden_size.checked_div(self.num_attention_heads).unwrap_or(0))
    }

    /// Leading features of each head that are rotated.
    pub fn rotary_dims(&self) -> usize {
        let head_dim = self.head_dim();
        match self.partial_rotary_factor {
            Some(factor) => (head_dim as f64 * factor) as usize,
            None => head_dim,
        }
    }

    pub fn rotary_config(&self) -> RotaryConfig {
        RotaryConfig {
            dims: self.rotary_dims(),
            base: self.rope_theta,
            traditional: self.rope_traditional,
            max_position_embeddings: self.max_position_embeddings,
            scaling: self.rope_scaling.clone(),
        }
    }

    /// Per-layer attention kind.
    ///
    /// `layer_types` wins when present. Otherwise a `sliding_window_pattern`
    /// of `p` makes every layer `i` with `i % p == p - 1` global; a bare
    /// `sliding_window` makes every layer slide.
    pub fn layer_kinds(&self) -> Vec<LayerKind> {
        if let Some(types) = &self.layer_types {
            return types.clone();
        }
        (0..self.num_hidden_layers)
            .map(|layer| match (self.sliding_window, self.sliding_window_pattern) {
                (Some(_), Some(pattern)) if pattern > 0 && layer % pattern != pattern - 1 => {
                    LayerKind::SlidingAttention
                }
                (Some(_), None) => LayerKind::SlidingAttention,
                _ => LayerKind::FullAttention,
            })
            .collect()
    }

    /// The first global layer; its cache supplies the full-attention mask.
    pub fn designated_global_layer(&self) -> Option<usize> {
        self.layer_kinds().iter().position(|kind| *kind == LayerKind::FullAttention)
    }

    /// The first sliding layer; its cache supplies the windowed mask.
    pub fn designated_sliding_layer(&self) -> Option<usize> {
        self.layer_kinds()
            .iter()
            .position(|kind| *kind == LayerKind::SlidingAttention)
    }

    /// Cache kind per layer.
    ///
    /// Sliding layers ring-buffer their window with no sink. Global layers
    /// grow without bound, ring-buffer `max_kv_size` tokens keeping the first
    /// [`GLOBAL_CACHE_KEEP`], or quantize when `kv_bits` is set.
    pub fn cache_kinds(&self) -> Vec<CacheKind> {
        let window = self.sliding_window.unwrap_or(0);
        self.layer_kinds()
            .into_iter()
            .map(|kind| match kind {
                LayerKind::SlidingAttention => CacheKind::Rotating {
                    max_size: window,
                    keep: 0,
                },
                LayerKind::FullAttention => match (self.kv_bits, self.max_kv_size) {
                    (Some(bits), _) => CacheKind::Quantized {
                        group_size: self.kv_group_size,
                        bits,
                    },
                    (None, Some(max_size)) => CacheKind::Rotating {
                        max_size,
                        keep: GLOBAL_CACHE_KEEP,
                    },
                    (None, None) => CacheKind::Growable,
                },
            })
            .collect()
    }

    /// Fresh caches for one generation session.
    pub fn make_caches(&self) -> Result<Vec<LayerCache>, ModelError> {
        Ok(make_layer_caches(&self.cache_kinds())?)
    }

    pub fn is_gpt_oss(&self) -> bool {
        self.model_type.as_deref() == Some("gpt_oss")
    }

    pub fn gate_activation(&self) -> GateActivation {
        if self.is_gpt_oss() {
            return GateActivation::GptOss {
                alpha: GPT_OSS_ALPHA,
                limit: self.swiglu_limit.unwrap_or(GPT_OSS_LIMIT),
            };
        }
        let kind = self
            .hidden_act
            .as_deref()
            .and_then(ActivationKind::from_hidden_act)
            .unwrap_or(ActivationKind::Silu);
        GateActivation::Standard(kind)
    }

    /// Sparse feed-forward shape, when the architecture routes experts.
    pub fn moe_config(&self) -> Option<MoeConfig> {
        let experts = self.num_local_experts?;
        let intermediate = self.moe_intermediate_size.unwrap_or(self.intermediate_size);
        let mut config = MoeConfig::new(
            self.hidden_size,
            intermediate,
            experts,
            self.num_experts_per_tok.unwrap_or(0),
        );
        config.bias = self.is_gpt_oss();
        config.activation = self.gate_activation();
        Some(config)
    }

    pub fn stop_tokens(&self) -> Vec<u32> {
        self.eos_token_id.as_ref().map(TokenIds::to_vec).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_json() -> serde_json::Value {
        serde_json::json!({
            "hidden_size": 64,
            "num_hidden_layers": 6,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "intermediate_size": 128,
            "vocab_size": 100
        })
    }

    fn parse(value: serde_json::Value) -> Result<ArchitectureConfig, ModelError> {
        ArchitectureConfig::from_json(&value.to_string())
    }

    #[test]
    fn minimal_config_uses_growable_caches() {
        let config = parse(base_json()).unwrap();
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.num_kv_heads(), 2);
        assert!(config.cache_kinds().iter().all(|k| *k == CacheKind::Growable));
        assert_eq!(config.designated_global_layer(), Some(0));
        assert_eq!(config.designated_sliding_layer(), None);
    }

    #[test]
    fn pattern_and_layer_types_agree() {
        let mut patterned = base_json();
        patterned["sliding_window"] = 8.into();
        patterned["sliding_window_pattern"] = 3.into();
        let patterned = parse(patterned).unwrap();

        let mut listed = base_json();
        listed["sliding_window"] = 8.into();
        listed["layer_types"] = serde_json::json!([
            "sliding_attention",
            "sliding_attention",
            "full_attention",
            "sliding_attention",
            "sliding_attention",
            "full_attention"
        ]);
        let listed = parse(listed).unwrap();

        assert_eq!(patterned.layer_kinds(), listed.layer_kinds());
        assert_eq!(patterned.designated_global_layer(), Some(2));
        assert_eq!(listed.designated_global_layer(), Some(2));
        assert_eq!(patterned.designated_sliding_layer(), Some(0));
        assert_eq!(
            patterned.cache_kinds()[..3],
            [
                CacheKind::Rotating { max_size: 8, keep: 0 },
                CacheKind::Rotating { max_size: 8, keep: 0 },
                CacheKind::Growable
            ]
        );
    }

    #[test]
    fn pattern_longer_than_depth_leaves_no_global_layer() {
        let mut value = base_json();
        value["sliding_window"] = 8.into();
        value["sliding_window_pattern"] = 10.into();
        assert_eq!(parse(value).unwrap().designated_global_layer(), None);
    }

    #[test]
    fn global_cache_options() {
        let mut bounded = base_json();
        bounded["max_kv_size"] = 32.into();
        let bounded = parse(bounded).unwrap();
        assert_eq!(
            bounded.cache_kinds()[0],
            CacheKind::Rotating {
                max_size: 32,
                keep: GLOBAL_CACHE_KEEP
            }
        );

        let mut quantized = base_json();
        quantized["kv_bits"] = 8.into();
        quantized["kv_group_size"] = 16.into();
        let quantized = parse(quantized).unwrap();
        assert_eq!(
            quantized.cache_kinds()[0],
            CacheKind::Quantized { group_size: 16, bits: 8 }
        );
        assert_eq!(quantized.make_caches().unwrap().len(), 6);
    }

    #[test]
    fn moe_fields_and_aliases() {
        let mut value = base_json();
        value["model_type"] = "gpt_oss".into();
        value["num_experts"] = 8.into();
        value["num_experts_per_tok"] = 2.into();
        value["moe_intermediate_size"] = 32.into();
        value["eos_token_id"] = serde_json::json!([1, 2]);
        let config = parse(value).unwrap();

        let moe = config.moe_config().unwrap();
        assert_eq!(moe.num_experts, 8);
        assert_eq!(moe.top_k, 2);
        assert_eq!(moe.intermediate_size, 32);
        assert!(moe.bias);
        assert_eq!(moe.activation, GateActivation::gpt_oss());
        assert_eq!(config.stop_tokens(), vec![1, 2]);
    }

    #[test]
    fn rope_scaling_is_forwarded() {
        let mut value = base_json();
        value["partial_rotary_factor"] = 0.5.into();
        value["rope_theta"] = 500_000.0.into();
        value["rope_scaling"] = serde_json::json!({
            "rope_type": "llama3",
            "factor": 8.0,
            "low_freq_factor": 1.0,
            "high_freq_factor": 4.0,
            "original_max_position_embeddings": 8192
        });
        let config = parse(value).unwrap();
        let rotary = config.rotary_config();
        assert_eq!(rotary.dims, 8);
        assert_eq!(rotary.base, 500_000.0);
        assert_eq!(rotary.scaling.as_ref().map(|s| s.variant_name()), Some("llama3"));
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut value = base_json();
        value["num_key_value_heads"] = 3.into();
        value["layer_types"] = serde_json::json!(["sliding_attention"]);
        value["kv_bits"] = 3.into();
        value["rope_scaling"] = serde_json::json!({ "type": "warp" });
        match parse(value) {
            Err(ModelError::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.contains("num_key_value_heads")));
                assert!(errors.iter().any(|e| e.contains("layer_types")));
                assert!(errors.iter().any(|e| e.contains("sliding_window")));
                assert!(errors.iter().any(|e| e.contains("kv cache quantization")));
                assert!(errors.iter().any(|e| e.contains("warp")));
            }
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    fn rope_errors(scaling: serde_json::Value) -> Vec<String> {
        let mut value = base_json();
        value["rope_scaling"] = scaling;
        match parse(value) {
            Err(ModelError::Validation(errors)) => errors,
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    #[test]
    fn rope_construction_failures_surface_in_validation() {
        let yarn = rope_errors(serde_json::json!({ "rope_type": "yarn", "beta_fast": 32.0 }));
        assert!(yarn.iter().any(|e| e.contains("yarn") && e.contains("requires `factor`")), "{yarn:?}");

        let llama3 = rope_errors(serde_json::json!({ "rope_type": "llama3", "low_freq_factor": 1.0 }));
        assert!(llama3.iter().any(|e| e.contains("llama3") && e.contains("requires `factor`")), "{llama3:?}");

        let longrope = rope_errors(serde_json::json!({ "rope_type": "longrope", "short_factor": [1.0, 1.0, 1.0, 1.0] }));
        assert!(longrope.iter().any(|e| e.contains("long_factor")), "{longrope:?}");

        let unknown = rope_errors(serde_json::json!({ "rope_type": "dynamic", "factor": 2.0 }));
        assert!(unknown.iter().any(|e| e.contains("unsupported rope variant `dynamic`")), "{unknown:?}");
    }

    #[test]
    fn malformed_json_is_a_format_error() {
        assert!(matches!(
            ArchitectureConfig::from_json("{\"hidden_size\": }"),
            Err(ModelError::Format(_))
        ));
    }
}
