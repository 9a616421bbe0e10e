use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

/// Sampling and stopping parameters for one prompt/response cycle.
///
/// Defaults: 256 tokens, temperature 0.7, top-p 0.9.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Hard cap on emitted tokens.
    pub max_tokens: usize,
    /// `0.0` selects greedy arg-max decoding.
    pub temperature: f32,
    /// Nucleus mass; `1.0` disables the filter.
    pub top_p: f32,
    pub top_k: Option<usize>,
    /// Relative probability floor; `0.0` disables the filter.
    pub min_p: f32,
    pub repetition_penalty: Option<f32>,
    /// How many of the most recent tokens the repetition penalty looks at.
    pub repetition_context_size: usize,
    pub seed: Option<u64>,
    /// Tokens that end generation without being emitted.
    pub stop_tokens: Vec<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            top_k: None,
            min_p: 0.0,
            repetition_penalty: None,
            repetition_context_size: 20,
            seed: None,
            stop_tokens: Vec::new(),
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding with the default budget.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_stop_tokens(mut self, tokens: impl IntoIterator<Item = u32>) -> Self {
        self.stop_tokens.extend(tokens);
        self
    }

    pub fn validate(&self) -> Result<(), GenerationError> {
        let mut errors = Vec::new();

        if !(self.temperature >= 0.0 && self.temperature.is_finite()) {
            errors.push(format!("temperature must be finite and >= 0, got {}", self.temperature));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            errors.push(format!("top_p must be in (0, 1], got {}", self.top_p));
        }
        if self.top_k == Some(0) {
            errors.push("top_k must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.min_p) {
            errors.push(format!("min_p must be in [0, 1), got {}", self.min_p));
        }
        if let Some(penalty) = self.repetition_penalty {
            if !(penalty > 0.0 && penalty.is_finite()) {
                errors.push(format!("repetition_penalty must be positive, got {penalty}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GenerationError::InvalidConfig(errors.join("; ")))
        }
    }
}
