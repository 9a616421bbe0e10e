use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Why a session reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A configured stop token was sampled.
    StopToken,
    /// The `max_tokens` budget was used up.
    MaxTokens,
    /// The token callback asked to stop.
    Cancelled,
}

/// Summary of a finished generation, serialised with camelCase keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReport {
    pub token_count: usize,
    pub prompt_tokens: usize,
    pub tokens_per_second: f64,
    pub prompt_tokens_per_second: f64,
    pub stop_reason: StopReason,
}

impl GenerationReport {
    pub(crate) fn new(
        prompt_tokens: usize,
        prompt_time: Duration,
        token_count: usize,
        decode_time: Duration,
        stop_reason: StopReason,
    ) -> Self {
        Self {
            token_count,
            prompt_tokens,
            tokens_per_second: rate(token_count, decode_time),
            prompt_tokens_per_second: rate(prompt_tokens, prompt_time),
            stop_reason,
        }
    }
}

fn rate(tokens: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if tokens == 0 || secs <= 0.0 {
        0.0
    } else {
        tokens as f64 / secs
    }
}
