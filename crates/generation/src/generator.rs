//! The prompt/decode state machine.
//!
//! `Prompt` runs one batched forward over the whole prompt, `Decode` feeds
//! back the previously emitted token, and `Terminal` is reached on a stop
//! token, the token budget or cancellation. Step N+1 always sees the cache
//! mutation of step N; nothing here is shared across sessions.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use attention::LayerCache;
use candle_core::Tensor;

use crate::{
    config::GenerationConfig,
    error::GenerationError,
    report::{GenerationReport, StopReason},
    sampler::Sampler,
};

/// The model collaborator driven by a session.
pub trait LanguageModel {
    type Error: std::error::Error + Send + Sync + 'static;

    /// One empty cache per layer.
    fn new_caches(&self) -> Result<Vec<LayerCache>, Self::Error>;

    /// Runs `tokens` at the caches' current offset, appending their keys and
    /// values, and returns next-token logits for the last position.
    fn forward(&self, tokens: &[u32], caches: &mut [LayerCache]) -> Result<Tensor, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prompt,
    Decode,
    Terminal(StopReason),
}

/// One prompt/response cycle: token history, sampler and per-layer caches.
pub struct GenerationSession<'m, M: LanguageModel> {
    model: &'m M,
    caches: Vec<LayerCache>,
    sampler: Sampler,
    stop_tokens: HashSet<u32>,
    max_tokens: usize,
    history: Vec<u32>,
    prompt_len: usize,
    emitted: usize,
    phase: Phase,
    prompt_time: Duration,
    decode_start: Option<Instant>,
    decode_time: Duration,
}

impl<'m, M: LanguageModel> GenerationSession<'m, M> {
    pub fn new(model: &'m M, prompt: &[u32], config: &GenerationConfig) -> Result<Self, GenerationError> {
        config.validate()?;
        if prompt.is_empty() {
            return Err(GenerationError::EmptyPrompt);
        }
        let caches = model.new_caches().map_err(GenerationError::model)?;
        Ok(Self {
            model,
            caches,
            sampler: Sampler::new(config),
            stop_tokens: config.stop_tokens.iter().copied().collect(),
            max_tokens: config.max_tokens,
            history: prompt.to_vec(),
            prompt_len: prompt.len(),
            emitted: 0,
            phase: Phase::Prompt,
            prompt_time: Duration::ZERO,
            decode_start: None,
            decode_time: Duration::ZERO,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Prompt followed by every emitted token.
    pub fn history(&self) -> &[u32] {
        &self.history
    }

    pub fn generated(&self) -> &[u32] {
        &self.history[self.prompt_len..]
    }

    pub fn caches(&self) -> &[LayerCache] {
        &self.caches
    }

    /// Stops the session; no further token is produced or counted.
    pub fn cancel(&mut self) {
        if !matches!(self.phase, Phase::Terminal(_)) {
            self.finish(StopReason::Cancelled);
        }
    }

    /// Advances to the next emitted token, or `None` once terminal.
    ///
    /// A failed forward pass leaves the session terminal.
    pub fn next_token(&mut self) -> Result<Option<u32>, GenerationError> {
        let logits = match self.phase {
            Phase::Terminal(_) => return Ok(None),
            Phase::Prompt => {
                if self.max_tokens == 0 {
                    self.finish(StopReason::MaxTokens);
                    return Ok(None);
                }
                let start = Instant::now();
                let prompt = self.history.clone();
                let logits = self.forward(&prompt)?;
                self.prompt_time = start.elapsed();
                log::debug!(
                    "prefill: {} tokens in {:.1} ms",
                    self.prompt_len,
                    self.prompt_time.as_secs_f64() * 1e3
                );
                self.decode_start = Some(Instant::now());
                self.phase = Phase::Decode;
                logits
            }
            Phase::Decode => {
                let last = self.history[self.history.len() - 1];
                self.forward(&[last])?
            }
        };

        let token = match self.sampler.sample(&logits, &self.history) {
            Ok(token) => token,
            Err(err) => {
                self.finish(StopReason::Cancelled);
                return Err(err.into());
            }
        };
        if self.stop_tokens.contains(&token) {
            self.finish(StopReason::StopToken);
            return Ok(None);
        }
        self.history.push(token);
        self.emitted += 1;
        if self.emitted >= self.max_tokens {
            self.finish(StopReason::MaxTokens);
        }
        Ok(Some(token))
    }

    /// Timing and stop summary, available once terminal.
    pub fn report(&self) -> Option<GenerationReport> {
        match self.phase {
            Phase::Terminal(reason) => Some(GenerationReport::new(
                self.prompt_len,
                self.prompt_time,
                self.emitted,
                self.decode_time,
                reason,
            )),
            _ => None,
        }
    }

    /// Ends the session, cancelling it if still running.
    pub fn into_output(mut self) -> GenerationOutput {
        self.cancel();
        let reason = match self.phase {
            Phase::Terminal(reason) => reason,
            _ => StopReason::Cancelled,
        };
        GenerationOutput {
            tokens: self.generated().to_vec(),
            report: GenerationReport::new(self.prompt_len, self.prompt_time, self.emitted, self.decode_time, reason),
        }
    }

    fn forward(&mut self, tokens: &[u32]) -> Result<Tensor, GenerationError> {
        match self.model.forward(tokens, &mut self.caches) {
            Ok(logits) => Ok(logits),
            Err(err) => {
                self.finish(StopReason::Cancelled);
                Err(GenerationError::model(err))
            }
        }
    }

    fn finish(&mut self, reason: StopReason) {
        if let Some(start) = self.decode_start.take() {
            self.decode_time = start.elapsed();
        }
        log::debug!("generation stopped after {} tokens: {:?}", self.emitted, reason);
        self.phase = Phase::Terminal(reason);
    }
}

/// Tokens emitted by [`generate`] plus the run's report.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub tokens: Vec<u32>,
    pub report: GenerationReport,
}

/// Runs a full session, handing every emitted token to `on_token`.
///
/// Returning `false` from the callback stops generation immediately; the
/// token it was given is the last one emitted and counted.
pub fn generate<M, F>(
    model: &M,
    prompt: &[u32],
    config: &GenerationConfig,
    mut on_token: F,
) -> Result<GenerationOutput, GenerationError>
where
    M: LanguageModel,
    F: FnMut(u32) -> bool,
{
    let mut session = GenerationSession::new(model, prompt, config)?;
    while let Some(token) = session.next_token()? {
        if !on_token(token) {
            session.cancel();
            break;
        }
    }

    let output = session.into_output();
    let report = &output.report;
    log::info!(
        "generated {} tokens ({:.1} tok/s, prompt {:.1} tok/s), stop: {:?}",
        report.token_count,
        report.tokens_per_second,
        report.prompt_tokens_per_second,
        report.stop_reason
    );
    Ok(output)
}
