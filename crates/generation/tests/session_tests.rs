use std::cell::Cell;

use anyhow::Result;
use attention::{CacheKind, KeyValueCache, LayerCache};
use candle_core::{DType, Device, Tensor};
use generation::{generate, GenerationConfig, GenerationError, GenerationSession, LanguageModel, Phase, StopReason};

/// Two-layer stand-in whose next token depends only on the cache offset.
struct ScriptedModel {
    vocab: usize,
    next: fn(usize) -> u32,
    forwards: Cell<usize>,
}

impl ScriptedModel {
    fn new(next: fn(usize) -> u32) -> Self {
        Self {
            vocab: 16,
            next,
            forwards: Cell::new(0),
        }
    }
}

impl LanguageModel for ScriptedModel {
    type Error = candle_core::Error;

    fn new_caches(&self) -> candle_core::Result<Vec<LayerCache>> {
        attention::kv_cache::make_layer_caches(&[CacheKind::Growable, CacheKind::Rotating { max_size: 8, keep: 0 }])
            .map_err(|err| candle_core::Error::Msg(err.to_string()))
    }

    fn forward(&self, tokens: &[u32], caches: &mut [LayerCache]) -> candle_core::Result<Tensor> {
        self.forwards.set(self.forwards.get() + 1);
        let kv = Tensor::zeros((1, 1, tokens.len(), 4), DType::F32, &Device::Cpu)?;
        for cache in caches.iter_mut() {
            cache
                .update(&kv, &kv)
                .map_err(|err| candle_core::Error::Msg(err.to_string()))?;
        }
        let mut logits = vec![0f32; self.vocab];
        logits[(self.next)(caches[0].offset()) as usize % self.vocab] = 10.0;
        Tensor::from_vec(logits, self.vocab, &Device::Cpu)
    }
}

fn counting(offset: usize) -> u32 {
    offset as u32
}

#[test]
fn prompt_is_one_batched_forward() -> Result<()> {
    let model = ScriptedModel::new(counting);
    let mut session = GenerationSession::new(&model, &[1, 2, 3], &GenerationConfig::greedy())?;
    assert_eq!(session.phase(), Phase::Prompt);

    assert_eq!(session.next_token()?, Some(3));
    assert_eq!(session.phase(), Phase::Decode);
    assert_eq!(model.forwards.get(), 1);
    assert!(session.caches().iter().all(|c| c.offset() == 3));

    assert_eq!(session.next_token()?, Some(4));
    assert_eq!(model.forwards.get(), 2);
    assert!(session.caches().iter().all(|c| c.offset() == 4));
    assert_eq!(session.history(), &[1, 2, 3, 3, 4]);
    Ok(())
}

#[test]
fn max_tokens_bounds_the_output() -> Result<()> {
    let model = ScriptedModel::new(counting);
    let config = GenerationConfig {
        max_tokens: 5,
        ..GenerationConfig::greedy()
    };
    let output = generate(&model, &[0, 1], &config, |_| true)?;
    assert_eq!(output.tokens, vec![2, 3, 4, 5, 6]);
    assert_eq!(output.report.token_count, 5);
    assert_eq!(output.report.prompt_tokens, 2);
    assert_eq!(output.report.stop_reason, StopReason::MaxTokens);
    // The final token is emitted without being fed back.
    assert_eq!(model.forwards.get(), 5);
    Ok(())
}

#[test]
fn stop_token_ends_without_being_emitted() -> Result<()> {
    let model = ScriptedModel::new(|offset| if offset >= 5 { 0 } else { offset as u32 });
    let config = GenerationConfig::greedy().with_stop_tokens([0]);
    let mut seen = Vec::new();
    let output = generate(&model, &[9, 9], &config, |token| {
        seen.push(token);
        true
    })?;
    assert_eq!(output.tokens, vec![2, 3, 4]);
    assert_eq!(seen, output.tokens);
    assert_eq!(output.report.token_count, 3);
    assert_eq!(output.report.stop_reason, StopReason::StopToken);
    Ok(())
}

#[test]
fn callback_returning_false_stops_immediately() -> Result<()> {
    let model = ScriptedModel::new(counting);
    let mut calls = 0;
    let output = generate(&model, &[1, 1, 1], &GenerationConfig::greedy(), |_| {
        calls += 1;
        calls < 2
    })?;
    assert_eq!(calls, 2);
    assert_eq!(output.tokens.len(), 2);
    assert_eq!(output.report.token_count, 2);
    assert_eq!(output.report.stop_reason, StopReason::Cancelled);
    assert_eq!(model.forwards.get(), 2);
    Ok(())
}

#[test]
fn terminal_sessions_stay_terminal() -> Result<()> {
    let model = ScriptedModel::new(counting);
    let mut session = GenerationSession::new(&model, &[4], &GenerationConfig::greedy())?;
    session.next_token()?;
    session.cancel();
    assert_eq!(session.phase(), Phase::Terminal(StopReason::Cancelled));
    assert_eq!(session.next_token()?, None);
    assert_eq!(model.forwards.get(), 1);
    assert_eq!(session.report().map(|r| r.token_count), Some(1));
    Ok(())
}

#[test]
fn zero_budget_never_runs_the_model() -> Result<()> {
    let model = ScriptedModel::new(counting);
    let config = GenerationConfig {
        max_tokens: 0,
        ..Default::default()
    };
    let output = generate(&model, &[1, 2], &config, |_| true)?;
    assert!(output.tokens.is_empty());
    assert_eq!(output.report.stop_reason, StopReason::MaxTokens);
    assert_eq!(model.forwards.get(), 0);
    Ok(())
}

#[test]
fn empty_prompt_and_bad_config_are_rejected() {
    let model = ScriptedModel::new(counting);
    assert!(matches!(
        generate(&model, &[], &GenerationConfig::default(), |_| true),
        Err(GenerationError::EmptyPrompt)
    ));
    let config = GenerationConfig {
        top_p: 1.5,
        ..Default::default()
    };
    assert!(matches!(
        generate(&model, &[1], &config, |_| true),
        Err(GenerationError::InvalidConfig(_))
    ));
}

#[test]
fn seeded_sampling_is_reproducible_across_sessions() -> Result<()> {
    let model = ScriptedModel::new(counting);
    let config = GenerationConfig {
        max_tokens: 12,
        temperature: 1.5,
        top_p: 1.0,
        ..Default::default()
    }
    .with_seed(42);
    let first = generate(&model, &[3, 1], &config, |_| true)?;
    let second = generate(&model, &[3, 1], &config, |_| true)?;
    assert_eq!(first.tokens, second.tokens);
    assert!(first.tokens.iter().all(|&t| (t as usize) < 16));
    Ok(())
}
