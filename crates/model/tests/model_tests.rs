use anyhow::Result;
use attention::{kv_cache::make_layer_caches, CacheKind, KeyValueCache, LayerCache};
use candle_core::{DType, Device, Tensor};
use generation::{generate, GenerationConfig, LanguageModel, StopReason};
use model::{ArchitectureConfig, Model};
use static_assertions::assert_impl_all;

assert_impl_all!(Model: Send, Sync);

fn tiny(extra: serde_json::Value) -> Result<ArchitectureConfig> {
    let mut value = serde_json::json!({
        "hidden_size": 32,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "intermediate_size": 64,
        "vocab_size": 48
    });
    if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
        base.extend(extra.clone());
    }
    Ok(ArchitectureConfig::from_json(&value.to_string())?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let diff = a.sub(b)?.abs()?.flatten_all()?.to_vec1::<f32>()?;
    Ok(diff.into_iter().fold(0.0, f32::max))
}

/// Logits after feeding `tokens` in one step versus a prefill of
/// `split` tokens followed by single-token decodes.
fn batched_vs_incremental(model: &Model, tokens: &[u32], split: usize) -> Result<f32> {
    let mut batched = model.new_caches()?;
    let full = model.forward(tokens, &mut batched)?;

    let mut stepped = model.new_caches()?;
    let mut logits = model.forward(&tokens[..split], &mut stepped)?;
    for &token in &tokens[split..] {
        logits = model.forward(&[token], &mut stepped)?;
    }
    max_abs_diff(&full, &logits)
}

#[test]
fn forward_returns_last_position_logits() -> Result<()> {
    let model = Model::with_init(tiny(serde_json::json!({}))?, &Device::Cpu, DType::F32)?;
    let mut caches = model.new_caches()?;
    let logits = model.forward(&[1, 2, 3, 4, 5], &mut caches)?;

    assert_eq!(logits.dims(), &[48]);
    assert_eq!(logits.dtype(), DType::F32);
    assert!(caches.iter().all(|cache| cache.offset() == 5));
    Ok(())
}

#[test]
fn decoding_matches_a_single_prefill() -> Result<()> {
    let model = Model::with_init(tiny(serde_json::json!({}))?, &Device::Cpu, DType::F32)?;
    let diff = batched_vs_incremental(&model, &[3, 7, 11, 2, 9, 40], 2)?;
    assert!(diff < 1e-4, "max diff {diff}");
    Ok(())
}

#[test]
fn sliding_layers_match_across_the_window_edge() -> Result<()> {
    let config = tiny(serde_json::json!({
        "num_hidden_layers": 4,
        "sliding_window": 4,
        "sliding_window_pattern": 2
    }))?;
    assert_eq!(
        config.cache_kinds(),
        vec![
            CacheKind::Rotating { max_size: 4, keep: 0 },
            CacheKind::Growable,
            CacheKind::Rotating { max_size: 4, keep: 0 },
            CacheKind::Growable
        ]
    );
    let model = Model::with_init(config, &Device::Cpu, DType::F32)?;
    let diff = batched_vs_incremental(&model, &[5, 1, 9, 14, 2, 30, 8], 3)?;
    assert!(diff < 1e-4, "max diff {diff}");
    Ok(())
}

#[test]
fn moe_layers_route_every_step() -> Result<()> {
    let config = tiny(serde_json::json!({
        "num_local_experts": 4,
        "num_experts_per_tok": 2,
        "moe_intermediate_size": 32
    }))?;
    let model = Model::with_init(config, &Device::Cpu, DType::F32)?;
    assert!(model.blocks().iter().all(|block| block.feed_forward().is_sparse()));

    let diff = batched_vs_incremental(&model, &[4, 8, 15, 16, 23, 42], 4)?;
    assert!(diff < 1e-4, "max diff {diff}");
    Ok(())
}

#[test]
fn quantized_experts_produce_finite_logits() -> Result<()> {
    let config = tiny(serde_json::json!({
        "model_type": "gpt_oss",
        "num_local_experts": 4,
        "num_experts_per_tok": 2,
        "quantization": { "group_size": 32, "bits": 4 }
    }))?;
    let model = Model::with_init(config, &Device::Cpu, DType::F32)?;
    let mut caches = model.new_caches()?;
    let logits = model.forward(&[0, 1, 2], &mut caches)?.to_vec1::<f32>()?;
    assert_eq!(logits.len(), 48);
    assert!(logits.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn quantized_kv_cache_tracks_the_dense_cache() -> Result<()> {
    let config = tiny(serde_json::json!({ "kv_bits": 8, "kv_group_size": 8 }))?;
    let model = Model::with_init(config, &Device::Cpu, DType::F32)?;

    let mut quantized = model.new_caches()?;
    assert!(matches!(quantized[0], LayerCache::Quantized(_)));
    let mut dense = make_layer_caches(&[CacheKind::Growable, CacheKind::Growable])?;

    model.forward(&[10, 20, 30], &mut quantized)?;
    model.forward(&[10, 20, 30], &mut dense)?;
    let q_logits = model.forward(&[40], &mut quantized)?;
    let d_logits = model.forward(&[40], &mut dense)?;

    let diff = max_abs_diff(&q_logits, &d_logits)?;
    assert!(diff < 5e-2, "max diff {diff}");
    Ok(())
}

#[test]
fn wrong_cache_count_is_rejected() -> Result<()> {
    let model = Model::with_init(tiny(serde_json::json!({}))?, &Device::Cpu, DType::F32)?;
    let mut caches = make_layer_caches(&[CacheKind::Growable])?;
    assert!(model.forward(&[1], &mut caches).is_err());
    Ok(())
}

#[test]
fn greedy_generation_is_reproducible_and_honours_eos() -> Result<()> {
    let model = Model::with_init(
        tiny(serde_json::json!({ "eos_token_id": 47, "sliding_window": 4, "sliding_window_pattern": 2 }))?,
        &Device::Cpu,
        DType::F32,
    )?;
    let config = GenerationConfig {
        max_tokens: 12,
        ..GenerationConfig::greedy()
    }
    .with_stop_tokens(model.config().stop_tokens());

    let first = generate(&model, &[1, 2, 3], &config, |_| true)?;
    let second = generate(&model, &[1, 2, 3], &config, |_| true)?;
    assert_eq!(first.tokens, second.tokens);
    assert!(!first.tokens.contains(&47));
    match first.report.stop_reason {
        StopReason::MaxTokens => assert_eq!(first.tokens.len(), 12),
        StopReason::StopToken => assert!(first.tokens.len() < 12),
        StopReason::Cancelled => panic!("nothing cancelled this run"),
    }
    Ok(())
}
