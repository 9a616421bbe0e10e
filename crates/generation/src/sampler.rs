//! Token selection from next-token logits.
//!
//! With a positive temperature the logits pass through, in order: repetition
//! penalty, temperature scaling, top-k, softmax, top-p, min-p, then a
//! categorical draw from the renormalised survivors. A temperature of zero
//! bypasses every filter and returns the arg-max.

use std::cmp::Ordering;

use candle_core::{DType, Result, Tensor};

use crate::config::GenerationConfig;

/// Stateful sampler; the only state is the random generator.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    top_k: Option<usize>,
    top_p: f32,
    min_p: f32,
    repetition_penalty: Option<f32>,
    repetition_context_size: usize,
    rng: fastrand::Rng,
}

impl Sampler {
    pub fn new(config: &GenerationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            min_p: config.min_p,
            repetition_penalty: config.repetition_penalty,
            repetition_context_size: config.repetition_context_size,
            rng,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Samples from `logits` (any shape with `vocab` elements) given the
    /// token `history` so far.
    pub fn sample(&mut self, logits: &Tensor, history: &[u32]) -> Result<u32> {
        let logits = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        if logits.is_empty() {
            candle_core::bail!("cannot sample from empty logits");
        }
        Ok(self.sample_slice(&logits, history))
    }

    pub fn sample_slice(&mut self, logits: &[f32], history: &[u32]) -> u32 {
        if self.is_greedy() {
            return argmax(logits);
        }

        let mut adjusted = logits.to_vec();
        if let Some(penalty) = self.repetition_penalty {
            let start = history.len().saturating_sub(self.repetition_context_size);
            apply_repetition_penalty(&mut adjusted, &history[start..], penalty);
        }

        let inv_temp = 1.0 / self.temperature;
        adjusted.iter_mut().for_each(|logit| *logit *= inv_temp);

        if let Some(k) = self.top_k {
            top_k_filter(&mut adjusted, k);
        }

        let mut probs = softmax(&adjusted);
        if self.top_p < 1.0 {
            top_p_filter(&mut probs, self.top_p);
        }
        if self.min_p > 0.0 {
            min_p_filter(&mut probs, self.min_p);
        }
        self.categorical(&probs)
    }

    fn categorical(&mut self, probs: &[f32]) -> u32 {
        let total: f32 = probs.iter().sum();
        if !(total > 0.0) {
            return argmax(probs);
        }
        let target = self.rng.f32() * total;
        let mut cumulative = 0.0;
        let mut last_live = 0;
        for (idx, &p) in probs.iter().enumerate() {
            if p <= 0.0 {
                continue;
            }
            cumulative += p;
            last_live = idx;
            if target < cumulative {
                return idx as u32;
            }
        }
        last_live as u32
    }
}

/// First index of the largest value.
pub fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |best, (idx, &v)| if v > best.1 { (idx, v) } else { best })
        .0 as u32
}

/// Down-weights tokens in `recent`: negative logits are multiplied by
/// `penalty`, the rest divided by it.
pub fn apply_repetition_penalty(logits: &mut [f32], recent: &[u32], penalty: f32) {
    for &token in recent {
        if let Some(logit) = logits.get_mut(token as usize) {
            *logit = if *logit < 0.0 { *logit * penalty } else { *logit / penalty };
        }
    }
}

/// Keeps the `k` highest logits, masking the rest to `-inf`.
pub fn top_k_filter(logits: &mut [f32], k: usize) {
    let k = k.max(1);
    if k >= logits.len() {
        return;
    }
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.select_nth_unstable_by(k - 1, |&a, &b| descending(logits[a], logits[b]));
    for &idx in &order[k..] {
        logits[idx] = f32::NEG_INFINITY;
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Keeps the smallest probability-sorted prefix whose mass exceeds `p`
/// (always at least the top token) and renormalises.
pub fn top_p_filter(probs: &mut [f32], p: f32) {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| descending(probs[a], probs[b]));

    let mut cumulative = 0.0;
    let mut keep = order.len();
    for (rank, &idx) in order.iter().enumerate() {
        cumulative += probs[idx];
        if cumulative > p {
            keep = rank + 1;
            break;
        }
    }
    for &idx in &order[keep..] {
        probs[idx] = 0.0;
    }
    renormalize(probs);
}

/// Drops tokens below `min_p * max(probs)` and renormalises.
pub fn min_p_filter(probs: &mut [f32], min_p: f32) {
    let max = probs.iter().copied().fold(0.0f32, f32::max);
    let floor = min_p * max;
    for p in probs.iter_mut() {
        if *p < floor {
            *p = 0.0;
        }
    }
    renormalize(probs);
}

fn renormalize(probs: &mut [f32]) {
    let total: f32 = probs.iter().sum();
    if total > 0.0 {
        probs.iter_mut().for_each(|p| *p /= total);
    }
}

fn descending(a: f32, b: f32) -> Ordering {
    b.total_cmp(&a)
}
