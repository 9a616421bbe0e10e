//! Top-K expert gating.

use std::cmp::Ordering;

use candle_core::{DType, Device, Result, Tensor};

use crate::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    LayerError,
};

/// Per-call routing decision.
///
/// `weights` is `f32` `[tokens, top_k]` and sums to one per row; `indices` is
/// `u32` `[tokens, top_k]`, ordered by descending gate logit.
#[derive(Debug, Clone)]
pub struct ExpertAssignment {
    pub weights: Tensor,
    pub indices: Tensor,
}

impl ExpertAssignment {
    pub fn tokens(&self) -> usize {
        self.indices.dims().first().copied().unwrap_or(0)
    }

    pub fn top_k(&self) -> usize {
        self.indices.dims().get(1).copied().unwrap_or(0)
    }
}

/// Linear gate followed by top-K selection.
#[derive(Debug, Clone)]
pub struct TopKRouter {
    gate: Linear,
    num_experts: usize,
    top_k: usize,
}

impl TopKRouter {
    pub fn new(gate: Linear, top_k: usize) -> std::result::Result<Self, LayerError> {
        let num_experts = gate.config().output_dim;
        if top_k == 0 || top_k > num_experts {
            return Err(LayerError::InvalidConfig(format!(
                "router top_k {top_k} must be in 1..={num_experts}"
            )));
        }
        Ok(Self {
            gate,
            num_experts,
            top_k,
        })
    }

    pub fn with_init(
        hidden_size: usize,
        num_experts: usize,
        top_k: usize,
        bias: bool,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, LayerError> {
        let gate = Linear::with_init(
            LinearConfig::new(hidden_size, num_experts).with_bias(bias),
            init,
            device,
            dtype,
        )?;
        Self::new(gate, top_k)
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Routes `x` shaped `[.., hidden]`; leading dimensions are flattened into tokens.
    pub fn route(&self, x: &Tensor, policy: &PrecisionPolicy) -> Result<ExpertAssignment> {
        let hidden = self.gate.config().input_dim;
        let tokens = x.elem_count() / hidden.max(1);
        let device = x.device();
        if tokens == 0 {
            return Ok(ExpertAssignment {
                weights: Tensor::zeros((0, self.top_k), DType::F32, device)?,
                indices: Tensor::zeros((0, self.top_k), DType::U32, device)?,
            });
        }

        let logits = self
            .gate
            .forward(&x.reshape((tokens, hidden))?, policy)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let (weights, indices) = top_k_softmax(&logits, self.num_experts, self.top_k);
        Ok(ExpertAssignment {
            weights: Tensor::from_vec(weights, (tokens, self.top_k), device)?,
            indices: Tensor::from_vec(indices, (tokens, self.top_k), device)?,
        })
    }
}

/// Row-wise top-K over `logits` (`[rows, num_experts]` flattened) followed by
/// a softmax over the selected logits only.
///
/// Selection is partial (`select_nth_unstable_by`), so only the K winners are
/// ordered. Ties are broken by the lower expert id.
pub fn top_k_softmax(logits: &[f32], num_experts: usize, k: usize) -> (Vec<f32>, Vec<u32>) {
    let rows = if num_experts == 0 { 0 } else { logits.len() / num_experts };
    let k = k.min(num_experts);
    let mut weights = Vec::with_capacity(rows * k);
    let mut indices = Vec::with_capacity(rows * k);
    let mut candidates: Vec<u32> = Vec::with_capacity(num_experts);

    for row in logits.chunks(num_experts.max(1)).take(rows) {
        let by_logit = |a: &u32, b: &u32| -> Ordering {
            row[*b as usize]
                .total_cmp(&row[*a as usize])
                .then_with(|| a.cmp(b))
        };

        candidates.clear();
        candidates.extend(0..num_experts as u32);
        if k < num_experts {
            candidates.select_nth_unstable_by(k - 1, by_logit);
            candidates.truncate(k);
        }
        candidates.sort_unstable_by(by_logit);

        let max = row[candidates[0] as usize];
        let exps: Vec<f32> = candidates.iter().map(|&e| (row[e as usize] - max).exp()).collect();
        let total: f32 = exps.iter().sum();
        weights.extend(exps.iter().map(|v| v / total));
        indices.extend_from_slice(&candidates);
    }
    (weights, indices)
}
