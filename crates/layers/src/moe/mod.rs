//! Mixture-of-experts routing and batched sparse expert computation.
//!
//! A forward pass through [`SparseMoeBlock`] runs in three stages:
//!
//! 1. [`TopKRouter::route`] scores every token against every expert, keeps the
//!    top-K experts per token via partial selection and softmaxes only the
//!    selected logits.
//! 2. [`dispatch::RoutedRows::plan`] replicates each token once per selected
//!    expert. Above [`dispatch::SORT_THRESHOLD`] tokens the rows are
//!    stably sorted by expert id so each expert sees one contiguous slice.
//! 3. [`SwitchGlu`] applies `down(act(gate(x)) * up(x))` with per-expert
//!    weights, the rows are restored to token order and combined with the
//!    gate weights.

pub mod dispatch;
pub mod router;
pub mod switch;

use crate::{activations::GateActivation, LayerError};

pub use router::{top_k_softmax, ExpertAssignment, TopKRouter};
pub use switch::{ExpertProjection, QuantizedSwitchLinear, SparseMoeBlock, SwitchGlu, SwitchLinear};

/// Shape of a sparse MoE feed-forward block.
#[derive(Debug, Clone, PartialEq)]
pub struct MoeConfig {
    pub hidden_size: usize,
    /// Per-expert intermediate width.
    pub intermediate_size: usize,
    pub num_experts: usize,
    /// Experts selected per token.
    pub top_k: usize,
    /// Whether the router and expert projections carry biases (GPT-OSS does).
    pub bias: bool,
    pub activation: GateActivation,
}

impl MoeConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize, num_experts: usize, top_k: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            num_experts,
            top_k,
            bias: false,
            activation: GateActivation::default(),
        }
    }

    pub fn validate(&self) -> Result<(), LayerError> {
        if self.num_experts == 0 {
            return Err(LayerError::InvalidConfig("num_experts must be positive".into()));
        }
        if self.top_k == 0 || self.top_k > self.num_experts {
            return Err(LayerError::InvalidConfig(format!(
                "top_k {} must be in 1..={}",
                self.top_k, self.num_experts
            )));
        }
        if self.hidden_size == 0 || self.intermediate_size == 0 {
            return Err(LayerError::InvalidConfig("hidden/intermediate sizes must be positive".into()));
        }
        Ok(())
    }
}
