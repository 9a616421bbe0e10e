//! Per-expert projections and the sparse MoE feed-forward block.
//!
//! Expert weights are stacked as `[num_experts, out, in]`. Checkpoints name
//! them `experts.{gate,up,down}_proj` with an optional bias, either dense
//! (`.weight`), affine-quantized (`.weight` as packed `u32` plus `.scales` and
//! `.biases`) or MXFP4-packed (`_blocks` plus `_scales`).

use std::collections::HashMap;

use candle_core::{bail, DType, Device, Result, Tensor};

use super::{
    dispatch::RoutedRows,
    router::{ExpertAssignment, TopKRouter},
    MoeConfig,
};
use crate::{
    activations::GateActivation,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    mlp::FeedForwardLayer,
    mxfp4::unpack_mxfp4,
    quant::{gather_qmm, QuantConfig, QuantizedTensor},
    LayerError,
};

/// Runs of equal consecutive expert ids as `(start, len, expert)`.
fn expert_runs(experts: &[u32]) -> Vec<(usize, usize, u32)> {
    let mut runs = Vec::new();
    let mut start = 0;
    for end in 1..=experts.len() {
        if end == experts.len() || experts[end] != experts[start] {
            runs.push((start, end - start, experts[start]));
            start = end;
        }
    }
    runs
}

fn check_experts(experts: &[u32], num_experts: usize, rows: usize) -> Result<()> {
    if experts.len() != rows {
        bail!("{} expert ids for {} rows", experts.len(), rows);
    }
    if let Some(bad) = experts.iter().find(|&&e| e as usize >= num_experts) {
        bail!("expert id {bad} out of range for {num_experts} experts");
    }
    Ok(())
}

/// Dense stacked expert projection.
#[derive(Debug, Clone)]
pub struct SwitchLinear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl SwitchLinear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (experts, out_dim, _) = weight.dims3()?;
        if let Some(bias) = &bias {
            if bias.dims() != [experts, out_dim] {
                bail!("switch bias {:?} does not match weight {:?}", bias.dims(), weight.dims());
            }
        }
        Ok(Self { weight, bias })
    }

    pub fn with_init(
        num_experts: usize,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let config = LinearConfig::new(input_dim, output_dim);
        let mut weights = Vec::with_capacity(num_experts);
        for _ in 0..num_experts {
            weights.push(Linear::with_init(config.clone(), init, device, dtype)?.weight().clone());
        }
        let bias = if bias {
            Some(Tensor::zeros((num_experts, output_dim), dtype, device)?)
        } else {
            None
        };
        Self::new(Tensor::stack(&weights, 0)?, bias)
    }

    pub fn num_experts(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn output_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn input_dim(&self) -> usize {
        self.weight.dims()[2]
    }

    /// Multiplies each row of `rows` (`[R, in]`) by its expert's weight.
    ///
    /// Consecutive rows sharing an expert are multiplied as one block, so
    /// sorted dispatch issues one matmul per active expert.
    pub fn forward(&self, rows: &Tensor, experts: &[u32], policy: &PrecisionPolicy) -> Result<Tensor> {
        let (count, _) = rows.dims2()?;
        check_experts(experts, self.num_experts(), count)?;
        if count == 0 {
            return Tensor::zeros((0, self.output_dim()), policy.compute(), rows.device());
        }

        let rows = policy.cast_for_matmul(rows)?;
        let mut blocks = Vec::new();
        for (start, len, expert) in expert_runs(experts) {
            let weight = policy.cast_for_matmul(&self.weight.get(expert as usize)?)?;
            let mut out = rows.narrow(0, start, len)?.matmul(&weight.t()?)?;
            if let Some(bias) = &self.bias {
                out = out.broadcast_add(&policy.cast_for_matmul(&bias.get(expert as usize)?)?)?;
            }
            blocks.push(out);
        }
        Tensor::cat(&blocks, 0)
    }
}

/// Affine-quantized stacked expert projection.
#[derive(Debug, Clone)]
pub struct QuantizedSwitchLinear {
    weight: QuantizedTensor,
    bias: Option<Tensor>,
}

impl QuantizedSwitchLinear {
    pub fn new(weight: QuantizedTensor, bias: Option<Tensor>) -> Result<Self> {
        let dims = weight.dims();
        if dims.len() != 3 {
            bail!("quantized switch weight must be [E, out, in], got {:?}", dims);
        }
        if let Some(bias) = &bias {
            if bias.dims() != [dims[0], dims[1]] {
                bail!("switch bias {:?} does not match weight {:?}", bias.dims(), dims);
            }
        }
        Ok(Self { weight, bias })
    }

    /// Quantizes a dense stacked projection.
    pub fn from_dense(linear: &SwitchLinear, config: QuantConfig) -> Result<Self> {
        let weight = crate::quant::quantize(&linear.weight, config)?;
        Self::new(weight, linear.bias.clone())
    }

    pub fn num_experts(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn output_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn forward(&self, rows: &Tensor, experts: &[u32]) -> Result<Tensor> {
        let (count, _) = rows.dims2()?;
        check_experts(experts, self.num_experts(), count)?;
        if count == 0 {
            return Tensor::zeros((0, self.output_dim()), DType::F32, rows.device());
        }
        let out = gather_qmm(rows, &self.weight, experts)?;
        match &self.bias {
            Some(bias) => {
                let ids = Tensor::from_vec(experts.to_vec(), count, rows.device())?;
                out.add(&bias.to_dtype(DType::F32)?.index_select(&ids, 0)?)
            }
            None => Ok(out),
        }
    }
}

/// Expert projection storage, resolved once at load time.
#[derive(Debug, Clone)]
pub enum ExpertProjection {
    Dense(SwitchLinear),
    Quantized(QuantizedSwitchLinear),
}

impl ExpertProjection {
    pub fn num_experts(&self) -> usize {
        match self {
            Self::Dense(linear) => linear.num_experts(),
            Self::Quantized(linear) => linear.num_experts(),
        }
    }

    pub fn output_dim(&self) -> usize {
        match self {
            Self::Dense(linear) => linear.output_dim(),
            Self::Quantized(linear) => linear.output_dim(),
        }
    }

    pub fn forward(&self, rows: &Tensor, experts: &[u32], policy: &PrecisionPolicy) -> Result<Tensor> {
        match self {
            Self::Dense(linear) => linear.forward(rows, experts, policy),
            Self::Quantized(linear) => linear.forward(rows, experts),
        }
    }

    /// Loads `{key}` from a weight map.
    pub fn from_weights(
        weights: &HashMap<String, Tensor>,
        key: &str,
        quant: Option<QuantConfig>,
    ) -> std::result::Result<Self, LayerError> {
        let bias = weights
            .get(&format!("{key}.bias"))
            .or_else(|| weights.get(&format!("{key}_bias")))
            .cloned();

        if let (Some(blocks), Some(scales)) = (
            weights.get(&format!("{key}_blocks")),
            weights.get(&format!("{key}_scales")),
        ) {
            log::debug!("{key}: unpacking mxfp4 experts");
            let weight = unpack_mxfp4(blocks, scales)?;
            return Ok(Self::Dense(SwitchLinear::new(weight, bias)?));
        }

        let weight_key = format!("{key}.weight");
        let weight = weights
            .get(&weight_key)
            .ok_or_else(|| LayerError::MissingWeight(weight_key.clone()))?;
        if weight.dtype() != DType::U32 {
            return Ok(Self::Dense(SwitchLinear::new(weight.clone(), bias)?));
        }

        let config = quant.ok_or_else(|| {
            LayerError::InvalidConfig(format!("{weight_key} is packed but no quantization config was given"))
        })?;
        let fetch = |suffix: &str| -> std::result::Result<Tensor, LayerError> {
            let name = format!("{key}.{suffix}");
            weights.get(&name).cloned().ok_or(LayerError::MissingWeight(name))
        };
        let packed = QuantizedTensor::from_parts(weight.clone(), fetch("scales")?, fetch("biases")?, config)?;
        Ok(Self::Quantized(QuantizedSwitchLinear::new(packed, bias)?))
    }
}

/// Batched GLU expert body: `down(act(gate(x)) * up(x))` per selected expert.
#[derive(Debug, Clone)]
pub struct SwitchGlu {
    gate_proj: ExpertProjection,
    up_proj: ExpertProjection,
    down_proj: ExpertProjection,
    activation: GateActivation,
}

impl SwitchGlu {
    pub fn new(
        gate_proj: ExpertProjection,
        up_proj: ExpertProjection,
        down_proj: ExpertProjection,
        activation: GateActivation,
    ) -> std::result::Result<Self, LayerError> {
        let experts = gate_proj.num_experts();
        if up_proj.num_experts() != experts || down_proj.num_experts() != experts {
            return Err(LayerError::InvalidConfig(
                "gate/up/down projections disagree on expert count".into(),
            ));
        }
        if up_proj.output_dim() != gate_proj.output_dim() {
            return Err(LayerError::InvalidConfig(
                "gate and up projections disagree on intermediate size".into(),
            ));
        }
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            activation,
        })
    }

    pub fn with_init(
        config: &MoeConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, LayerError> {
        config.validate()?;
        let expand = || {
            SwitchLinear::with_init(
                config.num_experts,
                config.hidden_size,
                config.intermediate_size,
                config.bias,
                init,
                device,
                dtype,
            )
        };
        let gate = expand()?;
        let up = expand()?;
        let down = SwitchLinear::with_init(
            config.num_experts,
            config.intermediate_size,
            config.hidden_size,
            config.bias,
            init,
            device,
            dtype,
        )?;
        Self::new(
            ExpertProjection::Dense(gate),
            ExpertProjection::Dense(up),
            ExpertProjection::Dense(down),
            config.activation,
        )
    }

    /// Loads `{prefix}experts.{gate,up,down}_proj`.
    pub fn from_weights(
        weights: &HashMap<String, Tensor>,
        prefix: &str,
        activation: GateActivation,
        quant: Option<QuantConfig>,
    ) -> std::result::Result<Self, LayerError> {
        let load = |name: &str| ExpertProjection::from_weights(weights, &format!("{prefix}experts.{name}_proj"), quant);
        Self::new(load("gate")?, load("up")?, load("down")?, activation)
    }

    /// Quantizes every dense projection in place of its float weights.
    pub fn quantized(&self, config: QuantConfig) -> Result<Self> {
        let convert = |proj: &ExpertProjection| -> Result<ExpertProjection> {
            Ok(match proj {
                ExpertProjection::Dense(linear) => {
                    ExpertProjection::Quantized(QuantizedSwitchLinear::from_dense(linear, config)?)
                }
                other => other.clone(),
            })
        };
        Ok(Self {
            gate_proj: convert(&self.gate_proj)?,
            up_proj: convert(&self.up_proj)?,
            down_proj: convert(&self.down_proj)?,
            activation: self.activation,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.gate_proj.num_experts()
    }

    /// Applies the selected experts to every token.
    ///
    /// `x` is `[tokens, hidden]` and `indices` is `[tokens, top_k]`; the result
    /// is `[tokens, top_k, hidden]` in the storage dtype.
    pub fn forward(&self, x: &Tensor, indices: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (tokens, hidden) = x.dims2()?;
        let (index_rows, top_k) = indices.dims2()?;
        if index_rows != tokens {
            bail!("{} tokens but {} rows of expert indices", tokens, index_rows);
        }
        let out_dim = self.down_proj.output_dim();
        if tokens * top_k == 0 {
            return Tensor::zeros((tokens, top_k, out_dim), policy.storage(), x.device());
        }

        let ids = indices.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
        check_experts(&ids, self.num_experts(), tokens * top_k)?;
        let routed = RoutedRows::plan(x, &ids, top_k)?;
        log::debug!(
            "moe dispatch: tokens={} top_k={} hidden={} sorted={}",
            tokens,
            top_k,
            hidden,
            routed.is_sorted()
        );

        let gate = self.gate_proj.forward(&routed.rows, &routed.experts, policy)?;
        let up = self.up_proj.forward(&routed.rows, &routed.experts, policy)?;
        let activated = self.activation.apply(&gate, &up, &PrecisionPolicy::new(DType::F32, DType::F32))?;
        let out = self.down_proj.forward(&activated, &routed.experts, policy)?;
        let out = routed.restore(&out)?.reshape((tokens, top_k, out_dim))?;
        policy.cast_to_storage(&out)
    }
}

/// Router plus switch experts, combined with the gate weights.
#[derive(Debug, Clone)]
pub struct SparseMoeBlock {
    router: TopKRouter,
    experts: SwitchGlu,
}

impl SparseMoeBlock {
    pub fn new(router: TopKRouter, experts: SwitchGlu) -> std::result::Result<Self, LayerError> {
        if router.num_experts() != experts.num_experts() {
            return Err(LayerError::InvalidConfig(format!(
                "router scores {} experts but {} are loaded",
                router.num_experts(),
                experts.num_experts()
            )));
        }
        Ok(Self { router, experts })
    }

    pub fn with_init(
        config: &MoeConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, LayerError> {
        let router = TopKRouter::with_init(
            config.hidden_size,
            config.num_experts,
            config.top_k,
            config.bias,
            init,
            device,
            dtype,
        )?;
        Self::new(router, SwitchGlu::with_init(config, init, device, dtype)?)
    }

    /// Loads the router (`router` or `gate`) and experts under `prefix`.
    pub fn from_weights(
        weights: &HashMap<String, Tensor>,
        prefix: &str,
        config: &MoeConfig,
        quant: Option<QuantConfig>,
    ) -> std::result::Result<Self, LayerError> {
        config.validate()?;
        let router_key = ["router", "gate"]
            .iter()
            .map(|name| format!("{prefix}{name}"))
            .find(|key| weights.contains_key(&format!("{key}.weight")))
            .ok_or_else(|| LayerError::MissingWeight(format!("{prefix}router.weight")))?;
        let weight = weights[&format!("{router_key}.weight")].clone();
        let bias = weights.get(&format!("{router_key}.bias")).cloned();
        let gate = Linear::new(
            LinearConfig::new(config.hidden_size, config.num_experts).with_bias(bias.is_some()),
            weight,
            bias,
        )?;
        let router = TopKRouter::new(gate, config.top_k)?;
        let experts = SwitchGlu::from_weights(weights, prefix, config.activation, quant)?;
        Self::new(router, experts)
    }

    pub fn router(&self) -> &TopKRouter {
        &self.router
    }

    pub fn experts(&self) -> &SwitchGlu {
        &self.experts
    }

    /// Forward pass that also returns the routing decision.
    pub fn forward_with_assignment(
        &self,
        hidden: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<(Tensor, ExpertAssignment)> {
        let dims = hidden.dims().to_vec();
        let hidden_size = dims.last().copied().unwrap_or(0);
        let tokens = hidden.elem_count() / hidden_size.max(1);
        let flat = hidden.reshape((tokens, hidden_size))?;

        let assignment = self.router.route(&flat, policy)?;
        if tokens == 0 {
            return Ok((hidden.zeros_like()?, assignment));
        }
        let expert_out = self
            .experts
            .forward(&flat, &assignment.indices, policy)?
            .to_dtype(DType::F32)?;
        let combined = expert_out
            .broadcast_mul(&assignment.weights.unsqueeze(2)?)?
            .sum(1)?
            .reshape(dims)?;
        Ok((policy.cast_to_storage(&combined)?, assignment))
    }
}

impl FeedForwardLayer for SparseMoeBlock {
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        Ok(self.forward_with_assignment(hidden, policy)?.0)
    }
}
