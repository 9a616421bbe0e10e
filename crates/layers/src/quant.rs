//! Affine group-wise quantization.
//!
//! The trailing dimension is split into groups of `group_size` values. Each
//! group stores a `scale` and `bias` so a value is recovered as
//! `scale * code + bias`, where `code` is an unsigned `bits`-wide integer.
//! Codes are packed little-end first into `u32` words:
//! `32 / bits` codes per word.
//!
//! Matmuls against quantized operands never materialise the dequantized
//! matrix. For a group `g` the contribution to a dot product is
//! `scale_g * sum(x_i * code_i) + bias_g * sum(x_i)`.

use candle_core::{bail, DType, Device, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::checks;

/// Group size and bit width of an affine quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantConfig {
    pub group_size: usize,
    pub bits: u8,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            group_size: 64,
            bits: 4,
        }
    }
}

impl QuantConfig {
    pub fn new(group_size: usize, bits: u8) -> Self {
        Self { group_size, bits }
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.bits, 2 | 4 | 8) {
            bail!("quantization bits must be 2, 4 or 8, got {}", self.bits);
        }
        if self.group_size == 0 || self.group_size % self.values_per_word() != 0 {
            bail!(
                "group size {} must be a positive multiple of {}",
                self.group_size,
                self.values_per_word()
            );
        }
        Ok(())
    }

    /// Codes packed into each `u32` word.
    pub fn values_per_word(&self) -> usize {
        32 / self.bits as usize
    }

    fn max_code(&self) -> u32 {
        (1u32 << self.bits) - 1
    }

    fn mask(&self) -> u32 {
        self.max_code()
    }
}

/// Packed codes plus per-group scales and biases.
///
/// `codes` is `u32` shaped `[.., dim / values_per_word]`; `scales` and
/// `biases` are `f32` shaped `[.., dim / group_size]`. Leading dimensions are
/// shared by all three.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    codes: Tensor,
    scales: Tensor,
    biases: Tensor,
    config: QuantConfig,
    dim: usize,
}

impl QuantizedTensor {
    /// Wraps existing packed parameters, checking that the three tensors agree.
    pub fn from_parts(codes: Tensor, scales: Tensor, biases: Tensor, config: QuantConfig) -> Result<Self> {
        config.validate()?;
        if codes.dtype() != DType::U32 {
            bail!("quantized codes must be u32, got {:?}", codes.dtype());
        }
        let Some((&packed, leading)) = codes.dims().split_last() else {
            bail!("quantized codes must have rank >= 1");
        };
        let dim = packed * config.values_per_word();
        let mut group_dims = leading.to_vec();
        group_dims.push(dim / config.group_size);
        if scales.dims() != group_dims.as_slice() || biases.dims() != group_dims.as_slice() {
            bail!(
                "scales {:?} / biases {:?} do not match codes {:?} with group size {}",
                scales.dims(),
                biases.dims(),
                codes.dims(),
                config.group_size
            );
        }
        Ok(Self {
            codes,
            scales: scales.to_dtype(DType::F32)?,
            biases: biases.to_dtype(DType::F32)?,
            config,
            dim,
        })
    }

    pub fn codes(&self) -> &Tensor {
        &self.codes
    }

    pub fn scales(&self) -> &Tensor {
        &self.scales
    }

    pub fn biases(&self) -> &Tensor {
        &self.biases
    }

    pub fn config(&self) -> QuantConfig {
        self.config
    }

    /// Logical shape of the dequantized tensor.
    pub fn dims(&self) -> Vec<usize> {
        let mut dims = self.codes.dims().to_vec();
        if let Some(last) = dims.last_mut() {
            *last = self.dim;
        }
        dims
    }

    /// Narrows a leading (non-feature) axis of all three parts.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Self> {
        if axis + 1 >= self.codes.rank() {
            bail!("cannot narrow the packed feature axis of a quantized tensor");
        }
        Ok(Self {
            codes: self.codes.narrow(axis, start, len)?,
            scales: self.scales.narrow(axis, start, len)?,
            biases: self.biases.narrow(axis, start, len)?,
            config: self.config,
            dim: self.dim,
        })
    }

    /// Concatenates quantized tensors along a leading axis.
    pub fn cat(parts: &[&Self], axis: usize) -> Result<Self> {
        let Some(first) = parts.first() else {
            bail!("cannot concatenate an empty list of quantized tensors");
        };
        if parts.iter().any(|p| p.config != first.config || p.dim != first.dim) {
            bail!("quantized tensors must share group size, bits and feature dim");
        }
        let codes: Vec<&Tensor> = parts.iter().map(|p| &p.codes).collect();
        let scales: Vec<&Tensor> = parts.iter().map(|p| &p.scales).collect();
        let biases: Vec<&Tensor> = parts.iter().map(|p| &p.biases).collect();
        Ok(Self {
            codes: Tensor::cat(&codes, axis)?,
            scales: Tensor::cat(&scales, axis)?,
            biases: Tensor::cat(&biases, axis)?,
            config: first.config,
            dim: first.dim,
        })
    }

    pub fn device(&self) -> &Device {
        self.codes.device()
    }

    fn host(&self) -> Result<HostQuantized> {
        Ok(HostQuantized {
            codes: self.codes.flatten_all()?.to_vec1::<u32>()?,
            scales: self.scales.flatten_all()?.to_vec1::<f32>()?,
            biases: self.biases.flatten_all()?.to_vec1::<f32>()?,
            config: self.config,
            dim: self.dim,
        })
    }
}

/// Flattened host copy used by the CPU kernels below.
struct HostQuantized {
    codes: Vec<u32>,
    scales: Vec<f32>,
    biases: Vec<f32>,
    config: QuantConfig,
    dim: usize,
}

impl HostQuantized {
    fn rows(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.codes.len() * self.config.values_per_word() / self.dim
        }
    }

    #[inline]
    fn code(&self, row: usize, col: usize) -> u32 {
        let per_word = self.config.values_per_word();
        let words_per_row = self.dim / per_word;
        let word = self.codes[row * words_per_row + col / per_word];
        (word >> ((col % per_word) * self.config.bits as usize)) & self.config.mask()
    }

    /// `x . dequant(row)` computed from codes.
    fn dot(&self, row: usize, x: &[f32]) -> f32 {
        let group = self.config.group_size;
        let groups = self.dim / group;
        let mut out = 0.0f32;
        for g in 0..groups {
            let mut weighted = 0.0f32;
            let mut sum = 0.0f32;
            for col in g * group..(g + 1) * group {
                weighted += x[col] * self.code(row, col) as f32;
                sum += x[col];
            }
            out += self.scales[row * groups + g] * weighted + self.biases[row * groups + g] * sum;
        }
        out
    }

    fn dequantize_row(&self, row: usize, out: &mut [f32]) {
        let groups = self.dim / self.config.group_size;
        for (col, value) in out.iter_mut().enumerate() {
            let g = row * groups + col / self.config.group_size;
            *value = self.scales[g] * self.code(row, col) as f32 + self.biases[g];
        }
    }
}

/// Quantizes `x` along its trailing dimension.
pub fn quantize(x: &Tensor, config: QuantConfig) -> Result<QuantizedTensor> {
    config.validate()?;
    let Some((&dim, leading)) = x.dims().split_last() else {
        bail!("cannot quantize a scalar");
    };
    checks::expect_divisible("quantized trailing dim", dim, config.group_size)?;

    let values = x.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let per_word = config.values_per_word();
    let groups_per_row = dim / config.group_size;
    let rows = if dim == 0 { 0 } else { values.len() / dim };
    let max_code = config.max_code();

    let mut codes = vec![0u32; rows * dim / per_word];
    let mut scales = Vec::with_capacity(rows * groups_per_row);
    let mut biases = Vec::with_capacity(rows * groups_per_row);

    for (group_idx, group) in values.chunks(config.group_size).enumerate() {
        let (min, max) = group
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let scale = ((max - min) / max_code as f32).max(1e-7);
        scales.push(scale);
        biases.push(min);

        let base = group_idx * config.group_size;
        for (i, &v) in group.iter().enumerate() {
            let code = ((v - min) / scale).round().clamp(0.0, max_code as f32) as u32;
            let flat = base + i;
            codes[flat / per_word] |= code << ((flat % per_word) * config.bits as usize);
        }
    }

    let device = x.device();
    let mut code_dims = leading.to_vec();
    code_dims.push(dim / per_word);
    let mut group_dims = leading.to_vec();
    group_dims.push(groups_per_row);

    Ok(QuantizedTensor {
        codes: Tensor::from_vec(codes, code_dims, device)?,
        scales: Tensor::from_vec(scales, group_dims.clone(), device)?,
        biases: Tensor::from_vec(biases, group_dims, device)?,
        config,
        dim,
    })
}

/// Materialises the `f32` tensor described by `q`.
pub fn dequantize(q: &QuantizedTensor) -> Result<Tensor> {
    let host = q.host()?;
    let mut out = vec![0f32; host.rows() * host.dim];
    for (row, chunk) in out.chunks_mut(host.dim.max(1)).enumerate().take(host.rows()) {
        host.dequantize_row(row, chunk);
    }
    Tensor::from_vec(out, q.dims(), q.device())
}

/// Batched matmul against a quantized right-hand side.
///
/// `x` is `[.., M, K]`. With `transpose = true` the quantized operand is
/// `[.., N, K]` and the result is `x @ w^T`; otherwise it is `[.., K, N]` and
/// the result is `x @ w`. Leading dimensions must match exactly. The output is
/// `f32` shaped `[.., M, N]`.
pub fn quantized_matmul(x: &Tensor, w: &QuantizedTensor, transpose: bool) -> Result<Tensor> {
    let x_dims = x.dims().to_vec();
    let w_dims = w.dims();
    if x_dims.len() < 2 || x_dims.len() != w_dims.len() {
        bail!("quantized_matmul rank mismatch: x {:?}, w {:?}", x_dims, w_dims);
    }
    let rank = x_dims.len();
    if x_dims[..rank - 2] != w_dims[..rank - 2] {
        bail!("quantized_matmul batch mismatch: x {:?}, w {:?}", x_dims, w_dims);
    }
    let (m, k) = (x_dims[rank - 2], x_dims[rank - 1]);
    let (w_k, n) = if transpose {
        (w_dims[rank - 1], w_dims[rank - 2])
    } else {
        (w_dims[rank - 2], w_dims[rank - 1])
    };
    if k != w_k {
        bail!("quantized_matmul inner dim mismatch: x {:?}, w {:?} (transpose={})", x_dims, w_dims, transpose);
    }
    let batch: usize = x_dims[..rank - 2].iter().product();

    let xs = x.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let host = w.host()?;
    let mut out = vec![0f32; batch * m * n];

    if transpose {
        for b in 0..batch {
            for row in 0..m {
                let x_row = &xs[(b * m + row) * k..(b * m + row + 1) * k];
                for col in 0..n {
                    out[(b * m + row) * n + col] = host.dot(b * n + col, x_row);
                }
            }
        }
    } else {
        let mut w_row = vec![0f32; n];
        for b in 0..batch {
            for inner in 0..k {
                host.dequantize_row(b * k + inner, &mut w_row);
                for row in 0..m {
                    let coeff = xs[(b * m + row) * k + inner];
                    if coeff == 0.0 {
                        continue;
                    }
                    let dst = &mut out[(b * m + row) * n..(b * m + row + 1) * n];
                    for (d, w) in dst.iter_mut().zip(&w_row) {
                        *d += coeff * w;
                    }
                }
            }
        }
    }

    let mut out_dims = x_dims[..rank - 2].to_vec();
    out_dims.extend([m, n]);
    Tensor::from_vec(out, out_dims, x.device())
}

/// Fused gather + quantized matmul for expert layers.
///
/// `x` is `[R, K]`, `w` is `[E, N, K]`, and row `r` is multiplied by expert
/// `experts[r]`. Returns `f32` `[R, N]`.
pub fn gather_qmm(x: &Tensor, w: &QuantizedTensor, experts: &[u32]) -> Result<Tensor> {
    let (rows, k) = x.dims2()?;
    let w_dims = w.dims();
    let [num_experts, n, w_k] = w_dims.as_slice() else {
        bail!("gather_qmm expects expert weights [E, N, K], got {:?}", w_dims);
    };
    if *w_k != k || experts.len() != rows {
        bail!(
            "gather_qmm mismatch: x [{rows}, {k}], w {:?}, {} expert ids",
            w_dims,
            experts.len()
        );
    }
    if let Some(bad) = experts.iter().find(|&&e| e as usize >= *num_experts) {
        bail!("expert id {bad} out of range for {num_experts} experts");
    }

    let xs = x.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let host = w.host()?;
    let mut out = vec![0f32; rows * n];
    for (r, &expert) in experts.iter().enumerate() {
        let x_row = &xs[r * k..(r + 1) * k];
        for col in 0..*n {
            out[r * n + col] = host.dot(expert as usize * n + col, x_row);
        }
    }
    Tensor::from_vec(out, (rows, *n), x.device())
}
