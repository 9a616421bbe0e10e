//! Frequency tables for the rotary context-extension variants.
//!
//! Every builder produces *inverse* frequencies (`theta_i = base^(-2i/dims)`
//! before scaling), one per rotated dimension pair. Tables are computed in
//! `f64` once at construction and never mutated afterwards.
//!
//! Configuration follows the Hugging Face `rope_scaling` object. Both `type`
//! and `rope_type` select the variant; the remaining keys are interpreted per
//! variant and missing required keys surface as
//! [`RopeError::MissingParameter`].

use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::RopeError;

/// Raw `rope_scaling` block as found in architecture configuration files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RopeScalingConfig {
    #[serde(default, rename = "type", alias = "rope_type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub factor: Option<f64>,
    #[serde(default)]
    pub low_freq_factor: Option<f64>,
    #[serde(default)]
    pub high_freq_factor: Option<f64>,
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub beta_fast: Option<f64>,
    #[serde(default)]
    pub beta_slow: Option<f64>,
    #[serde(default)]
    pub mscale: Option<f64>,
    #[serde(default)]
    pub mscale_all_dim: Option<f64>,
    #[serde(default)]
    pub short_factor: Option<Vec<f64>>,
    #[serde(default)]
    pub long_factor: Option<Vec<f64>>,
}

impl RopeScalingConfig {
    /// Variant name, defaulting to `"default"` when neither key is present.
    pub fn variant_name(&self) -> &str {
        self.kind.as_deref().unwrap_or("default")
    }
}

/// Closed set of rotary variants, resolved once from the configuration string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeVariant {
    Default,
    Linear,
    Llama3,
    Yarn,
    LongRope,
    MRope,
}

impl RopeVariant {
    /// Parses the `type`/`rope_type` string.
    pub fn parse(name: &str) -> Result<Self, RopeError> {
        match name {
            "default" => Ok(Self::Default),
            "linear" => Ok(Self::Linear),
            "llama3" => Ok(Self::Llama3),
            "yarn" => Ok(Self::Yarn),
            "longrope" | "su" => Ok(Self::LongRope),
            "mrope" => Ok(Self::MRope),
            other => Err(RopeError::UnsupportedVariant(other.to_string())),
        }
    }
}

impl fmt::Display for RopeVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::Linear => "linear",
            Self::Llama3 => "llama3",
            Self::Yarn => "yarn",
            Self::LongRope => "longrope",
            Self::MRope => "mrope",
        };
        f.write_str(name)
    }
}

/// Precomputed, immutable rotary frequency state.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyTable {
    /// Inverse frequencies used for short contexts (or always, for single-table variants).
    pub inv_freq: Vec<f64>,
    /// Long-context table; `Some` only for longrope.
    pub long_inv_freq: Option<Vec<f64>>,
    /// Context length above which the long table applies.
    pub original_max_position_embeddings: Option<usize>,
    /// Multiplier applied to positions before computing angles.
    pub position_scale: f64,
    /// Magnitude rescale applied to the rotated activations.
    pub mscale: f64,
}

impl FrequencyTable {
    fn plain(inv_freq: Vec<f64>) -> Self {
        Self {
            inv_freq,
            long_inv_freq: None,
            original_max_position_embeddings: None,
            position_scale: 1.0,
            mscale: 1.0,
        }
    }

    /// Selects the table covering positions `[0, end)`.
    pub fn select(&self, end: usize) -> &[f64] {
        match (&self.long_inv_freq, self.original_max_position_embeddings) {
            (Some(long), Some(original)) if end > original => long,
            _ => &self.inv_freq,
        }
    }
}

/// Unscaled inverse frequencies `base^(-2i/dims)`.
pub fn base_inv_freq(dims: usize, base: f64) -> Vec<f64> {
    (0..dims / 2)
        .map(|idx| base.powf(-((2 * idx) as f64) / dims as f64))
        .collect()
}

/// Builds the frequency table for `variant`.
pub fn build_table(
    variant: RopeVariant,
    dims: usize,
    base: f64,
    max_position_embeddings: usize,
    scaling: &RopeScalingConfig,
) -> Result<FrequencyTable, RopeError> {
    let inv_freq = base_inv_freq(dims, base);
    match variant {
        RopeVariant::Default | RopeVariant::MRope => Ok(FrequencyTable::plain(inv_freq)),
        RopeVariant::Linear => {
            let factor = require(scaling.factor, variant, "factor")?;
            let mut table = FrequencyTable::plain(inv_freq);
            table.position_scale = 1.0 / factor;
            Ok(table)
        }
        RopeVariant::Llama3 => llama3_table(inv_freq, scaling),
        RopeVariant::Yarn => yarn_table(inv_freq, dims, base, scaling),
        RopeVariant::LongRope => longrope_table(inv_freq, max_position_embeddings, scaling),
    }
}

fn require<T: Copy>(value: Option<T>, variant: RopeVariant, key: &'static str) -> Result<T, RopeError> {
    value.ok_or(RopeError::MissingParameter {
        variant: variant.to_string(),
        key,
    })
}

fn llama3_table(inv_freq: Vec<f64>, scaling: &RopeScalingConfig) -> Result<FrequencyTable, RopeError> {
    let factor = require(scaling.factor, RopeVariant::Llama3, "factor")?;
    let low_freq_factor = scaling.low_freq_factor.unwrap_or(1.0);
    let high_freq_factor = scaling.high_freq_factor.unwrap_or(4.0);
    let original = scaling.original_max_position_embeddings.unwrap_or(8192) as f64;

    let low_freq_wavelen = original / low_freq_factor;
    let high_freq_wavelen = original / high_freq_factor;

    let scaled = inv_freq
        .into_iter()
        .map(|inv| {
            let wavelen = 2.0 * PI / inv;
            if wavelen > low_freq_wavelen {
                inv / factor
            } else if wavelen > high_freq_wavelen && wavelen < low_freq_wavelen {
                // Only reachable when high_freq_factor > low_freq_factor.
                let smooth = (original / wavelen - low_freq_factor) / (high_freq_factor - low_freq_factor);
                inv * ((1.0 - smooth) / factor + smooth)
            } else {
                inv
            }
        })
        .collect();
    Ok(FrequencyTable::plain(scaled))
}

/// Dimension index at which a wavelength completes `rotations` turns over the
/// original context.
pub fn yarn_correction_dim(rotations: f64, dims: usize, base: f64, original: f64) -> f64 {
    dims as f64 * (original / (rotations * 2.0 * PI)).ln() / (2.0 * base.ln())
}

fn yarn_mscale(scale: f64, mscale: f64) -> f64 {
    if scale <= 1.0 {
        1.0
    } else {
        0.1 * mscale * scale.ln() + 1.0
    }
}

fn yarn_table(
    inv_freq: Vec<f64>,
    dims: usize,
    base: f64,
    scaling: &RopeScalingConfig,
) -> Result<FrequencyTable, RopeError> {
    let factor = require(scaling.factor, RopeVariant::Yarn, "factor")?;
    let original = scaling.original_max_position_embeddings.unwrap_or(4096) as f64;
    let beta_fast = scaling.beta_fast.unwrap_or(32.0);
    let beta_slow = scaling.beta_slow.unwrap_or(1.0);
    let mscale = scaling.mscale.unwrap_or(1.0);
    let mscale_all_dim = scaling.mscale_all_dim.unwrap_or(0.0);

    let low = yarn_correction_dim(beta_fast, dims, base, original).floor().max(0.0);
    let mut high = yarn_correction_dim(beta_slow, dims, base, original)
        .ceil()
        .min((dims - 1) as f64);
    if low == high {
        high += 0.001;
    }

    let blended = inv_freq
        .into_iter()
        .enumerate()
        .map(|(idx, extrapolated)| {
            let ramp = ((idx as f64 - low) / (high - low)).clamp(0.0, 1.0);
            let interpolated = extrapolated / factor;
            interpolated * ramp + extrapolated * (1.0 - ramp)
        })
        .collect();

    let mut table = FrequencyTable::plain(blended);
    table.mscale = yarn_mscale(factor, mscale) / yarn_mscale(factor, mscale_all_dim);
    Ok(table)
}

fn longrope_table(
    inv_freq: Vec<f64>,
    max_position_embeddings: usize,
    scaling: &RopeScalingConfig,
) -> Result<FrequencyTable, RopeError> {
    let variant = RopeVariant::LongRope;
    let short = scaling
        .short_factor
        .as_ref()
        .ok_or(RopeError::MissingParameter {
            variant: variant.to_string(),
            key: "short_factor",
        })?;
    let long = scaling
        .long_factor
        .as_ref()
        .ok_or(RopeError::MissingParameter {
            variant: variant.to_string(),
            key: "long_factor",
        })?;
    let original = require(
        scaling.original_max_position_embeddings,
        variant,
        "original_max_position_embeddings",
    )?;
    for (key, factors) in [("short_factor", short), ("long_factor", long)] {
        if factors.len() != inv_freq.len() {
            return Err(RopeError::InvalidConfig(format!(
                "{key} has {} entries, expected {}",
                factors.len(),
                inv_freq.len()
            )));
        }
    }

    let divide = |factors: &[f64]| -> Vec<f64> {
        inv_freq
            .iter()
            .zip(factors)
            .map(|(inv, factor)| inv / factor)
            .collect()
    };

    let extension = max_position_embeddings as f64 / original as f64;
    let mscale = if extension <= 1.0 {
        1.0
    } else {
        (1.0 + extension.ln() / (original as f64).ln()).sqrt()
    };

    Ok(FrequencyTable {
        inv_freq: divide(short),
        long_inv_freq: Some(divide(long)),
        original_max_position_embeddings: Some(original),
        position_scale: 1.0,
        mscale,
    })
}
