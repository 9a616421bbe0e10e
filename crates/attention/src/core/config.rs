//! Configuration shared by the cache engine and the attention kernels.

use super::errors::CacheError;

/// Default growth step, in tokens, of growable and rotating buffers.
pub const DEFAULT_STEP: usize = 256;

/// Storage strategy of one layer's cache, resolved once at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Unbounded buffer growing in fixed steps.
    Growable,
    /// Sliding window of `max_size` tokens whose first `keep` tokens are never
    /// evicted.
    Rotating { max_size: usize, keep: usize },
    /// Growable buffer holding affine-quantized keys and values.
    Quantized { group_size: usize, bits: u8 },
}

impl CacheKind {
    pub fn validate(&self) -> Result<(), CacheError> {
        match *self {
            CacheKind::Growable => Ok(()),
            CacheKind::Rotating { max_size, keep } => {
                if max_size == 0 {
                    return Err(CacheError::InvalidConfig(
                        "rotating cache max_size must be positive".to_string(),
                    ));
                }
                if keep >= max_size {
                    return Err(CacheError::InvalidConfig(format!(
                        "rotating cache keep ({keep}) must be smaller than max_size ({max_size})"
                    )));
                }
                Ok(())
            }
            CacheKind::Quantized { group_size, bits } => {
                layers::QuantConfig::new(group_size, bits)
                    .validate()
                    .map_err(|e| CacheError::InvalidConfig(e.to_string()))
            }
        }
    }
}

/// Run-time knobs of the attention kernels.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    /// Score scale; defaults to `1 / sqrt(head_dim)`.
    pub scale: Option<f32>,
}

impl Config {
    pub fn with_scale(scale: f32) -> Self {
        Self { scale: Some(scale) }
    }

    pub fn scale_for(&self, head_dim: usize) -> f32 {
        self.scale.unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotating_keep_must_leave_room() {
        assert!(CacheKind::Rotating { max_size: 8, keep: 2 }.validate().is_ok());
        assert!(matches!(
            CacheKind::Rotating { max_size: 4, keep: 4 }.validate(),
            Err(CacheError::InvalidConfig(_))
        ));
        assert!(CacheKind::Rotating { max_size: 0, keep: 0 }.validate().is_err());
    }

    #[test]
    fn quantized_bits_are_checked() {
        assert!(CacheKind::Quantized { group_size: 64, bits: 8 }.validate().is_ok());
        assert!(CacheKind::Quantized { group_size: 64, bits: 3 }.validate().is_err());
    }

    #[test]
    fn default_scale_is_inverse_sqrt_head_dim() {
        assert_eq!(Config::default().scale_for(64), 0.125);
        assert_eq!(Config::with_scale(0.5).scale_for(64), 0.5);
    }
}
