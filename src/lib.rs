//! On-device transformer inference core.
//!
//! The member crates are re-exported under their own names; this crate adds
//! backend selection and the command-line front end.

pub use attention;
pub use embedding;
pub use generation;
pub use layers;
pub use model;

use anyhow::Result;
use candle_core::Device;

/// Picks the best available backend, honouring `CANDLE_FORCE_CPU`.
pub fn setup_device() -> Result<Device> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }
    #[cfg(feature = "metal")]
    {
        use std::panic::AssertUnwindSafe;

        let metal_device = std::panic::catch_unwind(AssertUnwindSafe(|| Device::new_metal(0)));
        if let Ok(Ok(device)) = metal_device {
            if metal_preflight(&device).is_ok() {
                log::info!("Metal device selected: {:?}", device);
                return Ok(device);
            }
            log::warn!("Metal device detected but preflight failed, falling back");
        } else {
            log::info!("Metal unavailable, falling back");
        }
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("CUDA device selected: {:?}", device);
            Ok(device)
        }
        _ => {
            log::info!("using CPU backend");
            Ok(Device::Cpu)
        }
    }
}

/// Exercises the kernels a decode step relies on before trusting the device.
#[cfg(feature = "metal")]
fn metal_preflight(device: &Device) -> Result<()> {
    use candle_core::{DType, Tensor};

    let q = Tensor::randn(0.0f32, 1.0f32, (1, 4, 8, 16), device)?;
    let scores = q.matmul(&q.transpose(2, 3)?.contiguous()?)?;
    let _ = candle_nn::ops::softmax_last_dim(&scores)?;

    let ids = Tensor::from_vec((0..32u32).collect::<Vec<_>>(), 32, &Device::Cpu)?.to_device(device)?;
    let table = Tensor::randn(0.0f32, 1.0f32, (32, 64), device)?;
    let _ = table.index_select(&ids.to_dtype(DType::U32)?, 0)?;
    Ok(())
}
