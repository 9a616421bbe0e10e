//! MXFP4 expert weight unpacking.
//!
//! Packed checkpoints store expert projections as `*_blocks` (`u8`, two FP4
//! E2M1 codes per byte, low nibble first) and `*_scales` (`u8`, one shared
//! power-of-two exponent per block, biased by 127). A block of 16 bytes
//! decodes to 32 values.

use candle_core::{bail, DType, Result, Tensor};

/// FP4 E2M1 code to value table.
pub const FP4_VALUES: [f32; 16] = [
    0.0, 0.5, 1.0, 1.5, 2.0, 3.0, 4.0, 6.0, -0.0, -0.5, -1.0, -1.5, -2.0, -3.0, -4.0, -6.0,
];

const SCALE_BIAS: i32 = 127;

/// Decodes `blocks` `[.., G, B]` and `scales` `[.., G]` into `f32` `[.., G * B * 2]`.
pub fn unpack_mxfp4(blocks: &Tensor, scales: &Tensor) -> Result<Tensor> {
    if blocks.dtype() != DType::U8 || scales.dtype() != DType::U8 {
        bail!(
            "mxfp4 blocks/scales must be u8, got {:?}/{:?}",
            blocks.dtype(),
            scales.dtype()
        );
    }
    let Some((&bytes_per_block, block_dims)) = blocks.dims().split_last() else {
        bail!("mxfp4 blocks must have rank >= 2");
    };
    if block_dims != scales.dims() || block_dims.is_empty() {
        bail!(
            "mxfp4 scales {:?} do not match blocks {:?}",
            scales.dims(),
            blocks.dims()
        );
    }
    if bytes_per_block == 0 {
        bail!("mxfp4 blocks {:?} hold no bytes per block", blocks.dims());
    }

    let codes = blocks.flatten_all()?.to_vec1::<u8>()?;
    let exponents = scales.flatten_all()?.to_vec1::<u8>()?;
    let mut out = Vec::with_capacity(codes.len() * 2);
    for (block, &exponent) in codes.chunks(bytes_per_block).zip(&exponents) {
        let scale = 2f32.powi(i32::from(exponent) - SCALE_BIAS);
        for &byte in block {
            out.push(FP4_VALUES[(byte & 0x0f) as usize] * scale);
            out.push(FP4_VALUES[(byte >> 4) as usize] * scale);
        }
    }

    let mut dims = block_dims[..block_dims.len() - 1].to_vec();
    dims.push(block_dims[block_dims.len() - 1] * bytes_per_block * 2);
    Tensor::from_vec(out, dims, blocks.device())
}
