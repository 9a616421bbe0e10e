//! Shape and dtype assertions shared by layer constructors and forward paths.
//!
//! Every helper takes a `label` naming the checked tensor so failures point at
//! the offending parameter, and returns `candle_core::Result<()>` so call sites
//! can propagate with `?`.

use candle_core::{DType, Error, Result, Tensor};

pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {expected:?}, got {:?}",
            tensor.dims()
        )))
    }
}

/// Checks the trailing (feature) dimension.
pub fn expect_last_dim(label: &str, tensor: &Tensor, size: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == size => Ok(()),
        _ => Err(Error::Msg(format!(
            "{label}: expected trailing dim {size}, got shape {:?}",
            tensor.dims()
        ))),
    }
}

pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Ensures `dim` splits evenly into chunks of `divisor`.
pub fn expect_divisible(label: &str, dim: usize, divisor: usize) -> Result<()> {
    if divisor != 0 && dim % divisor == 0 {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: dimension {dim} is not divisible by {divisor}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn failures_name_the_tensor() -> Result<()> {
        let t = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        expect_shape("w", &t, &[2, 3])?;
        expect_last_dim("w", &t, 3)?;
        let err = expect_rank("router.weight", &t, 3).unwrap_err();
        assert!(err.to_string().contains("router.weight"));
        assert!(expect_divisible("group", 96, 64).is_err());
        assert!(expect_dtype_in("w", &t, &[DType::BF16]).is_err());
        Ok(())
    }
}
