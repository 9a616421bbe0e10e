//! Replication and ordering of routed rows.
//!
//! A batch of `T` tokens with `K` experts each produces `T * K` routed rows,
//! row `r` carrying token `r / K` to expert `indices[r]`. Batches of more than
//! [`SORT_THRESHOLD`] tokens are stably sorted by expert id so each expert multiplies one contiguous slice;
//! the inverse permutation restores token order afterwards.

use candle_core::{bail, Device, Result, Tensor};

/// Token count above which routed rows are sorted by expert.
pub const SORT_THRESHOLD: usize = 64;

/// Rows sorted by expert id plus the permutation that undoes the sort.
#[derive(Debug, Clone)]
pub struct SortedDispatch {
    /// `[T * K, hidden]`, grouped by expert.
    pub rows: Tensor,
    /// Expert id per sorted row (non-decreasing).
    pub experts: Vec<u32>,
    /// `u32` `[T * K]`; `sorted[inverse[r]]` is routed row `r`.
    pub inverse: Tensor,
}

/// Stable argsort of `indices` by expert id.
pub fn sort_order(indices: &[u32]) -> Vec<u32> {
    let mut order: Vec<u32> = (0..indices.len() as u32).collect();
    order.sort_by_key(|&r| indices[r as usize]);
    order
}

/// Inverse of a permutation.
pub fn invert(order: &[u32]) -> Vec<u32> {
    let mut inverse = vec![0u32; order.len()];
    for (pos, &row) in order.iter().enumerate() {
        inverse[row as usize] = pos as u32;
    }
    inverse
}

/// Gathers `x` (`[T, hidden]`) into routed rows sorted by expert.
pub fn gather_sort(x: &Tensor, indices: &[u32], top_k: usize) -> Result<SortedDispatch> {
    check_routing(x, indices, top_k)?;
    let order = sort_order(indices);
    let experts = order.iter().map(|&r| indices[r as usize]).collect();
    let tokens: Vec<u32> = order.iter().map(|&r| r / top_k as u32).collect();
    let inverse = invert(&order);

    let device = x.device();
    Ok(SortedDispatch {
        rows: x.index_select(&index_tensor(tokens, device)?, 0)?,
        experts,
        inverse: index_tensor(inverse, device)?,
    })
}

/// Restores routed-row order from sorted rows.
pub fn scatter_unsort(sorted: &Tensor, inverse: &Tensor) -> Result<Tensor> {
    sorted.index_select(inverse, 0)
}

/// Routed rows ready for the expert projections.
#[derive(Debug, Clone)]
pub struct RoutedRows {
    pub rows: Tensor,
    pub experts: Vec<u32>,
    inverse: Option<Tensor>,
}

impl RoutedRows {
    /// Replicates `x` per selected expert, sorting when the batch is large enough.
    pub fn plan(x: &Tensor, indices: &[u32], top_k: usize) -> Result<Self> {
        check_routing(x, indices, top_k)?;
        if indices.len() / top_k > SORT_THRESHOLD {
            let sorted = gather_sort(x, indices, top_k)?;
            return Ok(Self {
                rows: sorted.rows,
                experts: sorted.experts,
                inverse: Some(sorted.inverse),
            });
        }

        let tokens: Vec<u32> = (0..indices.len() as u32).map(|r| r / top_k as u32).collect();
        Ok(Self {
            rows: x.index_select(&index_tensor(tokens, x.device())?, 0)?,
            experts: indices.to_vec(),
            inverse: None,
        })
    }

    pub fn is_sorted(&self) -> bool {
        self.inverse.is_some()
    }

    /// Puts expert outputs back into routed-row (token-major) order.
    pub fn restore(&self, outputs: &Tensor) -> Result<Tensor> {
        match &self.inverse {
            Some(inverse) => scatter_unsort(outputs, inverse),
            None => Ok(outputs.clone()),
        }
    }
}

fn check_routing(x: &Tensor, indices: &[u32], top_k: usize) -> Result<()> {
    let (tokens, _) = x.dims2()?;
    if top_k == 0 || indices.len() != tokens * top_k {
        bail!(
            "routing mismatch: {} tokens x top_k {} but {} expert ids",
            tokens,
            top_k,
            indices.len()
        );
    }
    Ok(())
}

fn index_tensor(values: Vec<u32>, device: &Device) -> Result<Tensor> {
    let len = values.len();
    Tensor::from_vec(values, len, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows_of(t: &Tensor) -> Result<Vec<Vec<f32>>> {
        t.to_vec2::<f32>()
    }

    #[test]
    fn scatter_undoes_gather() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (6, 4), &device)?;
        let indices = [3u32, 1, 3, 0, 2, 1];
        let sorted = gather_sort(&x, &indices, 1)?;
        assert_eq!(sorted.experts, vec![0, 1, 1, 2, 3, 3]);
        assert_eq!(rows_of(&scatter_unsort(&sorted.rows, &sorted.inverse)?)?, rows_of(&x)?);
        Ok(())
    }

    #[test]
    fn sort_is_stable_within_an_expert() {
        let order = sort_order(&[2, 0, 2, 0, 1]);
        assert_eq!(order, vec![1, 3, 4, 0, 2]);
        assert_eq!(invert(&order), vec![3, 0, 4, 1, 2]);
    }

    #[test]
    fn restore_yields_token_major_replicas() -> Result<()> {
        let device = Device::Cpu;
        let tokens = 72;
        let x = Tensor::arange(0f32, (tokens * 2) as f32, &device)?.reshape((tokens, 2))?;
        let indices: Vec<u32> = (0..tokens * 2).map(|r| ((r * 7) % 5) as u32).collect();

        let routed = RoutedRows::plan(&x, &indices, 2)?;
        assert!(routed.is_sorted());
        assert!(routed.experts.windows(2).all(|w| w[0] <= w[1]));

        let restored = rows_of(&routed.restore(&routed.rows)?)?;
        let source = rows_of(&x)?;
        for (r, row) in restored.iter().enumerate() {
            assert_eq!(row, &source[r / 2]);
        }
        Ok(())
    }

    #[test]
    fn small_batches_keep_routed_order() -> Result<()> {
        let x = Tensor::randn(0f32, 1.0, (3, 2), &Device::Cpu)?;
        let routed = RoutedRows::plan(&x, &[1, 0, 1, 1, 0, 2], 2)?;
        assert!(!routed.is_sorted());
        assert_eq!(routed.experts, vec![1, 0, 1, 1, 0, 2]);
        assert!(RoutedRows::plan(&x, &[0, 1], 2).is_err());
        Ok(())
    }

    #[test]
    fn sorting_starts_past_the_token_threshold() -> Result<()> {
        let device = Device::Cpu;
        for (tokens, sorted) in [(SORT_THRESHOLD, false), (SORT_THRESHOLD + 1, true)] {
            let x = Tensor::zeros((tokens, 2), candle_core::DType::F32, &device)?;
            let indices: Vec<u32> = (0..tokens * 2).map(|r| (r % 3) as u32).collect();
            assert_eq!(RoutedRows::plan(&x, &indices, 2)?.is_sorted(), sorted, "{tokens} tokens");
        }
        Ok(())
    }
}
