//! Vector-similarity search engine: IVF indexes over device-resident
//! inverted lists.

pub mod ivf;
pub mod ivf_flat;
pub mod ivf_int8;
pub mod ivf_pq;
pub mod quantizer;
pub mod topk;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Vector dimensions must be a multiple of this (hardware tiling).
pub const DIM_ALIGN: usize = 16;
pub const MAX_DIM: usize = 512;

/// Output slots never filled by a real candidate keep these values.
pub const DISTANCE_SENTINEL: f32 = f32::MAX;
pub const LABEL_SENTINEL: u32 = u32::MAX;

/// Sub-quantizer counts the PQ codec supports.
pub const SUPPORTED_SUB_QUANTIZERS: [usize; 12] = [2, 4, 8, 12, 16, 20, 24, 32, 48, 64, 96, 128];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Squared Euclidean distance, ascending results.
    L2,
    /// Cosine similarity, descending results.
    Cosine,
}

/// Validate a vector dimensionality against the hardware contract.
pub fn check_dim(d: usize) -> Result<()> {
    if d == 0 || d > MAX_DIM {
        return Err(Error::Config(format!(
            "dimension {d} outside supported range 1..={MAX_DIM}"
        )));
    }
    if d % DIM_ALIGN != 0 {
        return Err(Error::Config(format!(
            "dimension {d} is not a multiple of {DIM_ALIGN}"
        )));
    }
    Ok(())
}

/// Selects ids for removal: a contiguous range or an explicit batch.
#[derive(Debug, Clone)]
pub enum IdSelector {
    /// Half-open range `[lo, hi)`.
    Range { lo: u32, hi: u32 },
    Batch(HashSet<u32>),
}

impl IdSelector {
    pub fn range(lo: u32, hi: u32) -> Result<Self> {
        if lo > hi {
            return Err(Error::InvalidArgument(format!(
                "inverted id range {lo}..{hi}"
            )));
        }
        Ok(IdSelector::Range { lo, hi })
    }

    pub fn batch(ids: &[u32]) -> Self {
        IdSelector::Batch(ids.iter().copied().collect())
    }

    pub fn is_member(&self, id: u32) -> bool {
        match self {
            IdSelector::Range { lo, hi } => (*lo..*hi).contains(&id),
            IdSelector::Batch(set) => set.contains(&id),
        }
    }
}

/// Common contract of the IVF index family, generic over the element type
/// callers hand in (`f32` for flat/PQ, `i8` for the int8 variants).
pub trait VectorIndex<T> {
    fn dim(&self) -> usize;
    fn ntotal(&self) -> usize;
    fn is_trained(&self) -> bool;

    /// Train the coarse quantizer. Idempotent: a second call returns
    /// immediately without touching centroids or stored vectors.
    fn train(&mut self, x: &[T]) -> Result<()>;

    /// Add vectors with caller-chosen ids.
    fn add_with_ids(&mut self, x: &[T], ids: &[u32]) -> Result<()>;

    /// Add vectors with auto-assigned sequential ids; returns the first.
    fn add(&mut self, x: &[T]) -> Result<u32>;

    /// Remove everything the selector matches; returns the removed count.
    fn remove_ids(&mut self, selector: &IdSelector) -> Result<usize>;

    /// k-NN search. `distances` and `labels` are caller-allocated `n*k`
    /// slices; slots without a candidate are left at the sentinels.
    fn search(
        &self,
        queries: &[T],
        k: usize,
        distances: &mut [f32],
        labels: &mut [u32],
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_dim() {
        assert!(check_dim(16).is_ok());
        assert!(check_dim(512).is_ok());
        assert!(check_dim(0).is_err());
        assert!(check_dim(24).is_err());
        assert!(check_dim(528).is_err());
    }

    #[test]
    fn test_selector_range() {
        let sel = IdSelector::range(5, 10).unwrap();
        assert!(!sel.is_member(4));
        assert!(sel.is_member(5));
        assert!(sel.is_member(9));
        assert!(!sel.is_member(10));
        assert!(IdSelector::range(10, 5).is_err());
    }

    #[test]
    fn test_selector_batch() {
        let sel = IdSelector::batch(&[1, 23, 50]);
        assert!(sel.is_member(23));
        assert!(!sel.is_member(2));
    }
}
