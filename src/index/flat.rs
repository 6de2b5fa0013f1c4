use serde::{Deserialize, Serialize};

use super::{Neighbor, inner_product, rank, validate_rows};

/// Exact inner-product index: every query is scored against every row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    /// Row-major vector storage, `dimension` floats per row
    data: Vec<f32>,
}

impl FlatIndex {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append vectors as new rows. Callers validate dimensions first.
    #[inline]
    pub fn add(&mut self, vectors: &[Vec<f32>]) {
        self.data.reserve(vectors.len() * self.dimension);
        for vector in vectors {
            self.data.extend_from_slice(vector);
        }
    }

    #[inline]
    pub fn row(&self, row: usize) -> Option<&[f32]> {
        let start = row.checked_mul(self.dimension)?;
        self.data.get(start..start.checked_add(self.dimension)?)
    }

    #[inline]
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<Neighbor> {
        let scored = self
            .data
            .chunks_exact(self.dimension.max(1))
            .enumerate()
            .map(|(row, vector)| (inner_product(query, vector), row))
            .collect();

        rank(scored, top_k, self.len())
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        validate_rows(self.dimension, &self.data)
    }
}
