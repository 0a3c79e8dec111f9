pub mod bm25;
pub mod hnsw;
pub mod store;

use crate::error::IndexError;

/// Dense `[chunk_count x dim]` embedding matrix, row order = chunk ordinal
/// order. Retained alongside the graph index for reference; queries go
/// through the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    dim: usize,
    data: Vec<f32>,
}

impl EmbeddingMatrix {
    pub fn empty() -> Self {
        Self {
            dim: 0,
            data: Vec::new(),
        }
    }

    /// Builds from ordered rows, enforcing one constant dimension.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self, IndexError> {
        let Some(first) = rows.first() else {
            return Ok(Self::empty());
        };

        let dim = first.len();
        if dim == 0 {
            return Err(IndexError::Inconsistent(
                "embedding dimension is zero".to_string(),
            ));
        }

        let mut data = Vec::with_capacity(rows.len() * dim);
        for (row_index, row) in rows.iter().enumerate() {
            if row.len() != dim {
                return Err(IndexError::Inconsistent(format!(
                    "row {row_index} has dimension {}, expected {dim}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }

        Ok(Self { dim, data })
    }

    pub fn from_raw(dim: usize, data: Vec<f32>) -> Result<Self, IndexError> {
        if dim == 0 && data.is_empty() {
            return Ok(Self::empty());
        }
        if dim == 0 || data.len() % dim != 0 {
            return Err(IndexError::Inconsistent(format!(
                "raw matrix of {} values does not divide into rows of {dim}",
                data.len()
            )));
        }
        Ok(Self { dim, data })
    }

    pub fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, index: usize) -> &[f32] {
        let start = index * self.dim;
        &self.data[start..start + self.dim]
    }

    pub fn raw(&self) -> &[f32] {
        &self.data
    }
}

pub(crate) fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let delta = x - y;
            delta * delta
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_rows_round_trip() {
        let matrix =
            EmbeddingMatrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).expect("uniform rows");
        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix.dim(), 2);
        assert_eq!(matrix.row(1), &[3.0, 4.0]);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let result = EmbeddingMatrix::from_rows(vec![vec![1.0, 2.0], vec![3.0]]);
        assert!(result.is_err());
    }

    #[test]
    fn empty_matrix_is_fine() {
        let matrix = EmbeddingMatrix::from_rows(Vec::new()).expect("empty ok");
        assert!(matrix.is_empty());
        assert_eq!(matrix.dim(), 0);
    }

    #[test]
    fn squared_l2_distance() {
        assert_eq!(squared_l2(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
    }
}
