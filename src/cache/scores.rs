//! Attention weight matrices handed back by the attention computation.

use crate::error::{CacheError, Result};

/// Row-major attention probabilities: `rows` queries by `cols` keys.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMatrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl AttentionMatrix {
    /// Wrap a row-major buffer of `rows × cols` weights.
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(CacheError::ShapeMismatch {
                expected: rows * cols,
                found: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// A single-query matrix (one decode step).
    pub fn from_row(row: Vec<f32>) -> Self {
        Self {
            rows: 1,
            cols: row.len(),
            data: row,
        }
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Mean attention each key received across all queries.
    ///
    /// For a causal prompt matrix this is the heavy-hitter signal used to
    /// rank prompt positions.
    pub fn column_means(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.cols];
        if self.rows == 0 {
            return out;
        }
        for r in 0..self.rows {
            for (acc, w) in out.iter_mut().zip(self.row(r)) {
                *acc += w;
            }
        }
        let n = self.rows as f32;
        out.iter_mut().for_each(|v| *v /= n);
        out
    }

    /// Element-wise mean of several same-shape matrices (one per head).
    pub fn mean_of(matrices: &[AttentionMatrix]) -> Option<AttentionMatrix> {
        let first = matrices.first()?;
        let mut data = vec![0.0f32; first.data.len()];
        for m in matrices {
            debug_assert_eq!(m.data.len(), data.len());
            for (acc, w) in data.iter_mut().zip(&m.data) {
                *acc += w;
            }
        }
        let n = matrices.len() as f32;
        data.iter_mut().for_each(|v| *v /= n);
        Some(AttentionMatrix {
            rows: first.rows,
            cols: first.cols,
            data,
        })
    }
}
