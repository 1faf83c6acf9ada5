// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dense `rows × cols` grid of `f32` results.
//!
//! Patching sweeps, cosine-similarity maps and token tracking all produce
//! a layer-by-position table; [`Grid`] is that table, serializable for
//! external plotting.

use serde::{Deserialize, Serialize};

/// Row-major `rows × cols` matrix of `f32`.
///
/// # Example
///
/// ```
/// use candle_lens::Grid;
///
/// let mut grid = Grid::zeros(2, 3);
/// grid.set(1, 2, -4.0);
/// assert_eq!(grid.get(1, 2), Some(-4.0));
/// assert_eq!(grid.argmax(), Some((0, 0)));
/// assert_eq!(grid.max_abs(), 4.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    /// Number of rows (usually layers).
    pub rows: usize,
    /// Number of columns (usually token positions).
    pub cols: usize,
    /// Values, `rows * cols` long, row-major.
    pub data: Vec<f32>,
}

impl Grid {
    /// A grid filled with zeros.
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Value at `(row, col)`, or `None` when out of range.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.data.get(row * self.cols + col).copied()
    }

    /// Set `(row, col)`. Out-of-range writes are ignored.
    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        if row >= self.rows || col >= self.cols {
            return;
        }
        if let Some(cell) = self.data.get_mut(row * self.cols + col) {
            *cell = value;
        }
    }

    /// Row `row` as a slice.
    #[must_use]
    pub fn row(&self, row: usize) -> Option<&[f32]> {
        if row >= self.rows {
            return None;
        }
        self.data.get(row * self.cols..(row + 1) * self.cols)
    }

    /// Position of the largest value (first one on ties).
    #[must_use]
    pub fn argmax(&self) -> Option<(usize, usize)> {
        let (idx, _) = self
            .data
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((i, v)),
            })?;
        Some((idx / self.cols, idx % self.cols))
    }

    /// Largest absolute value, `0.0` for an empty grid.
    ///
    /// Plotting code uses this as the symmetric colour-scale bound.
    #[must_use]
    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0_f32, |m, v| m.max(v.abs()))
    }
}
