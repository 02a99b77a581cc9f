//! Compressed sparse row matrix
//!
//! The retrieval math only needs row slicing, sparse-sparse products,
//! transposition and nonzero enumeration, so those are the whole interface.
//! Column indices inside a row are always kept sorted ascending.

use basket_recs_core::{PipelineError, Result};
use serde::{Deserialize, Serialize};

/// Borrowed view of one matrix row
#[derive(Debug, Clone, Copy)]
pub struct SparseRow<'a> {
    pub indices: &'a [usize],
    pub values: &'a [f32],
}

impl<'a> SparseRow<'a> {
    pub fn iter(&self) -> impl Iterator<Item = (usize, f32)> + 'a {
        self.indices.iter().copied().zip(self.values.iter().copied())
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn sum(&self) -> f32 {
        self.values.iter().sum()
    }
}

/// Sparse matrix in CSR layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseMatrix {
    num_rows: usize,
    num_cols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f32>,
}

impl SparseMatrix {
    /// Empty matrix of the given shape
    pub fn zeros(num_rows: usize, num_cols: usize) -> Self {
        Self {
            num_rows,
            num_cols,
            indptr: vec![0; num_rows + 1],
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Build from `(row, col, value)` triplets, summing duplicates
    pub fn from_triplets<I>(num_rows: usize, num_cols: usize, triplets: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, usize, f32)>,
    {
        let mut rows: Vec<Vec<(usize, f32)>> = vec![Vec::new(); num_rows];

        for (row, col, value) in triplets {
            if row >= num_rows {
                return Err(PipelineError::RowOutOfBounds {
                    row,
                    rows: num_rows,
                });
            }
            if col >= num_cols {
                return Err(PipelineError::InvalidInput(format!(
                    "column {} out of bounds for matrix with {} columns",
                    col, num_cols
                )));
            }
            rows[row].push((col, value));
        }

        let mut indptr = Vec::with_capacity(num_rows + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);

        for mut entries in rows {
            entries.sort_by_key(|&(col, _)| col);
            let mut last: Option<usize> = None;
            for (col, value) in entries {
                if last == Some(col) {
                    if let Some(v) = data.last_mut() {
                        *v += value;
                    }
                } else {
                    indices.push(col);
                    data.push(value);
                    last = Some(col);
                }
            }
            indptr.push(indices.len());
        }

        Ok(Self {
            num_rows,
            num_cols,
            indptr,
            indices,
            data,
        })
    }

    /// Build from per-row entries that are already sorted and deduplicated
    fn from_sorted_rows(num_cols: usize, rows: Vec<Vec<(usize, f32)>>) -> Self {
        let num_rows = rows.len();
        let mut indptr = Vec::with_capacity(num_rows + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for row in rows {
            for (col, value) in row {
                indices.push(col);
                data.push(value);
            }
            indptr.push(indices.len());
        }
        Self {
            num_rows,
            num_cols,
            indptr,
            indices,
            data,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.num_rows, self.num_cols)
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    /// Stored entries, explicit zeros included
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    pub fn row(&self, row: usize) -> Result<SparseRow<'_>> {
        if row >= self.num_rows {
            return Err(PipelineError::RowOutOfBounds {
                row,
                rows: self.num_rows,
            });
        }
        let (start, end) = (self.indptr[row], self.indptr[row + 1]);
        Ok(SparseRow {
            indices: &self.indices[start..end],
            values: &self.data[start..end],
        })
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        match self.row(row) {
            Ok(r) => match r.indices.binary_search(&col) {
                Ok(pos) => r.values[pos],
                Err(_) => 0.0,
            },
            Err(_) => 0.0,
        }
    }

    /// New matrix made of the given rows, in the given order
    pub fn select_rows(&self, rows: &[usize]) -> Result<Self> {
        let mut selected = Vec::with_capacity(rows.len());
        for &row in rows {
            selected.push(self.row(row)?.iter().collect());
        }
        Ok(Self::from_sorted_rows(self.num_cols, selected))
    }

    pub fn transpose(&self) -> Self {
        let mut counts = vec![0usize; self.num_cols + 1];
        for &col in &self.indices {
            counts[col + 1] += 1;
        }
        for i in 0..self.num_cols {
            counts[i + 1] += counts[i];
        }

        let indptr = counts.clone();
        let mut next = counts;
        let mut indices = vec![0usize; self.nnz()];
        let mut data = vec![0.0f32; self.nnz()];

        // Rows are visited in order, so every transposed row stays sorted.
        for row in 0..self.num_rows {
            for pos in self.indptr[row]..self.indptr[row + 1] {
                let col = self.indices[pos];
                let dest = next[col];
                indices[dest] = row;
                data[dest] = self.data[pos];
                next[col] += 1;
            }
        }

        Self {
            num_rows: self.num_cols,
            num_cols: self.num_rows,
            indptr,
            indices,
            data,
        }
    }

    /// Sparse product `self * other`
    ///
    /// Entries that sum to exactly zero are not stored.
    pub fn matmul(&self, other: &SparseMatrix) -> Result<Self> {
        if self.num_cols != other.num_rows {
            return Err(PipelineError::ShapeMismatch {
                operation: "matmul".to_string(),
                left: self.shape(),
                right: other.shape(),
            });
        }

        let mut accumulator = vec![0.0f32; other.num_cols];
        let mut seen = vec![false; other.num_cols];
        let mut touched: Vec<usize> = Vec::new();
        let mut rows = Vec::with_capacity(self.num_rows);

        for row in 0..self.num_rows {
            for pos in self.indptr[row]..self.indptr[row + 1] {
                let k = self.indices[pos];
                let a = self.data[pos];
                for other_pos in other.indptr[k]..other.indptr[k + 1] {
                    let col = other.indices[other_pos];
                    if !seen[col] {
                        seen[col] = true;
                        touched.push(col);
                    }
                    accumulator[col] += a * other.data[other_pos];
                }
            }

            touched.sort_unstable();
            let mut entries = Vec::with_capacity(touched.len());
            for &col in &touched {
                let value = accumulator[col];
                if value != 0.0 {
                    entries.push((col, value));
                }
                accumulator[col] = 0.0;
                seen[col] = false;
            }
            touched.clear();
            rows.push(entries);
        }

        Ok(Self::from_sorted_rows(other.num_cols, rows))
    }

    /// Row-major enumeration of stored nonzero entries
    pub fn nonzeros(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        (0..self.num_rows).flat_map(move |row| {
            let (start, end) = (self.indptr[row], self.indptr[row + 1]);
            (start..end)
                .filter(move |&pos| self.data[pos] != 0.0)
                .map(move |pos| (row, self.indices[pos], self.data[pos]))
        })
    }

    pub fn row_sums(&self) -> Vec<f32> {
        (0..self.num_rows)
            .map(|row| self.data[self.indptr[row]..self.indptr[row + 1]].iter().sum())
            .collect()
    }

    /// Number of stored entries in every column
    pub fn column_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_cols];
        for &col in &self.indices {
            counts[col] += 1;
        }
        counts
    }

    /// Rewrite every stored value from `(row, col, value)`
    pub fn map_entries<F>(&self, mut f: F) -> Self
    where
        F: FnMut(usize, usize, f32) -> f32,
    {
        let mut data = Vec::with_capacity(self.data.len());
        for row in 0..self.num_rows {
            for pos in self.indptr[row]..self.indptr[row + 1] {
                data.push(f(row, self.indices[pos], self.data[pos]));
            }
        }
        Self {
            num_rows: self.num_rows,
            num_cols: self.num_cols,
            indptr: self.indptr.clone(),
            indices: self.indices.clone(),
            data,
        }
    }

    /// Keep the `k` largest entries of every row
    ///
    /// Equal values keep the lower column index.
    pub fn top_k_per_row(&self, k: usize) -> Self {
        let mut rows = Vec::with_capacity(self.num_rows);
        for row in 0..self.num_rows {
            let (start, end) = (self.indptr[row], self.indptr[row + 1]);
            let mut entries: Vec<(usize, f32)> = (start..end)
                .map(|pos| (self.indices[pos], self.data[pos]))
                .collect();
            if entries.len() > k {
                entries.sort_by(|a, b| b.1.total_cmp(&a.1));
                entries.truncate(k);
                entries.sort_by_key(|&(col, _)| col);
            }
            rows.push(entries);
        }
        Self::from_sorted_rows(self.num_cols, rows)
    }
}
