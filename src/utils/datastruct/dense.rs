use num::Float;
use serde::{Deserialize, Serialize};

/// Row-major dense matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseMatrix<T>
where
    T: Float,
{
    no_rows: usize,
    no_columns: usize,
    data: Vec<T>,
}

impl<T> DenseMatrix<T>
where
    T: Float,
{
    pub fn zeros(no_rows: usize, no_columns: usize) -> Self {
        Self::filled(no_rows, no_columns, T::zero())
    }

    pub fn filled(no_rows: usize, no_columns: usize, value: T) -> Self {
        Self {
            no_rows,
            no_columns,
            data: vec![value; no_rows * no_columns],
        }
    }

    #[inline]
    pub fn no_rows(&self) -> usize {
        self.no_rows
    }

    #[inline]
    pub fn no_columns(&self) -> usize {
        self.no_columns
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        debug_assert!(row < self.no_rows && col < self.no_columns);
        self.data[row * self.no_columns + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        debug_assert!(row < self.no_rows && col < self.no_columns);
        self.data[row * self.no_columns + col] = value;
    }

    #[inline]
    pub fn row(&self, row: usize) -> &[T] {
        let start = row * self.no_columns;
        &self.data[start..start + self.no_columns]
    }

    #[inline]
    pub fn row_mut(&mut self, row: usize) -> &mut [T] {
        let start = row * self.no_columns;
        &mut self.data[start..start + self.no_columns]
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn fill(&mut self, value: T) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    /// Change the row count, keeping existing rows and zero-filling new ones.
    pub fn resize_rows(&mut self, no_rows: usize) {
        self.data.resize(no_rows * self.no_columns, T::zero());
        self.no_rows = no_rows;
    }

    /// Column sums.
    pub fn column_sums(&self) -> Vec<T> {
        let mut sums = vec![T::zero(); self.no_columns];
        for r in 0..self.no_rows {
            for (s, v) in sums.iter_mut().zip(self.row(r)) {
                *s = *s + *v;
            }
        }
        sums
    }
}
