use num::Float;
use serde::{Deserialize, Serialize};

/// Compressed sparse row matrix.
///
/// Rows are documents and columns are batch-local token (or transaction)
/// indices. Explicit zeros are kept: a zero-weighted token is still an entry
/// and is still iterated by the inference loop.
///
/// 不変条件:
/// - `row_ptr.len() == num_rows + 1`, `row_ptr[0] == 0`, 単調非減少
/// - `row_ptr[num_rows] == val.len() == col_ind.len()`
/// - `col_ind[i] < num_cols`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsrMatrix<T>
where
    T: Float,
{
    num_cols: usize,
    val: Vec<T>,
    row_ptr: Vec<usize>,
    col_ind: Vec<usize>,
}

impl<T> CsrMatrix<T>
where
    T: Float,
{
    /// Build a matrix from raw CSR arrays.
    ///
    /// # Panics
    /// The arrays must satisfy the CSR invariants; a violation is a bug in the
    /// caller that built them.
    pub fn new(num_cols: usize, val: Vec<T>, row_ptr: Vec<usize>, col_ind: Vec<usize>) -> Self {
        assert!(!row_ptr.is_empty(), "row_ptr must hold at least one element");
        assert_eq!(row_ptr[0], 0, "row_ptr must start at zero");
        assert_eq!(val.len(), col_ind.len(), "val and col_ind must have equal length");
        assert_eq!(*row_ptr.last().unwrap_or(&0), val.len(), "row_ptr must end at nnz");
        debug_assert!(row_ptr.windows(2).all(|w| w[0] <= w[1]), "row_ptr must be non-decreasing");
        debug_assert!(col_ind.iter().all(|&c| c < num_cols), "column index out of range");
        Self { num_cols, val, row_ptr, col_ind }
    }

    /// Empty matrix with `num_rows` empty rows.
    pub fn empty(num_rows: usize, num_cols: usize) -> Self {
        Self::new(num_cols, Vec::new(), vec![0; num_rows + 1], Vec::new())
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.row_ptr.len() - 1
    }

    #[inline]
    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    #[inline]
    pub fn nnz(&self) -> usize {
        self.val.len()
    }

    #[inline]
    pub fn val(&self) -> &[T] {
        &self.val
    }

    #[inline]
    pub fn row_ptr(&self) -> &[usize] {
        &self.row_ptr
    }

    #[inline]
    pub fn col_ind(&self) -> &[usize] {
        &self.col_ind
    }

    /// Entry range of one row inside `val` / `col_ind`.
    #[inline]
    pub fn row_range(&self, row: usize) -> std::ops::Range<usize> {
        self.row_ptr[row]..self.row_ptr[row + 1]
    }

    /// `(column, value)` pairs of one row.
    #[inline]
    pub fn row_iter(&self, row: usize) -> impl Iterator<Item = (usize, T)> + '_ {
        let range = self.row_range(row);
        self.col_ind[range.clone()]
            .iter()
            .copied()
            .zip(self.val[range].iter().copied())
    }

    /// Sum of all values of one row.
    pub fn row_sum(&self, row: usize) -> T {
        self.val[self.row_range(row)]
            .iter()
            .fold(T::zero(), |acc, v| acc + *v)
    }

    /// 転置 (CSR -> CSC 相当)
    ///
    /// Entries of each output row keep the order of their source rows, so a
    /// transposed document-token matrix lists documents in ascending order
    /// for every token.
    pub fn transpose(&self) -> Self {
        let nnz = self.nnz();
        let mut row_ptr = vec![0usize; self.num_cols + 1];
        for &c in &self.col_ind {
            row_ptr[c + 1] += 1;
        }
        for i in 0..self.num_cols {
            row_ptr[i + 1] += row_ptr[i];
        }

        let mut next = row_ptr.clone();
        let mut val = vec![T::zero(); nnz];
        let mut col_ind = vec![0usize; nnz];
        for row in 0..self.num_rows() {
            for i in self.row_range(row) {
                let c = self.col_ind[i];
                let dst = next[c];
                val[dst] = self.val[i];
                col_ind[dst] = row;
                next[c] += 1;
            }
        }

        Self {
            num_cols: self.num_rows(),
            val,
            row_ptr,
            col_ind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CsrMatrix<f32> {
        // [ 1 0 2 ]
        // [ 0 0 0 ]
        // [ 0 3 4 ]
        CsrMatrix::new(3, vec![1.0, 2.0, 3.0, 4.0], vec![0, 2, 2, 4], vec![0, 2, 1, 2])
    }

    #[test]
    fn shape_and_rows() {
        let m = sample();
        assert_eq!(m.num_rows(), 3);
        assert_eq!(m.num_cols(), 3);
        assert_eq!(m.nnz(), 4);
        assert_eq!(m.row_iter(0).collect::<Vec<_>>(), vec![(0, 1.0), (2, 2.0)]);
        assert_eq!(m.row_iter(1).count(), 0);
        assert_eq!(m.row_sum(2), 7.0);
    }

    #[test]
    fn transpose_lists_rows_in_order() {
        let t = sample().transpose();
        assert_eq!(t.num_rows(), 3);
        assert_eq!(t.row_ptr(), &[0, 1, 2, 4]);
        assert_eq!(t.row_iter(2).collect::<Vec<_>>(), vec![(0, 2.0), (2, 4.0)]);
        assert_eq!(t.transpose(), sample());
    }

    #[test]
    fn duplicate_columns_survive_transpose() {
        let m = CsrMatrix::new(2, vec![1.0f32, 1.0, 5.0], vec![0, 3], vec![1, 1, 0]);
        let t = m.transpose();
        assert_eq!(t.row_iter(1).collect::<Vec<_>>(), vec![(0, 1.0), (0, 1.0)]);
        assert_eq!(t.row_iter(0).collect::<Vec<_>>(), vec![(0, 5.0)]);
    }

    #[test]
    fn empty_matrix() {
        let m = CsrMatrix::<f64>::empty(2, 5);
        assert_eq!(m.num_rows(), 2);
        assert_eq!(m.transpose().num_rows(), 5);
    }
}
