//! Tensor operations.
//!
//! # Overview
//!
//! This module implements the numeric kernels the optimizer is built from:
//! - **Element-wise Arithmetic**: `+`, `-`, `*`, `/` on references, shape checked.
//! - **Maps**: unary (`map`) and binary (`zip_map`) closures applied element by element.
//! - **Matrix Multiplication**: rank-2 `[M, K] x [K, N] -> [M, N]`.
//! - **Column and Row Operations**: gather, concatenate and overwrite column blocks; per-row
//!   max/min/sum. These carry the history-buffer reads and writes.
//! - **Broadcasting**: expansion of size-1 dimensions and the matching reduction.
//!
//! # Parallelism
//!
//! > [!TIP]
//! > **Efficiency Note**: Element-wise kernels and matmul rows run on `rayon`. Problem variables
//! > are usually short, so for tiny tensors the thread hand-off dominates. The kernels stay
//! > parallel anyway because a single large variable (a weight matrix of a regression problem)
//! > is enough to make them worthwhile.
//!
//! # Examples
//!
//! ```rust
//! use l2l::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//!
//! // Element-wise addition
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{Result, Tensor, TensorElem, TensorError};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic operation trait (e.g., `Add`, `Sub`) for `&Tensor`.
///
/// This macro handles the boilerplate of:
/// 1. Checking shape compatibility.
/// 2. Creating a new output tensor.
/// 3. Performing the element-wise operation in parallel using `rayon`.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: TensorElem,
        {
            type Output = crate::tensor::Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(TensorError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                out.data
                    .as_mut_slice()
                    .par_iter_mut()
                    .zip(self.data.as_slice().par_iter())
                    .zip(rhs.data.as_slice().par_iter())
                    .for_each(|((o, a), b)| {
                        *o = a.$method(*b);
                    });

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Applies a function element-wise to the tensor.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use l2l::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// let squared = t.map(|x| x * x);
    /// assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .as_mut_slice()
            .par_iter_mut()
            .zip(self.data.as_slice().par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }

    /// Combines two equally shaped tensors element by element.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the shapes differ.
    pub fn zip_map<F>(&self, rhs: &Self, f: F) -> Result<Self>
    where
        F: Fn(T, T) -> T + Sync + Send,
    {
        if self.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }
        let mut out = Tensor::zeros(self.shape);
        out.data
            .as_mut_slice()
            .par_iter_mut()
            .zip(self.data.as_slice().par_iter())
            .zip(rhs.data.as_slice().par_iter())
            .for_each(|((o, a), b)| *o = f(*a, *b));
        Ok(out)
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: T) -> Self {
        self.map(|x| x * factor)
    }

    /// Sum of all elements.
    pub fn sum(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc + x)
    }

    /// Adds `rhs` into `self` in place.
    ///
    /// This is the gradient accumulation primitive used by the autograd engine.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the shapes differ.
    pub fn accumulate(&mut self, rhs: &Self) -> Result<()> {
        if self.shape != rhs.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }
        self.data
            .as_mut_slice()
            .par_iter_mut()
            .zip(rhs.data.as_slice().par_iter())
            .for_each(|(o, r)| *o += *r);
        Ok(())
    }
}

/// Rank-2 operations.
///
/// Throughout the optimizer a matrix is `[batch, features]`: one row per variable coordinate.
impl<T> Tensor<T, 2>
where
    T: TensorElem,
{
    /// Number of rows.
    pub const fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Number of columns.
    pub const fn cols(&self) -> usize {
        self.shape[1]
    }

    /// Reads a single element.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` if `(row, col)` lies outside the matrix.
    pub fn get(&self, row: usize, col: usize) -> Result<T> {
        if row >= self.rows() || col >= self.cols() {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![row, col],
                shape: self.shape.to_vec(),
            });
        }
        Ok(self.data[row * self.cols() + col])
    }

    /// Matrix Multiplication `[M, K] x [K, N] -> [M, N]`.
    ///
    /// Each output row is computed independently on the `rayon` pool. The inner loop walks
    /// `rhs` row by row (i-k-j order) so both operands are read contiguously.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the inner dimensions differ.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let (m, k) = (self.rows(), self.cols());
        let (k2, n) = (rhs.rows(), rhs.cols());
        if k != k2 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![k, n],
                got: vec![k2, n],
            });
        }

        let mut out = Tensor::zeros([m, n]);
        if n == 0 {
            return Ok(out);
        }
        out.data
            .as_mut_slice()
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(i, out_row)| {
                let lhs_row = &self.data[i * k..(i + 1) * k];
                for (p, &a) in lhs_row.iter().enumerate() {
                    let rhs_row = &rhs.data[p * n..(p + 1) * n];
                    for (o, &b) in out_row.iter_mut().zip(rhs_row) {
                        *o += a * b;
                    }
                }
            });
        Ok(out)
    }

    /// Transposes the matrix.
    pub fn transpose(&self) -> Self {
        let (rows, cols) = (self.rows(), self.cols());
        let mut out = Tensor::zeros([cols, rows]);
        for r in 0..rows {
            for c in 0..cols {
                out.data[c * rows + r] = self.data[r * cols + c];
            }
        }
        out
    }

    /// Gathers the listed columns, in the listed order, into a new matrix.
    ///
    /// Indices may repeat.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` if an index is not a column of `self`.
    pub fn select_columns(&self, columns: &[usize]) -> Result<Self> {
        let cols = self.cols();
        if let Some(&bad) = columns.iter().find(|&&c| c >= cols) {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![bad],
                shape: self.shape.to_vec(),
            });
        }
        let width = columns.len();
        let mut out = Tensor::zeros([self.rows(), width]);
        if width == 0 {
            return Ok(out);
        }
        out.data
            .as_mut_slice()
            .par_chunks_mut(width)
            .zip(self.data.as_slice().par_chunks(cols.max(1)))
            .for_each(|(o, src)| {
                for (slot, &c) in o.iter_mut().zip(columns) {
                    *slot = src[c];
                }
            });
        Ok(out)
    }

    /// Concatenates matrices side by side.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the row counts disagree and
    /// `TensorError::Unsupported` if `parts` is empty.
    pub fn concat_columns(parts: &[&Self]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| TensorError::Unsupported("concat of zero tensors".to_string()))?;
        let rows = first.rows();
        if let Some(bad) = parts.iter().find(|p| p.rows() != rows) {
            return Err(TensorError::ShapeMismatch {
                expected: vec![rows],
                got: vec![bad.rows()],
            });
        }
        let total: usize = parts.iter().map(|p| p.cols()).sum();
        let mut data = Vec::with_capacity(rows * total);
        for r in 0..rows {
            for p in parts {
                let c = p.cols();
                data.extend_from_slice(&p.data[r * c..(r + 1) * c]);
            }
        }
        Tensor::new(data, [rows, total])
    }

    /// Returns a copy of `self` whose columns `start..start + src.cols()` are replaced by `src`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the row counts disagree and
    /// `TensorError::IndexOutOfBounds` if the block does not fit.
    pub fn write_columns(&self, start: usize, src: &Self) -> Result<Self> {
        if src.rows() != self.rows() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.rows(), src.cols()],
                got: src.shape.to_vec(),
            });
        }
        if start + src.cols() > self.cols() {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start + src.cols()],
                shape: self.shape.to_vec(),
            });
        }
        let mut out = self.clone();
        let (cols, width) = (self.cols(), src.cols());
        for r in 0..self.rows() {
            out.data[r * cols + start..r * cols + start + width]
                .copy_from_slice(&src.data[r * width..(r + 1) * width]);
        }
        Ok(out)
    }

    /// Per-row maximum, returned as `[rows, 1]`, plus the column index of each maximum.
    ///
    /// Ties resolve to the first column.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::Unsupported` for a matrix without columns.
    pub fn row_max(&self) -> Result<(Self, Vec<usize>)> {
        self.row_extreme(|candidate, best| candidate > best)
    }

    /// Per-row minimum, returned as `[rows, 1]`, plus the column index of each minimum.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::Unsupported` for a matrix without columns.
    pub fn row_min(&self) -> Result<(Self, Vec<usize>)> {
        self.row_extreme(|candidate, best| candidate < best)
    }

    fn row_extreme<F>(&self, better: F) -> Result<(Self, Vec<usize>)>
    where
        F: Fn(T, T) -> bool,
    {
        let cols = self.cols();
        if cols == 0 {
            return Err(TensorError::Unsupported(
                "row reduction over zero columns".to_string(),
            ));
        }
        let mut values = Vec::with_capacity(self.rows());
        let mut indices = Vec::with_capacity(self.rows());
        for row in self.data.chunks(cols) {
            let mut best = 0;
            for (c, &x) in row.iter().enumerate().skip(1) {
                if better(x, row[best]) {
                    best = c;
                }
            }
            values.push(row[best]);
            indices.push(best);
        }
        Ok((Tensor::new(values, [self.rows(), 1])?, indices))
    }

    /// Per-row sum, returned as `[rows, 1]`.
    pub fn row_sum(&self) -> Self {
        let cols = self.cols();
        let rows = self.rows();
        let data = if cols == 0 {
            vec![T::zero(); rows]
        } else {
            self.data
                .par_chunks(cols)
                .map(|row| row.iter().fold(T::zero(), |acc, &x| acc + x))
                .collect()
        };
        Tensor {
            shape: [rows, 1],
            strides: [1, 1],
            data,
        }
    }

    /// Expands size-1 dimensions to `shape`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if a dimension is neither equal to the target nor 1.
    pub fn broadcast_to(&self, shape: [usize; 2]) -> Result<Self> {
        for d in 0..2 {
            if self.shape[d] != shape[d] && self.shape[d] != 1 {
                return Err(TensorError::ShapeMismatch {
                    expected: shape.to_vec(),
                    got: self.shape.to_vec(),
                });
            }
        }
        let (rows, cols) = (self.rows(), self.cols());
        let mut data = Vec::with_capacity(shape[0] * shape[1]);
        for r in 0..shape[0] {
            let sr = if rows == 1 { 0 } else { r };
            for c in 0..shape[1] {
                let sc = if cols == 1 { 0 } else { c };
                data.push(self.data[sr * cols + sc]);
            }
        }
        Tensor::new(data, shape)
    }

    /// Sums over the dimensions that `broadcast_to` expanded, producing `shape`.
    ///
    /// This is the adjoint of [`Tensor::broadcast_to`].
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `shape` does not broadcast to `self.shape()`.
    pub fn sum_to(&self, shape: [usize; 2]) -> Result<Self> {
        for d in 0..2 {
            if shape[d] != self.shape[d] && shape[d] != 1 {
                return Err(TensorError::ShapeMismatch {
                    expected: self.shape.to_vec(),
                    got: shape.to_vec(),
                });
            }
        }
        let mut out = Tensor::zeros(shape);
        let cols = self.cols();
        for r in 0..self.rows() {
            let tr = if shape[0] == 1 { 0 } else { r };
            for c in 0..cols {
                let tc = if shape[1] == 1 { 0 } else { c };
                out.data[tr * shape[1] + tc] += self.data[r * cols + c];
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mat(data: Vec<f32>, rows: usize, cols: usize) -> Tensor<f32, 2> {
        Tensor::new(data, [rows, cols]).unwrap()
    }

    #[test]
    fn test_elementwise_ops() {
        let a = mat(vec![1.0, 2.0, 3.0, 4.0], 2, 2);
        let b = mat(vec![4.0, 3.0, 2.0, 1.0], 2, 2);

        assert_eq!((&a + &b).unwrap().data(), &[5.0, 5.0, 5.0, 5.0]);
        assert_eq!((&a - &b).unwrap().data(), &[-3.0, -1.0, 1.0, 3.0]);
        assert_eq!((&a * &b).unwrap().data(), &[4.0, 6.0, 6.0, 4.0]);
        assert_eq!((&a / &b).unwrap().data(), &[0.25, 2.0 / 3.0, 1.5, 4.0]);

        let c = mat(vec![1.0, 2.0], 1, 2);
        assert!(matches!(&a + &c, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_map_zip_map_scale_sum() {
        let a = mat(vec![1.0, -2.0, 3.0], 3, 1);
        assert_eq!(a.map(|x| x * x).data(), &[1.0, 4.0, 9.0]);
        assert_eq!(a.scale(2.0).data(), &[2.0, -4.0, 6.0]);
        assert_eq!(a.sum(), 2.0);

        let b = mat(vec![1.0, 1.0, 1.0], 3, 1);
        let max = a.zip_map(&b, |x, y| if x > y { x } else { y }).unwrap();
        assert_eq!(max.data(), &[1.0, 1.0, 3.0]);
    }

    #[test]
    fn test_accumulate() {
        let mut acc = mat(vec![1.0, 2.0], 2, 1);
        acc.accumulate(&mat(vec![0.5, 0.5], 2, 1)).unwrap();
        assert_eq!(acc.data(), &[1.5, 2.5]);
        assert!(acc.accumulate(&mat(vec![1.0], 1, 1)).is_err());
    }

    #[test]
    fn test_matmul() {
        // [1 2 3]   [7  8 ]   [1*7+2*9+3*11  1*8+2*10+3*12]   [58  64 ]
        // [4 5 6] x [9  10] = [4*7+5*9+6*11  4*8+5*10+6*12] = [139 154]
        //           [11 12]
        let a = mat(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
        let b = mat(vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0], 3, 2);
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);

        assert!(a.matmul(&a).is_err());
    }

    #[test]
    fn test_transpose() {
        let a = mat(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
        let t = a.transpose();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_column_ops() {
        let a = mat(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);

        let picked = a.select_columns(&[2, 0, 2]).unwrap();
        assert_eq!(picked.shape(), &[2, 3]);
        assert_eq!(picked.data(), &[3.0, 1.0, 3.0, 6.0, 4.0, 6.0]);
        assert!(a.select_columns(&[3]).is_err());

        let b = mat(vec![10.0, 20.0], 2, 1);
        let joined = Tensor::concat_columns(&[&b, &a]).unwrap();
        assert_eq!(joined.shape(), &[2, 4]);
        assert_eq!(joined.data(), &[10.0, 1.0, 2.0, 3.0, 20.0, 4.0, 5.0, 6.0]);

        let written = a.write_columns(1, &b).unwrap();
        assert_eq!(written.data(), &[1.0, 10.0, 3.0, 4.0, 20.0, 6.0]);
        assert!(a.write_columns(3, &b).is_err());
    }

    #[test]
    fn test_row_reductions() {
        let a = mat(vec![1.0, 5.0, 3.0, -4.0, -4.0, 2.0], 2, 3);

        let (max, argmax) = a.row_max().unwrap();
        assert_eq!(max.data(), &[5.0, 2.0]);
        assert_eq!(argmax, vec![1, 2]);

        let (min, argmin) = a.row_min().unwrap();
        assert_eq!(min.data(), &[1.0, -4.0]);
        // Ties resolve to the first column
        assert_eq!(argmin, vec![0, 0]);

        assert_eq!(a.row_sum().data(), &[9.0, -6.0]);
    }

    #[test]
    fn test_broadcast_and_sum_to() {
        let bias = mat(vec![1.0, 2.0], 1, 2);
        let wide = bias.broadcast_to([3, 2]).unwrap();
        assert_eq!(wide.data(), &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);

        let back = wide.sum_to([1, 2]).unwrap();
        assert_eq!(back.data(), &[3.0, 6.0]);

        let scalar = mat(vec![4.0], 1, 1);
        assert_eq!(scalar.broadcast_to([2, 2]).unwrap().data(), &[4.0; 4]);

        assert!(mat(vec![1.0, 2.0], 2, 1).broadcast_to([3, 1]).is_err());
    }

    #[test]
    fn test_get() {
        let a = mat(vec![1.0, 2.0, 3.0, 4.0], 2, 2);
        assert_eq!(a.get(1, 0).unwrap(), 3.0);
        assert!(matches!(
            a.get(2, 0),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }
}
