//! Operations for the autograd system.
//!
//! This module defines the nodes in the computation graph and implements the `backward` pass
//! for each. Every operation is a fallible method on [`Variable`] returning a new variable.
//!
//! Element-wise binary operations broadcast size-1 dimensions (a `[1, out]` bias against a
//! `[batch, out]` activation, a `[1, 1]` learning rate against a column of deltas). The
//! broadcast is itself a graph node, so its adjoint (a sum over the expanded dimension) is
//! applied automatically.

use super::{GradCell, GraphNode, Variable, accumulate};
use crate::tensor::{Result, Tensor, TensorElem, TensorError, elem};
use num_traits::Float;
use std::cell::RefCell;
use std::rc::Rc;

fn parents_of<T: TensorElem>(inputs: &[&Variable<T>]) -> Vec<Rc<dyn GraphNode>> {
    inputs.iter().filter_map(|v| v.node.clone()).collect()
}

fn new_cell<T: TensorElem>() -> GradCell<T> {
    Rc::new(RefCell::new(None))
}

// --- Element-wise arithmetic ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

/// A node representing `lhs (op) rhs` for two equally shaped operands.
#[derive(Debug)]
struct ArithNode<T: TensorElem> {
    op: Arith,
    /// Operand values, needed by the product and quotient rules.
    lhs: Tensor<T, 2>,
    rhs: Tensor<T, 2>,
    lhs_grad: GradCell<T>,
    rhs_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem + Float> GraphNode for ArithNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        match self.op {
            Arith::Add => {
                accumulate(&self.lhs_grad, &grad)?;
                accumulate(&self.rhs_grad, &grad)?;
            }
            Arith::Sub => {
                accumulate(&self.lhs_grad, &grad)?;
                accumulate(&self.rhs_grad, &grad.map(|g| -g))?;
            }
            Arith::Mul => {
                // d(xy)/dx = y, d(xy)/dy = x
                accumulate(&self.lhs_grad, &(&grad * &self.rhs)?)?;
                accumulate(&self.rhs_grad, &(&grad * &self.lhs)?)?;
            }
            Arith::Div => {
                // d(x/y)/dx = 1/y, d(x/y)/dy = -x/y^2
                accumulate(&self.lhs_grad, &(&grad / &self.rhs)?)?;
                let quotient = (&self.lhs / &self.rhs)?;
                let d_rhs = (&(&grad * &quotient)? / &self.rhs)?;
                accumulate(&self.rhs_grad, &d_rhs.map(|g| -g))?;
            }
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Matrix multiplication ---

#[derive(Debug)]
struct MatMulNode<T: TensorElem> {
    lhs: Tensor<T, 2>,
    rhs: Tensor<T, 2>,
    lhs_grad: GradCell<T>,
    rhs_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem + Float> GraphNode for MatMulNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        // C = A B:  dA = dC B^T,  dB = A^T dC
        accumulate(&self.lhs_grad, &grad.matmul(&self.rhs.transpose())?)?;
        accumulate(&self.rhs_grad, &self.lhs.transpose().matmul(&grad)?)?;
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Element-wise unary functions ---

/// A node for `y = f(x)` applied element-wise, storing `f'(x)`.
#[derive(Debug)]
struct UnaryNode<T: TensorElem> {
    local: Tensor<T, 2>,
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem + Float> GraphNode for UnaryNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        accumulate(&self.input_grad, &(&grad * &self.local)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Reductions ---

/// `y = scale * sum(x)`, a `[1, 1]` output.
#[derive(Debug)]
struct SumNode<T: TensorElem> {
    input_shape: [usize; 2],
    scale: T,
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem + Float> GraphNode for SumNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        let g = grad.data().first().copied().unwrap_or_else(T::zero);
        accumulate(
            &self.input_grad,
            &Tensor::full(self.input_shape, g * self.scale),
        )
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// `y[r] = scale * sum_c x[r, c]`, a `[rows, 1]` output.
#[derive(Debug)]
struct RowSumNode<T: TensorElem> {
    input_shape: [usize; 2],
    scale: T,
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem + Float> GraphNode for RowSumNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        let spread = grad.broadcast_to(self.input_shape)?.scale(self.scale);
        accumulate(&self.input_grad, &spread)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// `y[r] = x[r, picked[r]]`: row max/min. The gradient flows to the chosen column only.
#[derive(Debug)]
struct PickNode<T: TensorElem> {
    input_shape: [usize; 2],
    picked: Vec<usize>,
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem + Float> GraphNode for PickNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        let cols = self.input_shape[1];
        let mut routed = Tensor::zeros(self.input_shape);
        let out = routed.data_mut();
        for (r, (&c, &g)) in self.picked.iter().zip(grad.data()).enumerate() {
            out[r * cols + c] = g;
        }
        accumulate(&self.input_grad, &routed)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Shape operations ---

#[derive(Debug)]
struct BroadcastNode<T: TensorElem> {
    input_shape: [usize; 2],
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem + Float> GraphNode for BroadcastNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        accumulate(&self.input_grad, &grad.sum_to(self.input_shape)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

#[derive(Debug)]
struct ReshapeNode<T: TensorElem> {
    input_shape: [usize; 2],
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem + Float> GraphNode for ReshapeNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        accumulate(&self.input_grad, &grad.reshape(self.input_shape)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// Column gather. Repeated columns receive the sum of their gradients.
#[derive(Debug)]
struct SelectColumnsNode<T: TensorElem> {
    input_shape: [usize; 2],
    columns: Vec<usize>,
    input_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem + Float> GraphNode for SelectColumnsNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        let cols = self.input_shape[1];
        let width = self.columns.len();
        let mut scattered = Tensor::zeros(self.input_shape);
        let out = scattered.data_mut();
        for r in 0..self.input_shape[0] {
            for (j, &c) in self.columns.iter().enumerate() {
                out[r * cols + c] += grad.data()[r * width + j];
            }
        }
        accumulate(&self.input_grad, &scattered)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

#[derive(Debug)]
struct ConcatColumnsNode<T: TensorElem> {
    widths: Vec<usize>,
    input_grads: Vec<GradCell<T>>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem + Float> GraphNode for ConcatColumnsNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        let mut start = 0;
        for (cell, &width) in self.input_grads.iter().zip(&self.widths) {
            let columns: Vec<usize> = (start..start + width).collect();
            accumulate(cell, &grad.select_columns(&columns)?)?;
            start += width;
        }
        Ok(())
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// `y = base` with columns `start..start + width` replaced by `src`.
#[derive(Debug)]
struct WriteColumnsNode<T: TensorElem> {
    start: usize,
    width: usize,
    base_grad: GradCell<T>,
    src_grad: GradCell<T>,
    out_grad: GradCell<T>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem + Float> GraphNode for WriteColumnsNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = self.out_grad.borrow().clone() else {
            return Ok(());
        };
        let overwritten: Vec<usize> = (self.start..self.start + self.width).collect();
        let src_part = grad.select_columns(&overwritten)?;
        let base_part = grad.write_columns(self.start, &Tensor::zeros(*src_part.shape()))?;
        accumulate(&self.base_grad, &base_part)?;
        accumulate(&self.src_grad, &src_part)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

/// Shape both operands broadcast to, if any.
fn broadcast_shape(lhs: [usize; 2], rhs: [usize; 2]) -> Result<[usize; 2]> {
    let mut out = [0; 2];
    for d in 0..2 {
        out[d] = match (lhs[d], rhs[d]) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(TensorError::ShapeMismatch {
                    expected: lhs.to_vec(),
                    got: rhs.to_vec(),
                });
            }
        };
    }
    Ok(out)
}

impl<T> Variable<T>
where
    T: TensorElem + Float + 'static,
{
    fn arith(&self, rhs: &Self, op: Arith) -> Result<Self> {
        let shape = broadcast_shape(*self.shape(), *rhs.shape())?;
        let lhs = self.broadcast_to(shape)?;
        let rhs = rhs.broadcast_to(shape)?;

        let data = match op {
            Arith::Add => (&lhs.data + &rhs.data)?,
            Arith::Sub => (&lhs.data - &rhs.data)?,
            Arith::Mul => (&lhs.data * &rhs.data)?,
            Arith::Div => (&lhs.data / &rhs.data)?,
        };
        let out_grad = new_cell();
        let node = Rc::new(ArithNode {
            op,
            lhs: lhs.data.clone(),
            rhs: rhs.data.clone(),
            lhs_grad: lhs.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[&lhs, &rhs]),
        });
        Ok(Variable::from_parts(data, out_grad, node))
    }

    /// Element-wise sum with broadcasting.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the shapes do not broadcast.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.arith(rhs, Arith::Add)
    }

    /// Element-wise difference with broadcasting.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the shapes do not broadcast.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.arith(rhs, Arith::Sub)
    }

    /// Element-wise product with broadcasting.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the shapes do not broadcast.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.arith(rhs, Arith::Mul)
    }

    /// Element-wise quotient with broadcasting. The caller guarantees a non-zero divisor.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the shapes do not broadcast.
    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.arith(rhs, Arith::Div)
    }

    /// Matrix product `[M, K] x [K, N] -> [M, N]`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the inner dimensions differ.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let data = self.data.matmul(&rhs.data)?;
        let out_grad = new_cell();
        let node = Rc::new(MatMulNode {
            lhs: self.data.clone(),
            rhs: rhs.data.clone(),
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self, rhs]),
        });
        Ok(Variable::from_parts(data, out_grad, node))
    }

    /// Expands size-1 dimensions to `shape`. Returns a clone when the shape already matches.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `self` does not broadcast to `shape`.
    pub fn broadcast_to(&self, shape: [usize; 2]) -> Result<Self> {
        if *self.shape() == shape {
            return Ok(self.clone());
        }
        let data = self.data.broadcast_to(shape)?;
        let out_grad = new_cell();
        let node = Rc::new(BroadcastNode {
            input_shape: *self.shape(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Ok(Variable::from_parts(data, out_grad, node))
    }

    /// Applies `f` element-wise; `df` receives `(x, f(x))` and returns `f'(x)`.
    fn unary<F, D>(&self, f: F, df: D) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
        D: Fn(T, T) -> T + Sync + Send,
    {
        let value = self.data.map(f);
        let local = self
            .data
            .zip_map(&value, df)
            .unwrap_or_else(|_| Tensor::zeros(*self.shape()));
        let out_grad = new_cell();
        let node = Rc::new(UnaryNode {
            local,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Variable::from_parts(value, out_grad, node)
    }

    /// `e^x`.
    pub fn exp(&self) -> Self {
        self.unary(|x| x.exp(), |_, y| y)
    }

    /// Natural logarithm. The caller guarantees positive input.
    pub fn ln(&self) -> Self {
        self.unary(|x| x.ln(), |x, _| x.recip())
    }

    /// Hyperbolic tangent.
    pub fn tanh(&self) -> Self {
        self.unary(|x| x.tanh(), |_, y| T::one() - y * y)
    }

    /// Logistic sigmoid `1 / (1 + e^-x)`.
    pub fn sigmoid(&self) -> Self {
        self.unary(sigmoid, |_, y| y * (T::one() - y))
    }

    /// `ln(1 + e^x)`, evaluated as `max(x, 0) + ln(1 + e^-|x|)` to stay finite.
    pub fn softplus(&self) -> Self {
        self.unary(
            |x| x.max(T::zero()) + (-x.abs()).exp().ln_1p(),
            |x, _| sigmoid(x),
        )
    }

    /// Absolute value. The derivative at 0 is taken as 0.
    pub fn abs(&self) -> Self {
        self.unary(|x| x.abs(), |x, _| sign(x))
    }

    /// Sign in `{-1, 0, 1}`. Piecewise constant: no gradient flows through it.
    pub fn sign(&self) -> Self {
        self.unary(sign, |_, _| T::zero())
    }

    /// `x^2`.
    pub fn square(&self) -> Self {
        self.unary(|x| x * x, |x, _| x + x)
    }

    /// `c * x`.
    pub fn scale(&self, factor: T) -> Self {
        self.unary(move |x| x * factor, move |_, _| factor)
    }

    /// `x + c`.
    pub fn add_scalar(&self, shift: T) -> Self {
        self.unary(move |x| x + shift, |_, _| T::one())
    }

    /// `-x`.
    pub fn neg(&self) -> Self {
        self.scale(-T::one())
    }

    fn reduce_all(&self, scale: T) -> Self {
        let data = Tensor::full([1, 1], self.data.sum() * scale);
        let out_grad = new_cell();
        let node = Rc::new(SumNode {
            input_shape: *self.shape(),
            scale,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Variable::from_parts(data, out_grad, node)
    }

    /// Sum of all elements as `[1, 1]`.
    pub fn sum(&self) -> Self {
        self.reduce_all(T::one())
    }

    /// Mean of all elements as `[1, 1]`. The mean of an empty matrix is 0.
    pub fn mean(&self) -> Self {
        let n = self.data.size();
        let scale = if n == 0 {
            T::zero()
        } else {
            elem::<T>(1.0) / elem(n as f64)
        };
        self.reduce_all(scale)
    }

    fn reduce_rows(&self, scale: T) -> Self {
        let data = self.data.row_sum().scale(scale);
        let out_grad = new_cell();
        let node = Rc::new(RowSumNode {
            input_shape: *self.shape(),
            scale,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Variable::from_parts(data, out_grad, node)
    }

    /// Per-row sum as `[rows, 1]`.
    pub fn row_sum(&self) -> Self {
        self.reduce_rows(T::one())
    }

    /// Per-row mean as `[rows, 1]`.
    pub fn row_mean(&self) -> Self {
        let cols = self.data.cols();
        let scale = if cols == 0 {
            T::zero()
        } else {
            elem::<T>(1.0) / elem(cols as f64)
        };
        self.reduce_rows(scale)
    }

    fn pick(&self, values: Tensor<T, 2>, picked: Vec<usize>) -> Self {
        let out_grad = new_cell();
        let node = Rc::new(PickNode {
            input_shape: *self.shape(),
            picked,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Variable::from_parts(values, out_grad, node)
    }

    /// Per-row maximum as `[rows, 1]`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::Unsupported` for a matrix without columns.
    pub fn row_max(&self) -> Result<Self> {
        let (values, picked) = self.data.row_max()?;
        Ok(self.pick(values, picked))
    }

    /// Per-row minimum as `[rows, 1]`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::Unsupported` for a matrix without columns.
    pub fn row_min(&self) -> Result<Self> {
        let (values, picked) = self.data.row_min()?;
        Ok(self.pick(values, picked))
    }

    /// Reinterprets the data with a new shape of equal size.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the sizes differ.
    pub fn reshape(&self, shape: [usize; 2]) -> Result<Self> {
        if *self.shape() == shape {
            return Ok(self.clone());
        }
        let data = self.data.clone().reshape(shape)?;
        let out_grad = new_cell();
        let node = Rc::new(ReshapeNode {
            input_shape: *self.shape(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Ok(Variable::from_parts(data, out_grad, node))
    }

    /// Gathers columns in the given order.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` for an index outside the matrix.
    pub fn select_columns(&self, columns: &[usize]) -> Result<Self> {
        let data = self.data.select_columns(columns)?;
        let out_grad = new_cell();
        let node = Rc::new(SelectColumnsNode {
            input_shape: *self.shape(),
            columns: columns.to_vec(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self]),
        });
        Ok(Variable::from_parts(data, out_grad, node))
    }

    /// Concatenates variables side by side.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if row counts differ and
    /// `TensorError::Unsupported` for an empty slice.
    pub fn concat_columns(parts: &[&Self]) -> Result<Self> {
        let tensors: Vec<&Tensor<T, 2>> = parts.iter().map(|p| &p.data).collect();
        let data = Tensor::concat_columns(&tensors)?;
        let out_grad = new_cell();
        let node = Rc::new(ConcatColumnsNode {
            widths: parts.iter().map(|p| p.data.cols()).collect(),
            input_grads: parts.iter().map(|p| p.grad.clone()).collect(),
            out_grad: out_grad.clone(),
            parents: parents_of(parts),
        });
        Ok(Variable::from_parts(data, out_grad, node))
    }

    /// Returns `self` with columns `start..start + src.cols()` replaced by `src`.
    ///
    /// # Errors
    ///
    /// Returns a tensor error if the block does not fit.
    pub fn write_columns(&self, start: usize, src: &Self) -> Result<Self> {
        let data = self.data.write_columns(start, &src.data)?;
        let out_grad = new_cell();
        let node = Rc::new(WriteColumnsNode {
            start,
            width: src.data.cols(),
            base_grad: self.grad.clone(),
            src_grad: src.grad.clone(),
            out_grad: out_grad.clone(),
            parents: parents_of(&[self, src]),
        });
        Ok(Variable::from_parts(data, out_grad, node))
    }
}

/// Logistic sigmoid on a scalar.
pub fn sigmoid<T: Float>(x: T) -> T {
    T::one() / (T::one() + (-x).exp())
}

/// Sign on a scalar, with `sign(0) = 0`.
pub fn sign<T: Float>(x: T) -> T {
    if x > T::zero() {
        T::one()
    } else if x < T::zero() {
        -T::one()
    } else {
        T::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(data: Vec<f32>, rows: usize, cols: usize) -> Variable<f32> {
        Variable::new(Tensor::new(data, [rows, cols]).unwrap())
    }

    fn grad(v: &Variable<f32>) -> Vec<f32> {
        v.grad_tensor().unwrap().data().to_vec()
    }

    fn assert_close(got: &[f32], want: &[f32]) {
        assert_eq!(got.len(), want.len());
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() < 1e-5, "got {got:?}, want {want:?}");
        }
    }

    #[test]
    fn test_add_sub_grads() {
        let a = var(vec![1.0, 2.0], 2, 1);
        let b = var(vec![3.0, 4.0], 2, 1);
        a.sub(&b).unwrap().sum().backward().unwrap();
        assert_eq!(grad(&a), vec![1.0, 1.0]);
        assert_eq!(grad(&b), vec![-1.0, -1.0]);
    }

    #[test]
    fn test_mul_div_grads() {
        let a = var(vec![2.0], 1, 1);
        let b = var(vec![4.0], 1, 1);
        // d(a/b)/da = 1/b = 0.25, d(a/b)/db = -a/b^2 = -2/16 = -0.125
        a.div(&b).unwrap().backward().unwrap();
        assert_close(&grad(&a), &[0.25]);
        assert_close(&grad(&b), &[-0.125]);

        let c = var(vec![3.0], 1, 1);
        let d = var(vec![5.0], 1, 1);
        c.mul(&d).unwrap().backward().unwrap();
        assert_eq!(grad(&c), vec![5.0]);
        assert_eq!(grad(&d), vec![3.0]);
    }

    #[test]
    fn test_broadcast_bias_grad() {
        // out = x + b with b [1, 2] broadcast over 3 rows; d sum / d b = [3, 3]
        let x = var(vec![0.0; 6], 3, 2);
        let b = var(vec![1.0, 2.0], 1, 2);
        let out = x.add(&b).unwrap();
        assert_eq!(out.value().data(), &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
        out.sum().backward().unwrap();
        assert_eq!(grad(&b), vec![3.0, 3.0]);
        assert_eq!(grad(&x), vec![1.0; 6]);

        let bad = var(vec![1.0, 2.0, 3.0], 1, 3);
        assert!(x.add(&bad).is_err());
    }

    #[test]
    fn test_matmul_grads() {
        // y = sum(A B), A [1, 2], B [2, 1]
        // dA = 1 * B^T = [3, 4], dB = A^T * 1 = [1, 2]^T
        let a = var(vec![1.0, 2.0], 1, 2);
        let b = var(vec![3.0, 4.0], 2, 1);
        let y = a.matmul(&b).unwrap();
        assert_eq!(y.value().data(), &[11.0]);
        y.backward().unwrap();
        assert_eq!(grad(&a), vec![3.0, 4.0]);
        assert_eq!(grad(&b), vec![1.0, 2.0]);
    }

    #[test]
    fn test_unary_grads() {
        let x = var(vec![0.5], 1, 1);

        let y = x.tanh();
        y.backward().unwrap();
        let t = 0.5f32.tanh();
        assert_close(&grad(&x), &[1.0 - t * t]);

        x.zero_grad();
        x.sigmoid().backward().unwrap();
        let s = 1.0 / (1.0 + (-0.5f32).exp());
        assert_close(&grad(&x), &[s * (1.0 - s)]);

        x.zero_grad();
        let sp = x.softplus();
        assert_close(sp.value().data(), &[(1.0 + 0.5f32.exp()).ln()]);
        sp.backward().unwrap();
        assert_close(&grad(&x), &[s]);

        x.zero_grad();
        x.ln().backward().unwrap();
        assert_close(&grad(&x), &[2.0]);

        x.zero_grad();
        x.exp().backward().unwrap();
        assert_close(&grad(&x), &[0.5f32.exp()]);
    }

    #[test]
    fn test_softplus_is_finite_for_large_inputs() {
        let x = var(vec![-100.0, 100.0], 2, 1);
        let y = x.softplus();
        assert!(y.value().data().iter().all(|v| v.is_finite()));
        assert_close(y.value().data(), &[0.0, 100.0]);
    }

    #[test]
    fn test_sign_and_abs() {
        let x = var(vec![-2.0, 0.0, 3.0], 3, 1);
        assert_eq!(x.sign().value().data(), &[-1.0, 0.0, 1.0]);
        let a = x.abs();
        assert_eq!(a.value().data(), &[2.0, 0.0, 3.0]);
        a.sum().backward().unwrap();
        assert_eq!(grad(&x), vec![-1.0, 0.0, 1.0]);

        let y = var(vec![4.0], 1, 1);
        y.sign().backward().unwrap();
        assert_eq!(grad(&y), vec![0.0]);
    }

    #[test]
    fn test_mean_and_row_mean() {
        let x = var(vec![1.0, 2.0, 3.0, 4.0], 2, 2);
        let m = x.mean();
        assert_eq!(m.value().data(), &[2.5]);
        m.backward().unwrap();
        assert_eq!(grad(&x), vec![0.25; 4]);

        let y = var(vec![1.0, 3.0, 5.0, 7.0], 2, 2);
        let rm = y.row_mean();
        assert_eq!(rm.value().data(), &[2.0, 6.0]);
        rm.sum().backward().unwrap();
        assert_eq!(grad(&y), vec![0.5; 4]);
    }

    #[test]
    fn test_row_max_routes_gradient() {
        let x = var(vec![1.0, 9.0, 3.0, 7.0, 2.0, 5.0], 2, 3);
        let mx = x.row_max().unwrap();
        let mn = x.row_min().unwrap();
        assert_eq!(mx.value().data(), &[9.0, 7.0]);
        assert_eq!(mn.value().data(), &[1.0, 2.0]);
        mx.sub(&mn).unwrap().sum().backward().unwrap();
        assert_eq!(grad(&x), vec![-1.0, 1.0, 0.0, 1.0, -1.0, 0.0]);
    }

    #[test]
    fn test_select_columns_scatter_add() {
        let x = var(vec![1.0, 2.0, 3.0], 1, 3);
        let picked = x.select_columns(&[2, 2, 0]).unwrap();
        assert_eq!(picked.value().data(), &[3.0, 3.0, 1.0]);
        picked.sum().backward().unwrap();
        assert_eq!(grad(&x), vec![1.0, 0.0, 2.0]);
    }

    #[test]
    fn test_concat_and_write_columns() {
        let a = var(vec![1.0, 2.0], 2, 1);
        let b = var(vec![3.0, 4.0, 5.0, 6.0], 2, 2);
        let joined = Variable::concat_columns(&[&a, &b]).unwrap();
        assert_eq!(joined.shape(), &[2, 3]);
        joined.scale(2.0).sum().backward().unwrap();
        assert_eq!(grad(&a), vec![2.0, 2.0]);
        assert_eq!(grad(&b), vec![2.0; 4]);

        let base = var(vec![0.0; 6], 2, 3);
        let src = var(vec![7.0, 8.0], 2, 1);
        let written = base.write_columns(1, &src).unwrap();
        assert_eq!(written.value().data(), &[0.0, 7.0, 0.0, 0.0, 8.0, 0.0]);
        written.sum().backward().unwrap();
        assert_eq!(grad(&base), vec![1.0, 0.0, 1.0, 1.0, 0.0, 1.0]);
        assert_eq!(grad(&src), vec![1.0, 1.0]);
    }

    #[test]
    fn test_reshape_grad() {
        let x = var(vec![1.0, 2.0, 3.0, 4.0], 2, 2);
        let flat = x.reshape([4, 1]).unwrap();
        flat.square().sum().backward().unwrap();
        assert_eq!(grad(&x), vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_scalar_helpers() {
        assert_eq!(sign(-0.0f32), 0.0);
        assert!((sigmoid(0.0f64) - 0.5).abs() < 1e-12);
    }
}
