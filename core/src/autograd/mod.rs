//! Automatic Differentiation (Autograd) module.
//!
//! # What is Autograd used for here?
//!
//! A learned optimizer is trained by differentiating the *trajectory loss* (the mean of the
//! problem loss over an unroll) with respect to the optimizer's own network weights. Every
//! update step, history write and hidden-state transition of the unroll is therefore recorded
//! on a tape and replayed backwards.
//!
//! `l2l` implements **Reverse-Mode AD** over rank-2 tensors using a **Tape-based** approach.
//!
//! # How it Works
//!
//! 1. **Forward Pass**: operations on [`Variable`]s build a computation graph (a DAG) on the
//!    fly. Each node stores what its backward rule needs (operands, local derivatives, indices).
//! 2. **Backward Pass**: [`Variable::backward`] seeds the output gradient with ones, sorts the
//!    graph topologically and runs every node's rule in reverse order, accumulating into the
//!    gradient cells of its inputs.
//!
//! # Example: Simple Gradient Computation
//!
//! We want to compute the derivative of $f(x) = x^2$ at $x = 3$.
//! $f'(x) = 2x$, so $f'(3) = 6$.
//!
//! ```rust
//! use l2l::autograd::Variable;
//!
//! let x = Variable::<f32>::scalar(3.0);
//! let y = x.mul(&x).unwrap();
//! y.backward().unwrap();
//!
//! let grad = x.grad_tensor().unwrap();
//! assert_eq!(grad.data()[0], 6.0);
//! ```
//!
//! > [!TIP]
//! > **Expert Note: Truncated Backpropagation Through Time**
//! > The tape is implicit in the `Rc<dyn GraphNode>` links between variables, so a graph lives
//! > exactly as long as the variables that reference it. The optimizer engine calls
//! > [`Variable::detach`] on its state after every meta step. That cuts the tape between unroll
//! > units, which is what bounds memory when an optimizer is trained for thousands of steps.

use crate::tensor::{Result, Tensor, TensorElem};
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

pub mod engine;
pub mod ops;

/// Shared, lazily allocated gradient slot of a variable.
pub type GradCell<T> = Rc<RefCell<Option<Tensor<T, 2>>>>;

/// A node in the computation graph.
///
/// This trait represents an operation that can be backpropagated through.
pub trait GraphNode: Debug {
    /// Reads the gradient of the node's output and accumulates into the gradients of its inputs.
    ///
    /// # Errors
    ///
    /// Propagates tensor shape errors; these indicate a malformed graph.
    fn backward(&self) -> Result<()>;
    /// Returns the nodes that produced this node's inputs.
    fn parents(&self) -> Vec<Rc<dyn GraphNode>>;
}

/// A variable in the computation graph.
///
/// Wraps a matrix and tracks its gradient and the operation that created it. Cloning a
/// `Variable` is cheap for the graph: clones share the gradient cell and the node.
#[derive(Clone, Debug)]
pub struct Variable<T>
where
    T: TensorElem,
{
    /// The actual tensor data.
    pub data: Tensor<T, 2>,
    /// The gradient of the loss with respect to this variable.
    pub grad: GradCell<T>,
    /// The node in the computation graph that produced this variable.
    pub node: Option<Rc<dyn GraphNode>>,
}

impl<T> Variable<T>
where
    T: TensorElem + 'static,
{
    /// Creates a new leaf variable.
    ///
    /// Leaf variables are the inputs to the computation graph (optimizer weights, problem
    /// variables at the start of an unroll, detached gradients).
    pub fn new(data: Tensor<T, 2>) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            node: None,
        }
    }

    /// Creates a `[1, 1]` leaf holding `value`.
    pub fn scalar(value: T) -> Self {
        Self::new(Tensor::full([1, 1], value))
    }

    /// Creates a leaf of zeros.
    pub fn zeros(shape: [usize; 2]) -> Self {
        Self::new(Tensor::zeros(shape))
    }

    /// Creates a new variable with an associated graph node.
    ///
    /// This is used by operations to create output variables.
    pub fn with_node(data: Tensor<T, 2>, node: Rc<dyn GraphNode>) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            node: Some(node),
        }
    }

    /// Creates an output variable whose gradient cell is `grad` (already owned by `node`).
    pub(crate) fn from_parts(data: Tensor<T, 2>, grad: GradCell<T>, node: Rc<dyn GraphNode>) -> Self {
        Self {
            data,
            grad,
            node: Some(node),
        }
    }

    /// Shape of the wrapped matrix.
    pub const fn shape(&self) -> &[usize; 2] {
        self.data.shape()
    }

    /// Borrow of the wrapped matrix.
    pub const fn value(&self) -> &Tensor<T, 2> {
        &self.data
    }

    /// Returns `true` if this variable was produced by an operation.
    pub const fn is_tracked(&self) -> bool {
        self.node.is_some()
    }

    /// Triggers the backward pass starting from this variable.
    ///
    /// This variable is typically a `[1, 1]` loss. Its gradient is seeded with ones.
    ///
    /// # Errors
    ///
    /// Propagates shape errors raised by a node's backward rule.
    pub fn backward(&self) -> Result<()> {
        if self.grad.borrow().is_none() {
            *self.grad.borrow_mut() = Some(Tensor::ones(*self.data.shape()));
        }

        engine::backward(self.node.clone())
    }

    /// Returns a copy of the accumulated gradient, if any.
    pub fn grad_tensor(&self) -> Option<Tensor<T, 2>> {
        self.grad.borrow().clone()
    }

    /// Clears the accumulated gradient.
    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// Returns a leaf with the same value, cut from the graph.
    ///
    /// Gradients never flow through the result, which starts with an empty gradient cell.
    pub fn detach(&self) -> Self {
        Self::new(self.data.clone())
    }
}

/// Adds `grad` into `cell`, allocating the slot on first use.
pub(crate) fn accumulate<T: TensorElem>(cell: &GradCell<T>, grad: &Tensor<T, 2>) -> Result<()> {
    let mut slot = cell.borrow_mut();
    match slot.as_mut() {
        Some(existing) => existing.accumulate(grad)?,
        None => *slot = Some(grad.clone()),
    }
    Ok(())
}
