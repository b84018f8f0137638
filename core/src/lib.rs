//! # l2l
//!
//! `l2l` is a pure Rust implementation of **learned optimizers**: update rules that are
//! themselves small neural networks, trained by unrolling them on an optimization problem and
//! back-propagating through the unroll.
//!
//! Everything runs on the CPU on a small define-by-run autograd tape; there is no device layer.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: row-major `f32` tensors with `rayon` element-wise kernels.
//! - [`autograd`]: reverse-mode differentiation over rank-2 tensors.
//! - [`nn`]: dense layers, MLPs and stacked LSTM cells.
//! - [`problem`]: the contract with the function being minimized, plus test problems.
//! - [`state`]: moments, hidden states and ring-buffer histories.
//! - [`rules`]: Adam, the LSTM rule, the MLP rules and the guided history rules.
//! - [`engine`]: [`LearnedOptimizer`], the build/step/reset lifecycle.
//! - [`meta`]: the optimizer that trains an update rule's parameters.
//! - [`config`], [`checkpoint`]: configuration records and safetensors persistence.
//!
//! ## Example
//!
//! ```rust
//! use l2l::config::{LstmConfig, OptimizerConfig, RuleConfig};
//! use l2l::engine::LearnedOptimizer;
//! use l2l::problem::ElementwiseSquare;
//!
//! let problem = ElementwiseSquare::new(4, -2.0, 2.0, 7).unwrap();
//! let config = OptimizerConfig::new(RuleConfig::Lstm(LstmConfig {
//!     unroll_len: 3,
//!     state_size: 4,
//!     ..LstmConfig::default()
//! }));
//!
//! let mut optimizer = LearnedOptimizer::new(problem, config).unwrap();
//! optimizer.build().unwrap();
//! let report = optimizer.step().unwrap();
//! assert_eq!(report.losses.len(), 3);
//! ```

pub mod autograd;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod meta;
pub mod nn;
pub mod params;
pub mod preprocess;
pub mod problem;
pub mod rules;
pub mod state;
pub mod tensor;

pub use autograd::Variable;
pub use config::{OptimizerConfig, RuleConfig};
pub use engine::LearnedOptimizer;
pub use error::{OptimError, Result};
pub use tensor::{Tensor, TensorElem, TensorError};

/// The matrix type every variable, gradient and parameter is stored as.
pub type Matrix = Tensor<f32, 2>;

/// A matrix on the autograd tape.
pub type Var = Variable<f32>;
