//! Neural network building blocks for learned update rules.
//!
//! Layers own no tensors. They hold [`ParamId`](crate::params::ParamId) handles into the
//! [`ParameterStore`](crate::params::ParameterStore) of the rule that created them, and every
//! `forward` takes that store. One rule instance is applied to all problem variables with the
//! same weights, one coordinate per row.

pub mod activation;
pub mod linear;
pub mod lstm;
pub mod mlp;
pub mod module;

pub use activation::Activation;
pub use linear::Linear;
pub use lstm::{LstmCell, LstmState, StackedLstm};
pub use mlp::Mlp;
pub use module::Module;
