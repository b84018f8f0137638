//! Crate-wide error type.

use crate::tensor::TensorError;
use thiserror::Error;

/// Errors raised while configuring, running or persisting a learned optimizer.
#[derive(Error, Debug)]
pub enum OptimError {
    /// A configuration value is out of range, unknown or inconsistent with the problem.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// A gradient, delta or value does not have the declared flattened length of its variable.
    #[error("Shape mismatch for variable '{variable}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        variable: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An operation was called in the wrong lifecycle phase.
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A checkpoint file is unreadable or does not match the optimizer's parameters.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

pub type Result<T> = std::result::Result<T, OptimError>;
