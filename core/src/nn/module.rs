use crate::params::ParamId;
use std::fmt::Debug;

/// A network layer.
///
/// Layers are plain data. They hold [`ParamId`]s into a `ParameterStore` and read the current
/// values at forward time, so graph state never lives in a layer.
pub trait Module: Debug + Send + Sync {
    /// Handles of every parameter the module reads.
    fn parameters(&self) -> Vec<ParamId>;
}
