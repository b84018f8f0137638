use super::Module;
use crate::Var;
use crate::error::Result;
use crate::params::{Init, ParamId, ParameterStore};
use rand::Rng;

/// Affine layer `y = x W + b`.
///
/// # Shapes
///
/// - `W`: `[in_features, out_features]`
/// - `b`: `[1, out_features]`, broadcast over the batch rows.
/// - `x`: `[batch, in_features]`, one row per variable coordinate.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: ParamId,
    bias: ParamId,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Registers `weight_name` and `bias_name` in `store` and returns the layer.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` if a name is taken or an initializer is degenerate.
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParameterStore,
        weight_name: &str,
        bias_name: &str,
        in_features: usize,
        out_features: usize,
        weight_init: Init,
        bias_init: Init,
        rng: &mut R,
    ) -> Result<Self> {
        let weight = store.init(weight_name, [in_features, out_features], weight_init, rng)?;
        let bias = store.init(bias_name, [1, out_features], bias_init, rng)?;
        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    pub const fn in_features(&self) -> usize {
        self.in_features
    }

    pub const fn out_features(&self) -> usize {
        self.out_features
    }

    /// # Errors
    ///
    /// Returns a shape error if `x` does not have `in_features` columns.
    pub fn forward(&self, store: &ParameterStore, x: &Var) -> Result<Var> {
        let projected = x.matmul(store.var(self.weight))?;
        Ok(projected.add(store.var(self.bias))?)
    }
}

impl Module for Linear {
    fn parameters(&self) -> Vec<ParamId> {
        vec![self.weight, self.bias]
    }
}
