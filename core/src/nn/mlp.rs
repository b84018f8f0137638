use super::{Activation, Linear, Module};
use crate::Var;
use crate::error::{OptimError, Result};
use crate::params::{Init, ParamId, ParameterStore};
use rand::Rng;

const INIT_STD: f32 = 0.1;

/// Fully connected network: input layer, `hidden_layers` hidden layers, output layer.
///
/// Hidden activations are softplus; the output layer is affine. Weights start at `N(0, 0.1)`,
/// input and output biases at zero and hidden biases at `N(0, 0.1)`.
///
/// Parameters are registered as `w_in, b_in, w_1, b_1, ..., w_out, b_out`.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
    activation: Activation,
}

impl Mlp {
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for a zero input, output or layer width.
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParameterStore,
        input_dim: usize,
        output_dim: usize,
        layer_width: usize,
        hidden_layers: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if input_dim == 0 || output_dim == 0 || layer_width == 0 {
            return Err(OptimError::InvalidConfig(format!(
                "mlp dimensions must be positive, got in={input_dim} out={output_dim} width={layer_width}"
            )));
        }
        let normal = Init::Normal { std: INIT_STD };
        let mut layers = Vec::with_capacity(hidden_layers + 2);
        layers.push(Linear::new(
            store,
            "w_in",
            "b_in",
            input_dim,
            layer_width,
            normal,
            Init::Zeros,
            rng,
        )?);
        for layer in 1..=hidden_layers {
            layers.push(Linear::new(
                store,
                &format!("w_{layer}"),
                &format!("b_{layer}"),
                layer_width,
                layer_width,
                normal,
                normal,
                rng,
            )?);
        }
        layers.push(Linear::new(
            store,
            "w_out",
            "b_out",
            layer_width,
            output_dim,
            normal,
            Init::Zeros,
            rng,
        )?);
        Ok(Self {
            layers,
            activation: Activation::Softplus,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, Linear::in_features)
    }

    /// Maps `[batch, input_dim]` to `[batch, output_dim]`.
    ///
    /// # Errors
    ///
    /// Returns a shape error if `x` does not have `input_dim` columns.
    pub fn forward(&self, store: &ParameterStore, x: &Var) -> Result<Var> {
        let last = self.layers.len().saturating_sub(1);
        let mut activations = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            activations = layer.forward(store, &activations)?;
            if i < last {
                activations = self.activation.apply(&activations);
            }
        }
        Ok(activations)
    }
}

impl Module for Mlp {
    fn parameters(&self) -> Vec<ParamId> {
        self.layers.iter().flat_map(Linear::parameters).collect()
    }
}
