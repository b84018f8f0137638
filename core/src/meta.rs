//! Meta-training.
//!
//! # What is Meta-training?
//!
//! The parameters of a learned update rule are trained like any other network weights, only
//! the "loss" is the loss of the *problem* along a trajectory the rule itself produced. After
//! an unroll the engine back-propagates the trajectory loss; [`MetaTrainer::step`] then moves
//! every trainable parameter of the rule along its gradient.
//!
//! Two update rules are available:
//!
//! $$
//! \begin{aligned}
//! \text{SGD:}\quad & \theta \leftarrow \theta - \eta g \\
//! \text{Adam:}\quad & m \leftarrow \beta_1 m + (1 - \beta_1) g, \quad
//!                     v \leftarrow \beta_2 v + (1 - \beta_2) g^2 \\
//!                   & \theta \leftarrow \theta - \eta \frac{m / (1 - \beta_1^t)}{\sqrt{v / (1 - \beta_2^t)} + \epsilon}
//! \end{aligned}
//! $$
//!
//! > [!TIP]
//! > **Expert Note: Fresh Leaves**
//! > An update does not write into the parameter tensor in place. It registers a new leaf with
//! > the updated value, so no graph built before the update can observe it, and the next unroll
//! > records against the new value.

use crate::error::{OptimError, Result};
use crate::params::{ParamId, ParameterStore};
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// The optimizer applied to update-rule parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaOptimizerKind {
    #[default]
    Adam,
    Sgd,
}

#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f32>,
    v: Vec<f32>,
    step: u64,
}

/// Applies meta-gradients to the trainable parameters of a [`ParameterStore`].
#[derive(Debug, Clone)]
pub struct MetaTrainer {
    kind: MetaOptimizerKind,
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    state: HashMap<ParamId, Moments>,
}

impl MetaTrainer {
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for a non-positive or non-finite learning rate.
    pub fn new(kind: MetaOptimizerKind, learning_rate: f32) -> Result<Self> {
        if !(learning_rate.is_finite() && learning_rate > 0.0) {
            return Err(OptimError::InvalidConfig(format!(
                "meta learning rate must be positive, got {learning_rate}"
            )));
        }
        Ok(Self {
            kind,
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            state: HashMap::new(),
        })
    }

    pub const fn kind(&self) -> MetaOptimizerKind {
        self.kind
    }

    pub const fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Drops the Adam moments.
    pub fn reset(&mut self) {
        self.state.clear();
    }

    /// Updates every trainable parameter that holds a gradient, then zeroes all gradients.
    ///
    /// Returns the number of parameters updated. Parameters without a gradient (not reached
    /// by the last backward pass) are left unchanged.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::ShapeMismatch` if a gradient does not match its parameter. The
    /// store is then left untouched.
    pub fn step(&mut self, store: &mut ParameterStore) -> Result<usize> {
        let grads: Vec<(ParamId, Tensor<f32, 2>)> = store
            .trainable_ids()
            .filter_map(|id| store.var(id).grad_tensor().map(|grad| (id, grad)))
            .collect();
        let updated = self.apply(store, grads)?;
        store.zero_grad();
        debug!(updated, kind = ?self.kind, "meta step");
        Ok(updated)
    }

    fn apply(
        &mut self,
        store: &mut ParameterStore,
        grads: Vec<(ParamId, Tensor<f32, 2>)>,
    ) -> Result<usize> {
        for (id, grad) in &grads {
            let expected = store.var(*id).shape();
            if expected != grad.shape() {
                return Err(OptimError::ShapeMismatch {
                    variable: store.name(*id).to_string(),
                    expected: expected.to_vec(),
                    got: grad.shape().to_vec(),
                });
            }
        }
        let updated = grads.len();
        for (id, grad) in grads {
            let mut value = store.var(id).value().clone();
            match self.kind {
                MetaOptimizerKind::Sgd => self.sgd(&mut value, &grad),
                MetaOptimizerKind::Adam => self.adam(id, &mut value, &grad),
            }
            store.set_value(id, value)?;
        }
        Ok(updated)
    }

    fn sgd(&self, param: &mut Tensor<f32, 2>, grad: &Tensor<f32, 2>) {
        let lr = self.learning_rate;
        param
            .data_mut()
            .par_iter_mut()
            .zip(grad.data().par_iter())
            .for_each(|(p, g)| {
                *p -= lr * *g;
            });
    }

    fn adam(&mut self, id: ParamId, param: &mut Tensor<f32, 2>, grad: &Tensor<f32, 2>) {
        let size = param.size();
        let entry = self.state.entry(id).or_insert_with(|| Moments {
            m: vec![0.0; size],
            v: vec![0.0; size],
            step: 0,
        });
        entry.step += 1;

        let (lr, b1, b2, eps) = (self.learning_rate, self.beta1, self.beta2, self.epsilon);
        let t = i32::try_from(entry.step).unwrap_or(i32::MAX);
        let bias_correction1 = 1.0 - b1.powi(t);
        let bias_correction2 = 1.0 - b2.powi(t);

        param
            .data_mut()
            .par_iter_mut()
            .zip(grad.data().par_iter())
            .zip(entry.m.par_iter_mut())
            .zip(entry.v.par_iter_mut())
            .for_each(|(((p, g), m), v)| {
                *m = b1 * *m + (1.0 - b1) * *g;
                *v = b2 * *v + (1.0 - b2) * *g * *g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Var;

    fn store_with_grad(value: f32, grad_scale: f32) -> (ParameterStore, ParamId) {
        let mut store = ParameterStore::new("test");
        let id = store.register("w", Tensor::full([1, 2], value), true).unwrap();
        // loss = grad_scale * sum(w)
        store.var(id).scale(grad_scale).sum().backward().unwrap();
        (store, id)
    }

    #[test]
    fn test_sgd_step() {
        let (mut store, id) = store_with_grad(1.0, 0.5);
        let mut meta = MetaTrainer::new(MetaOptimizerKind::Sgd, 0.1).unwrap();
        assert_eq!(meta.step(&mut store).unwrap(), 1);
        // 1.0 - 0.1 * 0.5
        for v in store.var(id).value().data() {
            assert!((v - 0.95).abs() < 1e-6);
        }
        assert!(store.var(id).grad_tensor().is_none());
    }

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        let (mut store, id) = store_with_grad(1.0, 3.0);
        let mut meta = MetaTrainer::new(MetaOptimizerKind::Adam, 0.01).unwrap();
        meta.step(&mut store).unwrap();
        // Bias-corrected first step is lr * sign(g)
        for v in store.var(id).value().data() {
            assert!((v - 0.99).abs() < 1e-5);
        }
    }

    #[test]
    fn test_frozen_and_gradless_parameters_are_untouched() {
        let mut store = ParameterStore::new("test");
        let frozen = store.register("lr", Tensor::full([1, 1], 1e-4), false).unwrap();
        let unused = store.register("w_out", Tensor::ones([1, 1]), true).unwrap();
        let used = store.register("w_in", Tensor::ones([1, 1]), true).unwrap();
        store
            .var(frozen)
            .mul(store.var(used))
            .unwrap()
            .sum()
            .backward()
            .unwrap();

        let mut meta = MetaTrainer::new(MetaOptimizerKind::Sgd, 1.0).unwrap();
        assert_eq!(meta.step(&mut store).unwrap(), 1);
        assert_eq!(store.var(frozen).value().data(), &[1e-4]);
        assert_eq!(store.var(unused).value().data(), &[1.0]);
        assert!((store.var(used).value().data()[0] - (1.0 - 1e-4)).abs() < 1e-7);
    }

    #[test]
    fn test_updated_parameters_are_fresh_leaves() {
        let (mut store, id) = store_with_grad(2.0, 1.0);
        let before: Var = store.var(id).clone();
        let mut meta = MetaTrainer::new(MetaOptimizerKind::Sgd, 0.5).unwrap();
        meta.step(&mut store).unwrap();
        assert_eq!(before.value().data(), &[2.0, 2.0]);
        assert_eq!(store.var(id).value().data(), &[1.5, 1.5]);
    }

    #[test]
    fn test_mismatched_gradient_updates_nothing() {
        let mut store = ParameterStore::new("test");
        let first = store.register("w_in", Tensor::ones([2, 1]), true).unwrap();
        let second = store.register("w_out", Tensor::ones([1, 2]), true).unwrap();
        let grads = vec![
            (first, Tensor::full([2, 1], 1.0)),
            (second, Tensor::full([2, 1], 1.0)),
        ];

        let mut meta = MetaTrainer::new(MetaOptimizerKind::Adam, 0.1).unwrap();
        assert!(matches!(
            meta.apply(&mut store, grads),
            Err(OptimError::ShapeMismatch { .. })
        ));
        assert_eq!(store.var(first).value().data(), &[1.0, 1.0]);
        assert_eq!(store.var(second).value().data(), &[1.0, 1.0]);
        assert!(meta.state.is_empty());
    }

    #[test]
    fn test_rejects_bad_learning_rate() {
        assert!(MetaTrainer::new(MetaOptimizerKind::Adam, 0.0).is_err());
        assert!(MetaTrainer::new(MetaOptimizerKind::Sgd, f32::INFINITY).is_err());
    }
}
