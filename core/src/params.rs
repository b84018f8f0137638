//! Registry of update-rule parameters.
//!
//! Every learned update rule creates exactly one [`ParameterStore`] when it is constructed and
//! registers its weights there. Layers keep only [`ParamId`] handles. The meta-trainer
//! updates exactly the trainable entries of that store, and checkpoints persist exactly them.
//! Nothing is discovered from ambient state.

use crate::error::{OptimError, Result};
use crate::tensor::Tensor;
use crate::{Matrix, Var};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use std::collections::HashMap;

/// Handle to a registered parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(usize);

/// Initial value distribution of a parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    /// A fixed value in every entry.
    Constant(f32),
    /// `N(0, std)`.
    Normal { std: f32 },
    /// Glorot/Xavier uniform: `U(-a, a)` with `a = sqrt(6 / (fan_in + fan_out))`.
    XavierUniform,
}

impl Init {
    /// Draws a `shape` matrix.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for a degenerate distribution.
    pub fn sample<R: Rng + ?Sized>(&self, shape: [usize; 2], rng: &mut R) -> Result<Matrix> {
        let n = shape[0] * shape[1];
        let data: Vec<f32> = match *self {
            Self::Zeros => vec![0.0; n],
            Self::Constant(value) => vec![value; n],
            Self::Normal { std } => {
                let dist = Normal::new(0.0f32, std)
                    .map_err(|e| OptimError::InvalidConfig(format!("normal init: {e}")))?;
                (0..n).map(|_| dist.sample(rng)).collect()
            }
            Self::XavierUniform => {
                let limit = (6.0 / (shape[0] + shape[1]).max(1) as f32).sqrt();
                let dist = Uniform::new_inclusive(-limit, limit)
                    .map_err(|e| OptimError::InvalidConfig(format!("xavier init: {e}")))?;
                (0..n).map(|_| dist.sample(rng)).collect()
            }
        };
        Ok(Tensor::new(data, shape)?)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    var: Var,
    trainable: bool,
}

/// Ordered, named collection of parameter leaves.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    prefix: String,
    entries: Vec<Entry>,
}

impl ParameterStore {
    /// Creates an empty store whose checkpoint keys start with `prefix/`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: Vec::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Registers a new parameter.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` if `name` is already registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        value: Matrix,
        trainable: bool,
    ) -> Result<ParamId> {
        let name = name.into();
        if self.entries.iter().any(|e| e.name == name) {
            return Err(OptimError::InvalidConfig(format!(
                "parameter '{name}' registered twice"
            )));
        }
        self.entries.push(Entry {
            name,
            var: Var::new(value),
            trainable,
        });
        Ok(ParamId(self.entries.len() - 1))
    }

    /// Samples and registers a parameter.
    ///
    /// # Errors
    ///
    /// See [`Init::sample`] and [`ParameterStore::register`].
    pub fn init<R: Rng + ?Sized>(
        &mut self,
        name: impl Into<String>,
        shape: [usize; 2],
        init: Init,
        rng: &mut R,
    ) -> Result<ParamId> {
        let value = init.sample(shape, rng)?;
        self.register(name, value, true)
    }

    /// The graph leaf of a parameter. Clones share its gradient cell.
    ///
    /// # Panics
    ///
    /// Never for an id issued by this store.
    pub fn var(&self, id: ParamId) -> &Var {
        &self.entries[id.0].var
    }

    pub fn name(&self, id: ParamId) -> &str {
        &self.entries[id.0].name
    }

    pub fn is_trainable(&self, id: ParamId) -> bool {
        self.entries[id.0].trainable
    }

    /// Replaces the value of a parameter with a fresh leaf.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::ShapeMismatch` if the shape changes.
    pub fn set_value(&mut self, id: ParamId, value: Matrix) -> Result<()> {
        let entry = &mut self.entries[id.0];
        if entry.var.shape() != value.shape() {
            return Err(OptimError::ShapeMismatch {
                variable: entry.name.clone(),
                expected: entry.var.shape().to_vec(),
                got: value.shape().to_vec(),
            });
        }
        entry.var = Var::new(value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of all parameters, in registration order.
    pub fn ids(&self) -> impl Iterator<Item = ParamId> + '_ {
        (0..self.entries.len()).map(ParamId)
    }

    /// Ids of the parameters that receive meta-gradients.
    pub fn trainable_ids(&self) -> impl Iterator<Item = ParamId> + '_ {
        self.ids().filter(|&id| self.is_trainable(id))
    }

    /// `true` if at least one parameter is trainable.
    pub fn has_trainable(&self) -> bool {
        self.entries.iter().any(|e| e.trainable)
    }

    /// Total number of trainable scalars.
    pub fn num_trainable_elements(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.trainable)
            .map(|e| e.var.value().size())
            .sum()
    }

    /// Clears the gradients of every parameter.
    pub fn zero_grad(&self) {
        for entry in &self.entries {
            entry.var.zero_grad();
        }
    }

    /// Checkpoint key of a parameter: `prefix/name`.
    pub fn key(&self, id: ParamId) -> String {
        format!("{}/{}", self.prefix, self.entries[id.0].name)
    }

    /// Trainable parameters keyed by [`ParameterStore::key`].
    pub fn state_dict(&self) -> Vec<(String, Matrix)> {
        self.trainable_ids()
            .map(|id| (self.key(id), self.var(id).value().clone()))
            .collect()
    }

    /// Restores trainable parameters from a state dict.
    ///
    /// Every trainable parameter must be present with its registered element count. Extra
    /// keys are rejected too, so a checkpoint of a differently shaped optimizer never loads
    /// silently.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::Checkpoint` on a missing, extra or mis-sized entry.
    pub fn load_state_dict(&mut self, state: HashMap<String, Vec<f32>>) -> Result<()> {
        let mut state = state;
        let ids: Vec<ParamId> = self.trainable_ids().collect();
        let mut restored = Vec::with_capacity(ids.len());
        for id in ids {
            let key = self.key(id);
            let data = state
                .remove(&key)
                .ok_or_else(|| OptimError::Checkpoint(format!("missing parameter '{key}'")))?;
            let shape = *self.var(id).shape();
            let value = Tensor::new(data, shape).map_err(|_| {
                OptimError::Checkpoint(format!("parameter '{key}' does not match shape {shape:?}"))
            })?;
            restored.push((id, value));
        }
        if let Some(extra) = state.keys().next() {
            return Err(OptimError::Checkpoint(format!(
                "unexpected parameter '{extra}'"
            )));
        }
        for (id, value) in restored {
            self.set_value(id, value)?;
        }
        Ok(())
    }
}
