//! Long Short-Term Memory cells.
//!
//! # The Cell
//!
//! One LSTM cell maps an input `x` and a state `(c, h)` to a new state:
//!
//! $$
//! \begin{aligned}
//! [i, j, f, o] &= [x, h] W + b \\
//! c' &= c \odot \sigma(f + 1) + \sigma(i) \odot \tanh(j) \\
//! h' &= \tanh(c') \odot \sigma(o)
//! \end{aligned}
//! $$
//!
//! The `+ 1` on the forget gate makes a freshly initialised cell keep most of its memory.
//! The gate columns are laid out `i | j | f | o`, each `state_size` wide.
//!
//! > [!TIP]
//! > **Expert Note: Coordinate-wise Recurrence**
//! > A learned optimizer runs the same cell on every coordinate of every problem variable. The
//! > batch dimension is the coordinate index, so a variable of length `n` gives a state of
//! > `[n, state_size]`, while the weights stay `[in + state_size, 4 state_size]` regardless of
//! > the problem.

use super::{Activation, Linear, Module};
use crate::error::{OptimError, Result};
use crate::params::{Init, ParamId, ParameterStore};
use crate::{Matrix, Var};
use rand::Rng;

const FORGET_BIAS: f32 = 1.0;

/// Recurrent state `(c, h)` of one cell for one problem variable.
#[derive(Debug, Clone)]
pub struct LstmState {
    pub c: Var,
    pub h: Var,
}

impl LstmState {
    /// Zero state for `batch` coordinates.
    pub fn zeros(batch: usize, state_size: usize) -> Self {
        Self {
            c: Var::zeros([batch, state_size]),
            h: Var::zeros([batch, state_size]),
        }
    }

    /// Cuts the state from the graph.
    pub fn detach(&self) -> Self {
        Self {
            c: self.c.detach(),
            h: self.h.detach(),
        }
    }

    /// Plain values, for comparisons.
    pub fn values(&self) -> (Matrix, Matrix) {
        (self.c.value().clone(), self.h.value().clone())
    }
}

/// A single LSTM cell.
#[derive(Debug, Clone)]
pub struct LstmCell {
    gates: Linear,
    state_size: usize,
}

impl LstmCell {
    /// Registers `<scope>/kernel` and `<scope>/bias`.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for zero sizes or taken names.
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParameterStore,
        scope: &str,
        input_size: usize,
        state_size: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if input_size == 0 || state_size == 0 {
            return Err(OptimError::InvalidConfig(format!(
                "lstm sizes must be positive, got input={input_size} state={state_size}"
            )));
        }
        let gates = Linear::new(
            store,
            &format!("{scope}/kernel"),
            &format!("{scope}/bias"),
            input_size + state_size,
            4 * state_size,
            Init::XavierUniform,
            Init::Zeros,
            rng,
        )?;
        Ok(Self { gates, state_size })
    }

    pub const fn state_size(&self) -> usize {
        self.state_size
    }

    /// One recurrence step. Returns the new state; its `h` is the cell output.
    ///
    /// # Errors
    ///
    /// Returns a shape error if `x` or `state` do not match the cell.
    pub fn forward(&self, store: &ParameterStore, x: &Var, state: &LstmState) -> Result<LstmState> {
        let n = self.state_size;
        let joined = Var::concat_columns(&[x, &state.h])?;
        let z = self.gates.forward(store, &joined)?;
        let gate = |k: usize| -> Result<Var> {
            let columns: Vec<usize> = (k * n..(k + 1) * n).collect();
            Ok(z.select_columns(&columns)?)
        };
        let (i, j, f, o) = (gate(0)?, gate(1)?, gate(2)?, gate(3)?);

        let keep = state
            .c
            .mul(&Activation::Sigmoid.apply(&f.add_scalar(FORGET_BIAS)))?;
        let write = Activation::Sigmoid
            .apply(&i)
            .mul(&Activation::Tanh.apply(&j))?;
        let c = keep.add(&write)?;
        let h = Activation::Tanh.apply(&c).mul(&Activation::Sigmoid.apply(&o))?;
        Ok(LstmState { c, h })
    }
}

impl Module for LstmCell {
    fn parameters(&self) -> Vec<ParamId> {
        self.gates.parameters()
    }
}

/// `num_layers` stacked cells followed by a projection to one value per coordinate.
#[derive(Debug, Clone)]
pub struct StackedLstm {
    cells: Vec<LstmCell>,
    projection: Linear,
}

impl StackedLstm {
    /// Registers `rnn/cell_<l>/{kernel,bias}` for every layer and
    /// `rnn_linear/{softmax_w,softmax_b}` for the projection.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for zero sizes.
    pub fn new<R: Rng + ?Sized>(
        store: &mut ParameterStore,
        input_size: usize,
        state_size: usize,
        num_layers: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if num_layers == 0 {
            return Err(OptimError::InvalidConfig(
                "lstm needs at least one layer".to_string(),
            ));
        }
        let mut cells = Vec::with_capacity(num_layers);
        for layer in 0..num_layers {
            let width = if layer == 0 { input_size } else { state_size };
            cells.push(LstmCell::new(
                store,
                &format!("rnn/cell_{layer}"),
                width,
                state_size,
                rng,
            )?);
        }
        let projection = Linear::new(
            store,
            "rnn_linear/softmax_w",
            "rnn_linear/softmax_b",
            state_size,
            1,
            Init::XavierUniform,
            Init::Zeros,
            rng,
        )?;
        Ok(Self { cells, projection })
    }

    pub fn num_layers(&self) -> usize {
        self.cells.len()
    }

    pub fn state_size(&self) -> usize {
        self.cells.first().map_or(0, LstmCell::state_size)
    }

    /// Zero states for one variable of `batch` coordinates.
    pub fn zero_state(&self, batch: usize) -> Vec<LstmState> {
        self.cells
            .iter()
            .map(|cell| LstmState::zeros(batch, cell.state_size()))
            .collect()
    }

    /// Runs all layers on `x` and projects the top output to `[batch, 1]`.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidState` if `states` has the wrong number of layers, and
    /// shape errors for mismatched inputs.
    pub fn forward(
        &self,
        store: &ParameterStore,
        x: &Var,
        states: &[LstmState],
    ) -> Result<(Var, Vec<LstmState>)> {
        if states.len() != self.cells.len() {
            return Err(OptimError::InvalidState(format!(
                "expected {} lstm layer states, got {}",
                self.cells.len(),
                states.len()
            )));
        }
        let mut input = x.clone();
        let mut next = Vec::with_capacity(states.len());
        for (cell, state) in self.cells.iter().zip(states) {
            let new_state = cell.forward(store, &input, state)?;
            input = new_state.h.clone();
            next.push(new_state);
        }
        let output = self.projection.forward(store, &input)?;
        Ok((output, next))
    }
}

impl Module for StackedLstm {
    fn parameters(&self) -> Vec<ParamId> {
        self.cells
            .iter()
            .flat_map(LstmCell::parameters)
            .chain(self.projection.parameters())
            .collect()
    }
}
