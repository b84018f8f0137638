//! Update rules.
//!
//! # What is an Update Rule?
//!
//! An update rule maps the current variable values (and whatever it remembers about earlier
//! steps) to new values. Classic optimizers use a closed form; learned optimizers compute the
//! update with a small network whose weights are themselves trained.
//!
//! | Rule | State | Trainable | Network input |
//! |---|---|---|---|
//! | [`Adam`] | moments | no | n/a |
//! | [`Lstm`] | LSTM hidden state | yes | preprocessed gradient |
//! | [`MlpSimple`] | none | yes | preprocessed gradient |
//! | [`MlpMovingAverage`] | gradient EMA | yes | preprocessed gradient |
//! | [`MlpGradHistory`] | gradient ring buffer | yes | gradient history |
//! | [`MlpXHistory`] | value + sign ring buffers | yes | normalised value and sign history |
//! | [`GuidedHistory`] | value + gradient ring buffers | no | n/a |
//!
//! All rules work on flattened `[len, 1]` columns: each coordinate of a variable is one row,
//! so one network serves every variable regardless of its shape.
//!
//! # Protocol
//!
//! [`UpdateRule::step`] is pure: it reads a [`StepState`] and returns the next one without
//! touching the rule. The engine chains `unroll_len()` steps, keeps the results on the tape
//! for meta-training and finally commits the last state with [`UpdateRule::apply_updates`].

pub mod adam;
pub mod lstm;
pub mod mlp;
pub mod xhistory;

pub use adam::{Adam, AdamUpdate, adam_update};
pub use lstm::Lstm;
pub use mlp::{MlpGradHistory, MlpMovingAverage, MlpSimple};
pub use xhistory::{GradientSignal, GuidedHistory, MlpXHistory};

use crate::config::RuleConfig;
use crate::error::{OptimError, Result};
use crate::params::ParameterStore;
use crate::preprocess::Preprocessor;
use crate::problem::Problem;
use crate::state::{StateKind, StepState};
use crate::Var;
use rand::rngs::StdRng;
use std::fmt::Debug;

/// Key prefix of every rule parameter.
pub const PARAMETER_PREFIX: &str = "optimizer_core";

/// What a rule may use during a step besides its own parameters.
pub struct StepContext<'a> {
    pub problem: &'a dyn Problem,
    /// Ask the problem for differentiable gradients.
    pub second_derivatives: bool,
    pub rng: &'a mut StdRng,
}

impl StepContext<'_> {
    /// Gradients at `values`, flattened to `[len, 1]` columns.
    ///
    /// Without `second_derivatives` the gradients are cut from the graph.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::ShapeMismatch` if the problem returns the wrong number of
    /// gradients or a gradient with the wrong number of elements.
    pub fn flat_gradients(&self, values: &[Var]) -> Result<Vec<Var>> {
        let gradients = self.problem.gradients(values, self.second_derivatives)?;
        if gradients.len() != values.len() {
            return Err(OptimError::ShapeMismatch {
                variable: "gradients".to_string(),
                expected: vec![values.len()],
                got: vec![gradients.len()],
            });
        }
        gradients
            .iter()
            .enumerate()
            .map(|(i, g)| {
                let flat = self.problem.flatten(g, i)?;
                Ok(if self.second_derivatives {
                    flat
                } else {
                    flat.detach()
                })
            })
            .collect()
    }

    /// Preprocessed flat gradients at `values`.
    ///
    /// # Errors
    ///
    /// See [`StepContext::flat_gradients`].
    pub fn preprocessed_gradients(
        &self,
        values: &[Var],
        preprocessor: &Preprocessor,
    ) -> Result<Vec<Var>> {
        self.flat_gradients(values)?
            .iter()
            .map(|g| preprocessor.transform(g))
            .collect()
    }

    /// Every value flattened to a `[len, 1]` column.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::ShapeMismatch` if a value has the wrong number of elements.
    pub fn flatten(&self, values: &[Var]) -> Result<Vec<Var>> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| self.problem.flatten(v, i))
            .collect()
    }

    /// Every `[len, 1]` column restored to its native shape.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::ShapeMismatch` if a column has the wrong length.
    pub fn unflatten(&self, columns: &[Var]) -> Result<Vec<Var>> {
        columns
            .iter()
            .enumerate()
            .map(|(i, c)| self.problem.set_shape(c, i))
            .collect()
    }
}

/// Next state of one step plus the raw per-variable deltas it applied.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub state: StepState,
    /// Network (or closed-form) output per variable, `[len, 1]`, before any scaling.
    pub deltas: Vec<Var>,
}

/// A parameter update rule driven by the engine.
pub trait UpdateRule: Debug {
    fn name(&self) -> &'static str;

    /// Kind of [`RuleState`](crate::state::RuleState) this rule carries.
    fn state_kind(&self) -> StateKind;

    /// Rule invocations per engine step.
    fn unroll_len(&self) -> usize {
        1
    }

    fn parameters(&self) -> &ParameterStore;

    fn parameters_mut(&mut self) -> &mut ParameterStore;

    /// Fresh state for an episode starting at `initial`.
    ///
    /// Rules that bootstrap their history may move the variables away from `initial`.
    ///
    /// # Errors
    ///
    /// Returns an error if the problem rejects the values.
    fn reset_state(&self, ctx: &mut StepContext<'_>, initial: Vec<Var>) -> Result<StepState>;

    /// Computes the next state without committing it.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::ShapeMismatch` if a gradient or delta has the wrong length and
    /// `OptimError::InvalidState` if `state` was not produced by this rule.
    fn step(&self, ctx: &mut StepContext<'_>, state: &StepState) -> Result<StepOutput>;

    /// Commits `next` as the current state, cut from the graph.
    fn apply_updates(&self, state: &mut StepState, next: StepState) {
        *state = next.detach();
    }
}

/// Builds the rule selected by `config`, drawing initial weights from `rng`.
///
/// # Errors
///
/// Returns `OptimError::InvalidConfig` if the rule configuration is invalid.
pub fn build_rule(config: &RuleConfig, rng: &mut StdRng) -> Result<Box<dyn UpdateRule>> {
    config.validate()?;
    Ok(match *config {
        RuleConfig::Adam(c) => Box::new(Adam::new(c)?),
        RuleConfig::Lstm(c) => Box::new(Lstm::new(c, rng)?),
        RuleConfig::MlpSimple(c) => Box::new(MlpSimple::new(c, rng)?),
        RuleConfig::MlpMovingAverage(c) => Box::new(MlpMovingAverage::new(c, rng)?),
        RuleConfig::MlpGradHistory(c) => Box::new(MlpGradHistory::new(c, rng)?),
        RuleConfig::MlpXHistory(c) => Box::new(MlpXHistory::new(c, rng)?),
        RuleConfig::XHistoryGradNorm(c) => Box::new(GuidedHistory::new(c, GradientSignal::Raw)?),
        RuleConfig::XHistorySign(c) => Box::new(GuidedHistory::new(c, GradientSignal::Sign)?),
    })
}

/// Checks that `delta` is a `[len, 1]` column for variable `index`.
///
/// # Errors
///
/// Returns `OptimError::ShapeMismatch` otherwise.
pub(crate) fn check_delta(problem: &dyn Problem, index: usize, delta: &Var) -> Result<()> {
    let len = problem
        .variables_flattened_shape()
        .get(index)
        .copied()
        .ok_or_else(|| OptimError::InvalidState(format!("no variable at index {index}")))?;
    if *delta.shape() != [len, 1] {
        let name = problem
            .variables()
            .get(index)
            .map_or_else(String::new, |spec| spec.name.clone());
        return Err(OptimError::ShapeMismatch {
            variable: name,
            expected: vec![len, 1],
            got: delta.shape().to_vec(),
        });
    }
    Ok(())
}

/// `x + scale * delta`, with `x` in native shape and `delta` a `[len, 1]` column.
///
/// # Errors
///
/// Returns `OptimError::ShapeMismatch` if `delta` does not fit variable `index`.
pub(crate) fn apply_delta(
    problem: &dyn Problem,
    index: usize,
    x: &Var,
    delta: &Var,
    scale: &Var,
) -> Result<Var> {
    check_delta(problem, index, delta)?;
    let flat = problem.flatten(x, index)?;
    let next = flat.add(&delta.mul(scale)?)?;
    problem.set_shape(&next, index)
}

/// Error for a state of the wrong kind.
pub(crate) fn wrong_state(rule: &str, expected: StateKind, got: StateKind) -> OptimError {
    OptimError::InvalidState(format!(
        "rule '{rule}' expects {expected:?} state, got {got:?}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdamConfig, LstmConfig};
    use crate::problem::{ElementwiseSquare, LinearRegression};
    use crate::tensor::Tensor;
    use rand::SeedableRng;

    #[test]
    fn test_flat_gradients_are_columns() {
        let problem = LinearRegression::new(6, 3, 2, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let ctx = StepContext {
            problem: &problem,
            second_derivatives: false,
            rng: &mut rng,
        };
        let values: Vec<Var> = problem.initial_values().into_iter().map(Var::new).collect();
        let grads = ctx.flat_gradients(&values).unwrap();
        assert_eq!(grads[0].shape(), &[6, 1]);
        assert_eq!(grads[1].shape(), &[2, 1]);
        assert!(grads.iter().all(|g| !g.is_tracked()));
    }

    #[test]
    fn test_second_derivatives_keep_the_graph() {
        let problem = ElementwiseSquare::from_values(vec![1.0, 2.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let ctx = StepContext {
            problem: &problem,
            second_derivatives: true,
            rng: &mut rng,
        };
        let x = Var::new(Tensor::new(vec![1.0, 2.0], [2, 1]).unwrap());
        let grads = ctx.flat_gradients(&[x.clone()]).unwrap();
        grads[0].sum().backward().unwrap();
        assert_eq!(x.grad_tensor().unwrap().data(), &[2.0, 2.0]);
    }

    #[test]
    fn test_apply_delta_checks_length() {
        let problem = ElementwiseSquare::from_values(vec![1.0, 2.0]).unwrap();
        let x = Var::new(Tensor::new(vec![1.0, 2.0], [2, 1]).unwrap());
        let scale = Var::scalar(0.5);

        let delta = Var::new(Tensor::new(vec![2.0, -2.0], [2, 1]).unwrap());
        let next = apply_delta(&problem, 0, &x, &delta, &scale).unwrap();
        assert_eq!(next.value().data(), &[2.0, 1.0]);

        let short = Var::new(Tensor::new(vec![2.0], [1, 1]).unwrap());
        assert!(matches!(
            apply_delta(&problem, 0, &x, &short, &scale),
            Err(OptimError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_build_rule_by_name() {
        let mut rng = StdRng::seed_from_u64(0);
        let adam = build_rule(&RuleConfig::Adam(AdamConfig::default()), &mut rng).unwrap();
        assert_eq!(adam.name(), "adam");
        assert!(!adam.parameters().has_trainable());

        let lstm = build_rule(&RuleConfig::Lstm(LstmConfig::default()), &mut rng).unwrap();
        assert_eq!(lstm.unroll_len(), 20);
        assert_eq!(lstm.state_kind(), StateKind::Hidden);
        assert!(lstm.parameters().has_trainable());
    }
}
