//! Adam as a fixed update rule.
//!
//! # Formula
//!
//! $$
//! \begin{aligned}
//! & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
//! & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
//! & \hat{m}_t = m_t / (1 - \beta_1^t) \\
//! & \hat{v}_t = v_t / (1 - \beta_2^t) \\
//! & \Delta_t = -\eta \, \hat{m}_t / (\sqrt{\hat{v}_t} + \epsilon) \\
//! & x_t = x_{t-1} + \Delta_t
//! \end{aligned}
//! $$
//!
//! The step counter `t` starts at 1. [`adam_update`] is the pure maths; the [`Adam`] rule
//! threads moments and counter through a [`StepState`]. The guided history rules reuse
//! [`adam_update`] for their bootstrap.

use super::{StepContext, StepOutput, UpdateRule, PARAMETER_PREFIX, wrong_state};
use crate::config::AdamConfig;
use crate::error::{OptimError, Result};
use crate::params::ParameterStore;
use crate::state::{MomentState, RuleState, StateKind, StepState};
use crate::tensor::Tensor;
use crate::{Matrix, Var};
use rayon::prelude::*;

/// Result of one Adam update of a single variable.
#[derive(Debug, Clone, PartialEq)]
pub struct AdamUpdate {
    pub value: Matrix,
    pub m: Matrix,
    pub v: Matrix,
    pub delta: Matrix,
}

/// One Adam update of `x` at step `t`.
///
/// # Errors
///
/// Returns `OptimError::ShapeMismatch` if `g`, `m` or `v` does not have the shape of `x`.
pub fn adam_update(
    config: &AdamConfig,
    x: &Matrix,
    g: &Matrix,
    m: &Matrix,
    v: &Matrix,
    t: u64,
) -> Result<AdamUpdate> {
    for (name, other) in [("gradient", g), ("m", m), ("v", v)] {
        if other.shape() != x.shape() {
            return Err(OptimError::ShapeMismatch {
                variable: name.to_string(),
                expected: x.shape().to_vec(),
                got: other.shape().to_vec(),
            });
        }
    }

    let (lr, b1, b2, eps) = (
        config.learning_rate,
        config.beta1,
        config.beta2,
        config.epsilon,
    );
    let t = i32::try_from(t).unwrap_or(i32::MAX);
    let bias_correction1 = 1.0 - b1.powi(t);
    let bias_correction2 = 1.0 - b2.powi(t);

    let mut m_next = m.clone();
    let mut v_next = v.clone();
    let mut delta = Tensor::zeros(*x.shape());
    delta
        .data_mut()
        .par_iter_mut()
        .zip(m_next.data_mut().par_iter_mut())
        .zip(v_next.data_mut().par_iter_mut())
        .zip(g.data().par_iter())
        .for_each(|(((d, m), v), g)| {
            *m = b1 * *m + (1.0 - b1) * *g;
            *v = b2 * *v + (1.0 - b2) * *g * *g;
            let m_hat = *m / bias_correction1;
            let v_hat = *v / bias_correction2;
            *d = -lr * m_hat / (v_hat.sqrt() + eps);
        });

    let value = x.zip_map(&delta, |a, b| a + b)?;
    Ok(AdamUpdate {
        value,
        m: m_next,
        v: v_next,
        delta,
    })
}

/// Adam applied coordinate-wise to every problem variable.
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    store: ParameterStore,
}

impl Adam {
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for `epsilon <= 0` and other out-of-range values.
    pub fn new(config: AdamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store: ParameterStore::new(PARAMETER_PREFIX),
        })
    }

    pub const fn config(&self) -> &AdamConfig {
        &self.config
    }
}

impl UpdateRule for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn state_kind(&self) -> StateKind {
        StateKind::Moments
    }

    fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    fn reset_state(&self, ctx: &mut StepContext<'_>, initial: Vec<Var>) -> Result<StepState> {
        let lengths = ctx.problem.variables_flattened_shape();
        Ok(StepState {
            variables: initial,
            rule: RuleState::Moments(MomentState::zeros(&lengths)),
        })
    }

    fn step(&self, ctx: &mut StepContext<'_>, state: &StepState) -> Result<StepOutput> {
        let RuleState::Moments(moments) = &state.rule else {
            return Err(wrong_state(self.name(), StateKind::Moments, state.rule.kind()));
        };
        let gradients = ctx.flat_gradients(&state.variables)?;
        let flat = ctx.flatten(&state.variables)?;

        let mut next = MomentState {
            m: Vec::with_capacity(flat.len()),
            v: Vec::with_capacity(flat.len()),
            t: moments.t + 1,
        };
        let mut columns = Vec::with_capacity(flat.len());
        let mut deltas = Vec::with_capacity(flat.len());
        for (i, (x, g)) in flat.iter().zip(&gradients).enumerate() {
            let (m, v) = moments
                .m
                .get(i)
                .zip(moments.v.get(i))
                .ok_or_else(|| OptimError::InvalidState(format!("no moments for variable {i}")))?;
            let update = adam_update(&self.config, x.value(), g.value(), m, v, moments.t)?;
            columns.push(Var::new(update.value));
            deltas.push(Var::new(update.delta));
            next.m.push(update.m);
            next.v.push(update.v);
        }

        Ok(StepOutput {
            state: StepState {
                variables: ctx.unflatten(&columns)?,
                rule: RuleState::Moments(next),
            },
            deltas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::{ElementwiseSquare, Problem};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn scalar(v: f32) -> Matrix {
        Tensor::full([1, 1], v)
    }

    #[test]
    fn test_first_step_on_square() {
        // x = 10 on x^2: g = 20
        let config = AdamConfig {
            learning_rate: 0.1,
            ..AdamConfig::default()
        };
        let update = adam_update(
            &config,
            &scalar(10.0),
            &scalar(20.0),
            &scalar(0.0),
            &scalar(0.0),
            1,
        )
        .unwrap();
        assert!((update.m.data()[0] - 2.0).abs() < 1e-5);
        assert!((update.v.data()[0] - 0.4).abs() < 1e-5);
        assert!((update.value.data()[0] - 9.9).abs() < 1e-4);
        assert!(update.value.data()[0] < 10.0);
    }

    #[test]
    fn test_zero_gradient_gives_zero_delta() {
        let update = adam_update(
            &AdamConfig::default(),
            &Tensor::ones([3, 1]),
            &Tensor::zeros([3, 1]),
            &Tensor::zeros([3, 1]),
            &Tensor::zeros([3, 1]),
            1,
        )
        .unwrap();
        assert!(update.delta.data().iter().all(|d| *d == 0.0));
        assert_eq!(update.value.data(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_shape_mismatch() {
        let result = adam_update(
            &AdamConfig::default(),
            &Tensor::ones([3, 1]),
            &Tensor::zeros([2, 1]),
            &Tensor::zeros([3, 1]),
            &Tensor::zeros([3, 1]),
            1,
        );
        assert!(matches!(result, Err(OptimError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_invalid_epsilon() {
        for epsilon in [0.0, -1e-8, f32::NAN] {
            let config = AdamConfig {
                epsilon,
                ..AdamConfig::default()
            };
            assert!(matches!(Adam::new(config), Err(OptimError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_rule_step_counts_and_is_pure() {
        let problem = ElementwiseSquare::from_values(vec![10.0]).unwrap();
        let rule = Adam::new(AdamConfig {
            learning_rate: 0.1,
            ..AdamConfig::default()
        })
        .unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let mut ctx = StepContext {
            problem: &problem,
            second_derivatives: false,
            rng: &mut rng,
        };
        let initial = problem.initial_values().into_iter().map(Var::new).collect();
        let mut state = rule.reset_state(&mut ctx, initial).unwrap();

        let out = rule.step(&mut ctx, &state).unwrap();
        // The input state is untouched until the update is applied
        assert_eq!(state.variables[0].value().data(), &[10.0]);
        let RuleState::Moments(m) = &out.state.rule else {
            panic!("expected moments");
        };
        assert_eq!(m.t, 2);
        assert!((m.m[0].data()[0] - 2.0).abs() < 1e-5);
        assert!((m.v[0].data()[0] - 0.4).abs() < 1e-5);
        assert!((out.deltas[0].value().data()[0] + 0.1).abs() < 1e-4);

        rule.apply_updates(&mut state, out.state);
        assert!((state.variables[0].value().data()[0] - 9.9).abs() < 1e-4);

        state.rule = RuleState::Stateless;
        assert!(matches!(
            rule.step(&mut ctx, &state),
            Err(OptimError::InvalidState(_))
        ));
    }
}
