//! Rules that propose points inside the range of recently visited values.
//!
//! Both rules keep, per variable, a ring buffer of the last `limit` values and one of the
//! gradients seen at those values. A new point is placed relative to the centre
//! `ref = (max + min) / 2` and the width `diff = max - min` of the value history, row by row:
//!
//! - [`MlpXHistory`] (learned): the network reads the min-max normalised value history next to
//!   the gradient-sign history and outputs `o = tanh(net) / 1.4`, giving
//!   `x' = ref + o * (diff + 1e-7)`. `|o| < 1/1.4` keeps the proposal within the visited
//!   range, slightly extended.
//! - [`GuidedHistory`] (fixed): `delta = rowmean(normalise(G))` where `G` is the gradient
//!   history ([`GradientSignal::Raw`]) or its sign ([`GradientSignal::Sign`]), and
//!   `x' = ref - delta * diff * (1 + n)` with multiplicative noise `n ~ N(0, sigma)`.
//!
//! # Bootstrap
//!
//! An empty history has no range, so both rules fill it before the first step by following a
//! guide optimizer for `limit` points:
//!
//! | Rule | Guide | Variables after reset |
//! |---|---|---|
//! | `MlpXHistory` | gradient descent `x - 0.1 g` | unchanged (initial value) |
//! | `GuidedHistory` | Adam, `lr = 0.01` | the guide's last point |

use super::{StepContext, StepOutput, UpdateRule, PARAMETER_PREFIX, adam_update, check_delta, wrong_state};
use crate::config::{AdamConfig, GuidedHistoryConfig, Normalization, XHistoryConfig};
use crate::error::{OptimError, Result};
use crate::nn::Mlp;
use crate::params::ParameterStore;
use crate::state::{
    RANGE_EPSILON, RuleState, StateKind, StepState, VariableHistory, inf_norm_normalize,
    min_max_normalize, min_max_symmetric, row_range,
};
use crate::tensor::Tensor;
use crate::{Matrix, Var};
use rand::Rng;
use rand_distr::{Distribution, Normal};

const OUTPUT_DAMPING: f32 = 1.4;

/// Sign of each gradient column, detached.
fn signs(gradients: &[Var]) -> Vec<Var> {
    gradients.iter().map(|g| g.sign().detach()).collect()
}

fn variable_history(state: &StepState, rule: &str) -> Result<VariableHistory> {
    match &state.rule {
        RuleState::VariableHistory(h) if h.values.num_variables() == state.variables.len() => {
            Ok(h.clone())
        }
        RuleState::VariableHistory(h) => Err(OptimError::InvalidState(format!(
            "history holds {} variables, state has {}",
            h.values.num_variables(),
            state.variables.len()
        ))),
        other => Err(wrong_state(rule, StateKind::VariableHistory, other.kind())),
    }
}

/// Learned variable-history rule.
#[derive(Debug, Clone)]
pub struct MlpXHistory {
    config: XHistoryConfig,
    store: ParameterStore,
    network: Mlp,
}

impl MlpXHistory {
    /// The network reads `2 * limit` columns: normalised values, then gradient signs.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for an invalid configuration.
    pub fn new<R: Rng + ?Sized>(config: XHistoryConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let mut store = ParameterStore::new(PARAMETER_PREFIX);
        let network = Mlp::new(
            &mut store,
            2 * config.limit,
            1,
            config.layer_width,
            config.hidden_layers,
            rng,
        )?;
        Ok(Self {
            config,
            store,
            network,
        })
    }
}

impl UpdateRule for MlpXHistory {
    fn name(&self) -> &'static str {
        "mlp_x_history"
    }

    fn state_kind(&self) -> StateKind {
        StateKind::VariableHistory
    }

    fn unroll_len(&self) -> usize {
        self.config.unroll_len
    }

    fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    fn reset_state(&self, ctx: &mut StepContext<'_>, initial: Vec<Var>) -> Result<StepState> {
        let lengths = ctx.problem.variables_flattened_shape();
        let mut history = VariableHistory::zeros(&lengths, self.config.limit)?;

        let mut points = ctx.flatten(&initial)?;
        for k in 0..self.config.limit {
            let gradients = ctx.flat_gradients(&ctx.unflatten(&points)?)?;
            history.write(&points, &signs(&gradients))?;
            if k + 1 < self.config.limit {
                points = points
                    .iter()
                    .zip(&gradients)
                    .map(|(x, g)| Ok(x.sub(&g.scale(self.config.guide_step))?.detach()))
                    .collect::<Result<Vec<_>>>()?;
            }
        }

        Ok(StepState {
            variables: initial,
            rule: RuleState::VariableHistory(history),
        })
    }

    fn step(&self, ctx: &mut StepContext<'_>, state: &StepState) -> Result<StepOutput> {
        let mut history = variable_history(state, self.name())?;

        let mut columns = Vec::with_capacity(state.variables.len());
        let mut deltas = Vec::with_capacity(state.variables.len());
        for i in 0..state.variables.len() {
            let values = history.values.read_recent(i)?;
            let input = Var::concat_columns(&[
                &min_max_normalize(&values)?,
                &history.gradients.read_recent(i)?,
            ])?;
            let output = self
                .network
                .forward(&self.store, &input)?
                .tanh()
                .scale(1.0 / OUTPUT_DAMPING);
            check_delta(ctx.problem, i, &output)?;

            let (max, min) = row_range(&values)?;
            let centre = max.add(&min)?.scale(0.5);
            let width = max.sub(&min)?.add_scalar(RANGE_EPSILON);
            columns.push(centre.add(&output.mul(&width)?)?);
            deltas.push(output);
        }

        let variables = ctx.unflatten(&columns)?;
        let gradients = ctx.flat_gradients(&variables)?;
        history.write(&columns, &signs(&gradients))?;

        Ok(StepOutput {
            state: StepState {
                variables,
                rule: RuleState::VariableHistory(history),
            },
            deltas,
        })
    }
}

/// What a [`GuidedHistory`] rule averages over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientSignal {
    /// The gradient history itself (`x_history_grad_norm`).
    Raw,
    /// Its element-wise sign (`x_history_sign`).
    Sign,
}

/// Non-learned variable-history rule with an Adam-guided bootstrap.
#[derive(Debug, Clone)]
pub struct GuidedHistory {
    config: GuidedHistoryConfig,
    signal: GradientSignal,
    noise: Normal<f32>,
    store: ParameterStore,
}

impl GuidedHistory {
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for an invalid configuration.
    pub fn new(config: GuidedHistoryConfig, signal: GradientSignal) -> Result<Self> {
        config.validate()?;
        let noise = Normal::new(0.0, config.noise_stddev)
            .map_err(|e| OptimError::InvalidConfig(format!("noise_stddev: {e}")))?;
        Ok(Self {
            config,
            signal,
            noise,
            store: ParameterStore::new(PARAMETER_PREFIX),
        })
    }

    pub const fn signal(&self) -> GradientSignal {
        self.signal
    }

    fn normalise(&self, history: &Var) -> Result<Var> {
        let history = match self.signal {
            GradientSignal::Raw => history.clone(),
            GradientSignal::Sign => history.sign(),
        };
        match self.config.normalization {
            Normalization::InfNorm => inf_norm_normalize(&history),
            Normalization::MinMax => min_max_symmetric(&history),
        }
    }

    fn sample_noise<R: Rng + ?Sized>(&self, rows: usize, rng: &mut R) -> Result<Matrix> {
        let data = (0..rows).map(|_| self.noise.sample(rng)).collect();
        Ok(Tensor::new(data, [rows, 1])?)
    }
}

impl UpdateRule for GuidedHistory {
    fn name(&self) -> &'static str {
        match self.signal {
            GradientSignal::Raw => "x_history_grad_norm",
            GradientSignal::Sign => "x_history_sign",
        }
    }

    fn state_kind(&self) -> StateKind {
        StateKind::VariableHistory
    }

    fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    fn reset_state(&self, ctx: &mut StepContext<'_>, initial: Vec<Var>) -> Result<StepState> {
        let lengths = ctx.problem.variables_flattened_shape();
        let mut history = VariableHistory::zeros(&lengths, self.config.limit)?;
        let guide = AdamConfig {
            learning_rate: self.config.guide_learning_rate,
            ..AdamConfig::default()
        };

        let mut points: Vec<Matrix> = ctx
            .flatten(&initial)?
            .iter()
            .map(|p| p.value().clone())
            .collect();
        let mut m: Vec<Matrix> = lengths.iter().map(|&n| Tensor::zeros([n, 1])).collect();
        let mut v = m.clone();
        for k in 0..self.config.limit {
            let columns: Vec<Var> = points.iter().cloned().map(Var::new).collect();
            let gradients = ctx.flat_gradients(&ctx.unflatten(&columns)?)?;
            history.write(&columns, &gradients)?;
            if k + 1 < self.config.limit {
                let t = k as u64 + 1;
                for (i, g) in gradients.iter().enumerate() {
                    let update = adam_update(&guide, &points[i], g.value(), &m[i], &v[i], t)?;
                    points[i] = update.value;
                    m[i] = update.m;
                    v[i] = update.v;
                }
            }
        }

        let columns: Vec<Var> = points.into_iter().map(Var::new).collect();
        Ok(StepState {
            variables: ctx.unflatten(&columns)?,
            rule: RuleState::VariableHistory(history),
        })
    }

    fn step(&self, ctx: &mut StepContext<'_>, state: &StepState) -> Result<StepOutput> {
        let mut history = variable_history(state, self.name())?;

        let mut columns = Vec::with_capacity(state.variables.len());
        let mut deltas = Vec::with_capacity(state.variables.len());
        for i in 0..state.variables.len() {
            let delta = self
                .normalise(&history.gradients.read_recent(i)?)?
                .row_mean();
            check_delta(ctx.problem, i, &delta)?;

            let (max, min) = row_range(history.values.raw(i)?)?;
            let centre = max.add(&min)?.scale(0.5);
            let width = max.sub(&min)?;
            let noise = Var::new(self.sample_noise(delta.shape()[0], ctx.rng)?.map(|n| 1.0 + n));
            columns.push(centre.sub(&delta.mul(&width)?.mul(&noise)?)?);
            deltas.push(delta);
        }

        let variables = ctx.unflatten(&columns)?;
        let gradients = ctx.flat_gradients(&variables)?;
        history.write(&columns, &gradients)?;

        Ok(StepOutput {
            state: StepState {
                variables,
                rule: RuleState::VariableHistory(history),
            },
            deltas,
        })
    }
}
