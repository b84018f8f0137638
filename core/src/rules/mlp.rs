//! Feed-forward update rules.
//!
//! All three rules run the same [`Mlp`] coordinate-wise and scale its output by a learning rate:
//!
//! $$
//! x_{t+1} = x_t + \eta \, \mathrm{MLP}(u_t)
//! $$
//!
//! They differ in the input `u_t` and in the state they carry:
//!
//! - [`MlpSimple`]: the preprocessed gradient. No state.
//! - [`MlpMovingAverage`]: the preprocessed gradient. Also tracks an exponential moving average
//!   `avg' = 0.9 avg + 0.1 pre(g(x_{t+1}))` that the network never reads.
//! - [`MlpGradHistory`]: the last `limit` preprocessed gradients, newest first. The buffer
//!   starts filled with copies of the gradient at the initial point and receives the gradient
//!   at every new point.

use super::{StepContext, StepOutput, UpdateRule, PARAMETER_PREFIX, apply_delta, wrong_state};
use crate::config::{GradHistoryConfig, MlpConfig};
use crate::error::{OptimError, Result};
use crate::nn::Mlp;
use crate::params::{ParamId, ParameterStore};
use crate::state::{HistoryBuffer, RuleState, StateKind, StepState};
use crate::tensor::Tensor;
use crate::Var;
use rand::Rng;

const AVERAGE_DECAY: f32 = 0.9;

/// Network, parameter store and learning rate shared by the feed-forward rules.
#[derive(Debug, Clone)]
struct FeedForward {
    store: ParameterStore,
    network: Mlp,
    learning_rate: ParamId,
}

impl FeedForward {
    fn new<R: Rng + ?Sized>(config: &MlpConfig, input_dim: usize, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let mut store = ParameterStore::new(PARAMETER_PREFIX);
        let network = Mlp::new(
            &mut store,
            input_dim,
            1,
            config.layer_width,
            config.hidden_layers,
            rng,
        )?;
        let learning_rate = store.register(
            "learning_rate",
            Tensor::full([1, 1], config.learning_rate),
            config.train_learning_rate,
        )?;
        Ok(Self {
            store,
            network,
            learning_rate,
        })
    }

    /// Runs the network on one input per variable and applies the scaled outputs.
    fn propose(
        &self,
        ctx: &StepContext<'_>,
        variables: &[Var],
        inputs: &[Var],
    ) -> Result<(Vec<Var>, Vec<Var>)> {
        let scale = self.store.var(self.learning_rate);
        let mut next = Vec::with_capacity(variables.len());
        let mut deltas = Vec::with_capacity(variables.len());
        for (i, (x, input)) in variables.iter().zip(inputs).enumerate() {
            let delta = self.network.forward(&self.store, input)?;
            next.push(apply_delta(ctx.problem, i, x, &delta, scale)?);
            deltas.push(delta);
        }
        Ok((next, deltas))
    }
}

/// MLP on the preprocessed gradient.
#[derive(Debug, Clone)]
pub struct MlpSimple {
    config: MlpConfig,
    core: FeedForward,
}

impl MlpSimple {
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for an invalid configuration.
    pub fn new<R: Rng + ?Sized>(config: MlpConfig, rng: &mut R) -> Result<Self> {
        let core = FeedForward::new(&config, config.preprocessor.width(), rng)?;
        Ok(Self { config, core })
    }
}

impl UpdateRule for MlpSimple {
    fn name(&self) -> &'static str {
        "mlp_simple"
    }

    fn state_kind(&self) -> StateKind {
        StateKind::Stateless
    }

    fn unroll_len(&self) -> usize {
        self.config.unroll_len
    }

    fn parameters(&self) -> &ParameterStore {
        &self.core.store
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.core.store
    }

    fn reset_state(&self, _ctx: &mut StepContext<'_>, initial: Vec<Var>) -> Result<StepState> {
        Ok(StepState {
            variables: initial,
            rule: RuleState::Stateless,
        })
    }

    fn step(&self, ctx: &mut StepContext<'_>, state: &StepState) -> Result<StepOutput> {
        if !matches!(state.rule, RuleState::Stateless) {
            return Err(wrong_state(self.name(), StateKind::Stateless, state.rule.kind()));
        }
        let inputs = ctx.preprocessed_gradients(&state.variables, &self.config.preprocessor)?;
        let (variables, deltas) = self.core.propose(ctx, &state.variables, &inputs)?;
        Ok(StepOutput {
            state: StepState {
                variables,
                rule: RuleState::Stateless,
            },
            deltas,
        })
    }
}

/// [`MlpSimple`] plus an auxiliary moving average of the preprocessed gradient.
#[derive(Debug, Clone)]
pub struct MlpMovingAverage {
    config: MlpConfig,
    core: FeedForward,
}

impl MlpMovingAverage {
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for an invalid configuration.
    pub fn new<R: Rng + ?Sized>(config: MlpConfig, rng: &mut R) -> Result<Self> {
        let core = FeedForward::new(&config, config.preprocessor.width(), rng)?;
        Ok(Self { config, core })
    }
}

impl UpdateRule for MlpMovingAverage {
    fn name(&self) -> &'static str {
        "mlp_moving_average"
    }

    fn state_kind(&self) -> StateKind {
        StateKind::MovingAverage
    }

    fn unroll_len(&self) -> usize {
        self.config.unroll_len
    }

    fn parameters(&self) -> &ParameterStore {
        &self.core.store
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.core.store
    }

    fn reset_state(&self, ctx: &mut StepContext<'_>, initial: Vec<Var>) -> Result<StepState> {
        let width = self.config.preprocessor.width();
        let averages = ctx
            .problem
            .variables_flattened_shape()
            .into_iter()
            .map(|len| Var::zeros([len, width]))
            .collect();
        Ok(StepState {
            variables: initial,
            rule: RuleState::MovingAverage(averages),
        })
    }

    fn step(&self, ctx: &mut StepContext<'_>, state: &StepState) -> Result<StepOutput> {
        let RuleState::MovingAverage(averages) = &state.rule else {
            return Err(wrong_state(self.name(), StateKind::MovingAverage, state.rule.kind()));
        };
        let preprocessor = &self.config.preprocessor;
        let inputs = ctx.preprocessed_gradients(&state.variables, preprocessor)?;
        let (variables, deltas) = self.core.propose(ctx, &state.variables, &inputs)?;

        let at_next = ctx.preprocessed_gradients(&variables, preprocessor)?;
        if at_next.len() != averages.len() {
            return Err(OptimError::InvalidState(format!(
                "{} averages for {} variables",
                averages.len(),
                at_next.len()
            )));
        }
        let averages = averages
            .iter()
            .zip(&at_next)
            .map(|(avg, g)| {
                Ok(avg
                    .scale(AVERAGE_DECAY)
                    .add(&g.scale(1.0 - AVERAGE_DECAY))?)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StepOutput {
            state: StepState {
                variables,
                rule: RuleState::MovingAverage(averages),
            },
            deltas,
        })
    }
}

/// MLP on the recency-ordered history of preprocessed gradients.
#[derive(Debug, Clone)]
pub struct MlpGradHistory {
    config: GradHistoryConfig,
    core: FeedForward,
}

impl MlpGradHistory {
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for an invalid configuration.
    pub fn new<R: Rng + ?Sized>(config: GradHistoryConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let input_dim = config.limit * config.network.preprocessor.width();
        let core = FeedForward::new(&config.network, input_dim, rng)?;
        Ok(Self { config, core })
    }
}

impl UpdateRule for MlpGradHistory {
    fn name(&self) -> &'static str {
        "mlp_grad_history"
    }

    fn state_kind(&self) -> StateKind {
        StateKind::GradientHistory
    }

    fn unroll_len(&self) -> usize {
        self.config.network.unroll_len
    }

    fn parameters(&self) -> &ParameterStore {
        &self.core.store
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.core.store
    }

    fn reset_state(&self, ctx: &mut StepContext<'_>, initial: Vec<Var>) -> Result<StepState> {
        let preprocessor = &self.config.network.preprocessor;
        let gradients = ctx.preprocessed_gradients(&initial, preprocessor)?;
        let history = HistoryBuffer::filled(&gradients, self.config.limit, preprocessor.width())?;
        Ok(StepState {
            variables: initial,
            rule: RuleState::GradientHistory(history),
        })
    }

    fn step(&self, ctx: &mut StepContext<'_>, state: &StepState) -> Result<StepOutput> {
        let RuleState::GradientHistory(history) = &state.rule else {
            return Err(wrong_state(
                self.name(),
                StateKind::GradientHistory,
                state.rule.kind(),
            ));
        };
        let inputs = (0..state.variables.len())
            .map(|i| history.read_recent(i))
            .collect::<Result<Vec<_>>>()?;
        let (variables, deltas) = self.core.propose(ctx, &state.variables, &inputs)?;

        let mut history = history.clone();
        history.write(&ctx.preprocessed_gradients(&variables, &self.config.network.preprocessor)?)?;

        Ok(StepOutput {
            state: StepState {
                variables,
                rule: RuleState::GradientHistory(history),
            },
            deltas,
        })
    }
}
