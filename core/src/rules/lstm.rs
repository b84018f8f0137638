//! The coordinate-wise LSTM rule of "Learning to learn by gradient descent by gradient
//! descent".
//!
//! For every variable the preprocessed gradient `[len, in]` runs through a
//! [`StackedLstm`] whose batch rows are the variable's coordinates. The projected output is the
//! delta, scaled by the learning rate:
//!
//! $$
//! x_{t+1} = x_t + \eta \, \mathrm{LSTM}(\mathrm{pre}(\nabla f(x_t)), h_t)
//! $$
//!
//! All variables share one set of weights but keep their own hidden states. The rule unrolls
//! `unroll_len` steps per engine step, which is what meta-training differentiates through.

use super::{StepContext, StepOutput, UpdateRule, PARAMETER_PREFIX, apply_delta, wrong_state};
use crate::config::LstmConfig;
use crate::error::{OptimError, Result};
use crate::nn::StackedLstm;
use crate::params::{ParamId, ParameterStore};
use crate::state::{RuleState, StateKind, StepState};
use crate::tensor::Tensor;
use crate::Var;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct Lstm {
    config: LstmConfig,
    store: ParameterStore,
    network: StackedLstm,
    learning_rate: ParamId,
}

impl Lstm {
    /// Registers the cells, the projection and `learning_rate` under `optimizer_core/`.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for an invalid configuration.
    pub fn new<R: Rng + ?Sized>(config: LstmConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let mut store = ParameterStore::new(PARAMETER_PREFIX);
        let network = StackedLstm::new(
            &mut store,
            config.preprocessor.width(),
            config.state_size,
            config.num_layers,
            rng,
        )?;
        let learning_rate = store.register(
            "learning_rate",
            Tensor::full([1, 1], config.learning_rate),
            config.train_learning_rate,
        )?;
        Ok(Self {
            config,
            store,
            network,
            learning_rate,
        })
    }

    pub const fn config(&self) -> &LstmConfig {
        &self.config
    }

    pub fn network(&self) -> &StackedLstm {
        &self.network
    }
}

impl UpdateRule for Lstm {
    fn name(&self) -> &'static str {
        "lstm"
    }

    fn state_kind(&self) -> StateKind {
        StateKind::Hidden
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
        let hidden = ctx
            .problem
            .variables_flattened_shape()
            .into_iter()
            .map(|len| self.network.zero_state(len))
            .collect();
        Ok(StepState {
            variables: initial,
            rule: RuleState::Hidden(hidden),
        })
    }

    fn step(&self, ctx: &mut StepContext<'_>, state: &StepState) -> Result<StepOutput> {
        let RuleState::Hidden(hidden) = &state.rule else {
            return Err(wrong_state(self.name(), StateKind::Hidden, state.rule.kind()));
        };
        if hidden.len() != state.variables.len() {
            return Err(OptimError::InvalidState(format!(
                "{} hidden states for {} variables",
                hidden.len(),
                state.variables.len()
            )));
        }
        let inputs = ctx.preprocessed_gradients(&state.variables, &self.config.preprocessor)?;
        let scale = self.store.var(self.learning_rate);

        let mut variables = Vec::with_capacity(inputs.len());
        let mut next_hidden = Vec::with_capacity(inputs.len());
        let mut deltas = Vec::with_capacity(inputs.len());
        for (i, ((x, input), layers)) in state
            .variables
            .iter()
            .zip(&inputs)
            .zip(hidden)
            .enumerate()
        {
            let (delta, layers) = self.network.forward(&self.store, input, layers)?;
            variables.push(apply_delta(ctx.problem, i, x, &delta, scale)?);
            next_hidden.push(layers);
            deltas.push(delta);
        }

        Ok(StepOutput {
            state: StepState {
                variables,
                rule: RuleState::Hidden(next_hidden),
            },
            deltas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::Preprocessor;
    use crate::problem::{ElementwiseSquare, Problem, Rosenbrock};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn small() -> LstmConfig {
        LstmConfig {
            num_layers: 2,
            state_size: 3,
            unroll_len: 4,
            ..LstmConfig::default()
        }
    }

    #[test]
    fn test_parameter_names() {
        let mut rng = StdRng::seed_from_u64(0);
        let rule = Lstm::new(small(), &mut rng).unwrap();
        let store = rule.parameters();
        let keys: Vec<String> = store.ids().map(|id| store.key(id)).collect();
        assert_eq!(keys[0], "optimizer_core/rnn/cell_0/kernel");
        assert!(keys.contains(&"optimizer_core/rnn_linear/softmax_w".to_string()));
        assert_eq!(keys.last().unwrap(), "optimizer_core/learning_rate");
        // Frozen learning rate stays out of the checkpoint
        assert!(store.state_dict().iter().all(|(k, _)| !k.ends_with("learning_rate")));
    }

    #[test]
    fn test_trainable_learning_rate() {
        let mut rng = StdRng::seed_from_u64(0);
        let rule = Lstm::new(
            LstmConfig {
                train_learning_rate: true,
                ..small()
            },
            &mut rng,
        )
        .unwrap();
        let store = rule.parameters();
        assert!(store.state_dict().iter().any(|(k, _)| k == "optimizer_core/learning_rate"));
    }

    #[test]
    fn test_step_shapes_and_hidden_state() {
        let problem = Rosenbrock::default();
        let mut rng = StdRng::seed_from_u64(1);
        let rule = Lstm::new(small(), &mut rng).unwrap();
        let mut ctx = StepContext {
            problem: &problem,
            second_derivatives: false,
            rng: &mut rng,
        };
        let initial = problem.initial_values().into_iter().map(Var::new).collect();
        let state = rule.reset_state(&mut ctx, initial).unwrap();
        let out = rule.step(&mut ctx, &state).unwrap();

        assert_eq!(out.state.variables.len(), 2);
        assert_eq!(out.state.variables[0].shape(), &[1, 1]);
        assert_eq!(out.deltas[1].shape(), &[1, 1]);
        let RuleState::Hidden(hidden) = &out.state.rule else {
            panic!("expected hidden state");
        };
        assert_eq!(hidden.len(), 2);
        assert_eq!(hidden[0].len(), 2);
        assert_eq!(hidden[0][1].h.shape(), &[1, 3]);
        assert_ne!(out.state.snapshot(), state.snapshot());
    }

    #[test]
    fn test_unrolled_loss_reaches_every_weight() {
        let problem = ElementwiseSquare::from_values(vec![0.5, -1.5, 2.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let rule = Lstm::new(
            LstmConfig {
                preprocessor: Preprocessor::None,
                learning_rate: 0.1,
                ..small()
            },
            &mut rng,
        )
        .unwrap();
        let mut ctx = StepContext {
            problem: &problem,
            second_derivatives: false,
            rng: &mut rng,
        };
        let initial = problem.initial_values().into_iter().map(Var::new).collect();
        let mut state = rule.reset_state(&mut ctx, initial).unwrap();
        let mut total = Var::scalar(0.0);
        for _ in 0..rule.unroll_len() {
            state = rule.step(&mut ctx, &state).unwrap().state;
            total = total.add(&problem.loss(&state.variables).unwrap()).unwrap();
        }
        total.backward().unwrap();
        let store = rule.parameters();
        for id in store.trainable_ids() {
            assert!(store.var(id).grad_tensor().is_some(), "{}", store.name(id));
        }
    }
}
