//! The step/unroll engine.
//!
//! # What is an Unroll?
//!
//! A learned optimizer is trained on the path it takes. One engine [`step`](LearnedOptimizer::step)
//! chains `unroll_len` invocations of the update rule, recording the problem loss at every new
//! point:
//!
//! $$
//! L = \frac{1}{U} \sum_{k=1}^{U} f(x_k), \qquad x_k = \mathrm{rule}(x_{k-1}, s_{k-1})
//! $$
//!
//! While meta-training, `L` is back-propagated through the whole chain into the rule's
//! parameters and the [`MetaTrainer`] takes one step. The last state is then committed with its
//! graph cut, so the next unroll starts a fresh tape.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --build()--> Built --step()/reset()--> Built --finish()--> Done
//! ```
//!
//! > [!TIP]
//! > **Expert Note: Reproducibility**
//! > Parameter initialisation and exploration noise both come from a `StdRng` seeded with
//! > [`OptimizerConfig::seed`]. [`build`](LearnedOptimizer::build) and
//! > [`reset`](LearnedOptimizer::reset) reseed it, so every episode draws the same noise. The
//! > report of a step is computed before the meta update, so two optimizers with equal
//! > parameters produce bit-identical reports from the start of an episode.

pub use crate::state::StepState;

use crate::checkpoint::{load_checkpoint, save_checkpoint};
use crate::config::OptimizerConfig;
use crate::error::{OptimError, Result};
use crate::meta::MetaTrainer;
use crate::problem::Problem;
use crate::rules::{StepContext, UpdateRule, build_rule};
use crate::{Matrix, Var};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Lifecycle phase of a [`LearnedOptimizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Built,
    Done,
}

/// Losses recorded during one unroll, kept on the tape.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    losses: Vec<Var>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, loss: Var) {
        self.losses.push(loss);
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    /// Differentiable mean of the recorded losses.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidState` for an empty trajectory.
    pub fn mean(&self) -> Result<Var> {
        let (first, rest) = self
            .losses
            .split_first()
            .ok_or_else(|| OptimError::InvalidState("empty trajectory".to_string()))?;
        let total = rest
            .iter()
            .try_fold(first.clone(), |acc, loss| acc.add(loss))?;
        Ok(total.scale(1.0 / self.losses.len() as f32))
    }

    /// Recorded losses as plain numbers.
    pub fn values(&self) -> Vec<f32> {
        self.losses.iter().map(scalar).collect()
    }

    pub fn clear(&mut self) {
        self.losses.clear();
    }
}

/// What one engine step did.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// Problem loss after each rule invocation.
    pub losses: Vec<f32>,
    /// Mean of `losses`, the quantity meta-training minimizes.
    pub trajectory_loss: f32,
    /// Per-variable deltas of the last invocation, `[len, 1]`.
    pub deltas: Vec<Matrix>,
    /// Whether the rule's parameters were updated.
    pub meta_step: bool,
}

fn scalar(v: &Var) -> f32 {
    v.value().data().first().copied().unwrap_or(f32::NAN)
}

/// `path` with `suffix` appended to its last component.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the configuration record saved next to `path`.
pub fn config_path<P: AsRef<Path>>(path: P) -> PathBuf {
    with_suffix(path.as_ref(), "_config.json")
}

/// Path of the parameter file saved next to `path`.
pub fn parameters_path<P: AsRef<Path>>(path: P) -> PathBuf {
    with_suffix(path.as_ref(), ".safetensors")
}

/// An update rule bound to one problem, with its meta-trainer and episode state.
#[derive(Debug)]
pub struct LearnedOptimizer<P: Problem> {
    problem: P,
    config: OptimizerConfig,
    rule: Box<dyn UpdateRule>,
    meta: MetaTrainer,
    state: Option<StepState>,
    trajectory: Trajectory,
    phase: Phase,
    rng: StdRng,
    meta_training: bool,
}

impl<P: Problem> LearnedOptimizer<P> {
    /// Creates the rule and its parameters. Meta-training is enabled.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` if `config` does not validate.
    pub fn new(problem: P, config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let rule = build_rule(&config.rule, &mut rng)?;
        let meta = MetaTrainer::new(config.meta_optimizer, config.meta_learning_rate)?;
        Ok(Self {
            problem,
            config,
            rule,
            meta,
            state: None,
            trajectory: Trajectory::new(),
            phase: Phase::Uninitialized,
            rng,
            meta_training: true,
        })
    }

    /// Rebuilds an optimizer from a record written by [`LearnedOptimizer::save`].
    ///
    /// # Errors
    ///
    /// See [`OptimizerConfig::load`] and [`LearnedOptimizer::load`].
    pub fn from_saved<Q: AsRef<Path>>(problem: P, path: Q) -> Result<Self> {
        let config = OptimizerConfig::load(config_path(&path))?;
        let mut optimizer = Self::new(problem, config)?;
        optimizer.load(path)?;
        Ok(optimizer)
    }

    /// Initialises the episode state from the problem's initial values.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` if the initial values do not match the declared
    /// variables or if `second_derivatives` is set for a problem without differentiable
    /// gradients, and `OptimError::InvalidState` if the optimizer was finished.
    pub fn build(&mut self) -> Result<()> {
        if self.phase == Phase::Done {
            return Err(OptimError::InvalidState(
                "build() on a finished optimizer".to_string(),
            ));
        }
        self.check_declared_shapes()?;
        self.check_second_derivatives()?;
        self.state = Some(self.fresh_state()?);
        self.trajectory.clear();
        self.phase = Phase::Built;
        info!(
            problem = self.problem.name(),
            rule = self.rule.name(),
            parameters = self.rule.parameters().num_trainable_elements(),
            unroll_len = self.rule.unroll_len(),
            "optimizer built"
        );
        Ok(())
    }

    /// Runs one unroll of `unroll_len` rule invocations, meta-trains on it and commits the
    /// last state.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidState` before [`build`](Self::build) or after
    /// [`finish`](Self::finish), and `OptimError::ShapeMismatch` if a gradient or delta has the
    /// wrong length. On error the committed state is unchanged.
    pub fn step(&mut self) -> Result<StepReport> {
        let mut current = self.built_state()?.clone();
        self.trajectory.clear();

        let mut deltas = Vec::new();
        let mut ctx = StepContext {
            problem: &self.problem,
            second_derivatives: self.config.second_derivatives,
            rng: &mut self.rng,
        };
        for k in 0..self.rule.unroll_len() {
            let out = self.rule.step(&mut ctx, &current)?;
            let loss = self.problem.loss(&out.state.variables)?;
            debug!(step = k, loss = scalar(&loss), "unroll step");
            self.trajectory.push(loss);
            deltas = out.deltas;
            current = out.state;
        }

        let total = self.trajectory.mean()?;
        let trajectory_loss = scalar(&total);
        if !trajectory_loss.is_finite() {
            warn!(rule = self.rule.name(), trajectory_loss, "non-finite trajectory loss");
        }
        let report = StepReport {
            losses: self.trajectory.values(),
            trajectory_loss,
            deltas: deltas.iter().map(|d| d.value().clone()).collect(),
            meta_step: self.meta_training && self.rule.parameters().has_trainable(),
        };

        if report.meta_step {
            total.backward()?;
            self.meta.step(self.rule.parameters_mut())?;
        }
        if let Some(state) = self.state.as_mut() {
            self.rule.apply_updates(state, current);
        }
        self.trajectory.clear();
        Ok(report)
    }

    /// Runs `steps` engine steps.
    ///
    /// # Errors
    ///
    /// Stops at the first failing step, see [`LearnedOptimizer::step`].
    pub fn unroll(&mut self, steps: usize) -> Result<Vec<StepReport>> {
        (0..steps).map(|_| self.step()).collect()
    }

    /// Starts a new episode: variables back to their initial values, rule state and
    /// trajectory cleared. Parameters and meta-trainer moments are kept.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidState` before [`build`](Self::build) or after
    /// [`finish`](Self::finish).
    pub fn reset(&mut self) -> Result<()> {
        self.built_state()?;
        self.state = Some(self.fresh_state()?);
        self.trajectory.clear();
        self.rule.parameters().zero_grad();
        info!(rule = self.rule.name(), "optimizer reset");
        Ok(())
    }

    /// Ends the optimizer's life; later steps are rejected.
    pub fn finish(&mut self) {
        self.phase = Phase::Done;
        self.trajectory.clear();
    }

    /// Writes `<path>_config.json` and `<path>.safetensors`.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::Io` if a file cannot be written.
    pub fn save<Q: AsRef<Path>>(&self, path: Q) -> Result<()> {
        let path = path.as_ref();
        self.config.save(config_path(path))?;
        let tensors = self.rule.parameters().state_dict();
        save_checkpoint(parameters_path(path), &tensors)?;
        info!(
            path = %path.display(),
            tensors = tensors.len(),
            "optimizer saved"
        );
        Ok(())
    }

    /// Restores the rule parameters written by [`LearnedOptimizer::save`].
    ///
    /// # Errors
    ///
    /// Returns `OptimError::Checkpoint` if the saved record was made for another rule or the
    /// parameters do not match, and `OptimError::Io` if a file cannot be read.
    pub fn load<Q: AsRef<Path>>(&mut self, path: Q) -> Result<()> {
        let path = path.as_ref();
        let saved = OptimizerConfig::load(config_path(path))?;
        if saved.rule != self.config.rule {
            return Err(OptimError::Checkpoint(format!(
                "saved rule '{}' does not match '{}'",
                saved.rule.name(),
                self.config.rule.name()
            )));
        }
        let tensors = load_checkpoint(parameters_path(path))?;
        let count = tensors.len();
        self.rule.parameters_mut().load_state_dict(tensors)?;
        self.meta.reset();
        info!(path = %path.display(), tensors = count, "optimizer loaded");
        Ok(())
    }

    /// Enables or disables meta-training in later steps.
    pub fn set_meta_training(&mut self, enabled: bool) {
        self.meta_training = enabled;
    }

    pub const fn is_meta_training(&self) -> bool {
        self.meta_training
    }

    pub const fn phase(&self) -> Phase {
        self.phase
    }

    pub const fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub const fn problem(&self) -> &P {
        &self.problem
    }

    pub fn rule(&self) -> &dyn UpdateRule {
        self.rule.as_ref()
    }

    pub const fn meta_trainer(&self) -> &MetaTrainer {
        &self.meta
    }

    /// Committed state, if built.
    pub const fn state(&self) -> Option<&StepState> {
        self.state.as_ref()
    }

    /// Current variable values in native shapes.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidState` before [`build`](Self::build).
    pub fn values(&self) -> Result<Vec<Matrix>> {
        self.state
            .as_ref()
            .map(StepState::values)
            .ok_or_else(|| OptimError::InvalidState("optimizer is not built".to_string()))
    }

    /// Problem loss at the committed values.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidState` before [`build`](Self::build).
    pub fn loss(&self) -> Result<f32> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| OptimError::InvalidState("optimizer is not built".to_string()))?;
        Ok(scalar(&self.problem.loss(&state.variables)?))
    }

    fn built_state(&self) -> Result<&StepState> {
        match (self.phase, self.state.as_ref()) {
            (Phase::Built, Some(state)) => Ok(state),
            (Phase::Done, _) => Err(OptimError::InvalidState(
                "optimizer is finished".to_string(),
            )),
            _ => Err(OptimError::InvalidState(
                "optimizer is not built".to_string(),
            )),
        }
    }

    fn check_declared_shapes(&self) -> Result<()> {
        let specs = self.problem.variables();
        let initial = self.problem.initial_values();
        if specs.is_empty() {
            return Err(OptimError::InvalidConfig(format!(
                "problem '{}' declares no variables",
                self.problem.name()
            )));
        }
        if initial.len() != specs.len() {
            return Err(OptimError::InvalidConfig(format!(
                "problem '{}' declares {} variables but initialises {}",
                self.problem.name(),
                specs.len(),
                initial.len()
            )));
        }
        for (spec, value) in specs.iter().zip(&initial) {
            if *value.shape() != spec.shape {
                return Err(OptimError::InvalidConfig(format!(
                    "variable '{}' is declared {:?} but initialised {:?}",
                    spec.name,
                    spec.shape,
                    value.shape()
                )));
            }
        }
        Ok(())
    }

    fn check_second_derivatives(&self) -> Result<()> {
        if !self.config.second_derivatives {
            return Ok(());
        }
        let values: Vec<Var> = self
            .problem
            .initial_values()
            .into_iter()
            .map(Var::new)
            .collect();
        self.problem
            .gradients(&values, true)
            .map_err(|err| {
                OptimError::InvalidConfig(format!("second_derivatives is unsupported: {err}"))
            })?;
        Ok(())
    }

    fn fresh_state(&mut self) -> Result<StepState> {
        // Every episode restarts the noise stream.
        self.rng = StdRng::seed_from_u64(self.config.seed);
        let initial = self
            .problem
            .initial_values()
            .into_iter()
            .map(Var::new)
            .collect();
        let mut ctx = StepContext {
            problem: &self.problem,
            second_derivatives: false,
            rng: &mut self.rng,
        };
        Ok(self.rule.reset_state(&mut ctx, initial)?.detach())
    }
}
