//! Optimizer configuration records.
//!
//! An [`OptimizerConfig`] serializes to a single flat JSON object: the rule-specific keys sit
//! next to the global ones and the `rule` key selects the variant.
//!
//! ```json
//! {
//!   "rule": "lstm",
//!   "num_layers": 2,
//!   "state_size": 20,
//!   "unroll_len": 20,
//!   "preprocessor": { "name": "log_sign", "k": 5.0 },
//!   "learning_rate": 0.0001,
//!   "train_learning_rate": false,
//!   "second_derivatives": false,
//!   "meta_learning_rate": 0.01,
//!   "meta_optimizer": "adam",
//!   "seed": 0
//! }
//! ```
//!
//! Every field except `rule` has a default, so `{"rule": "mlp_simple"}` is a complete record.

use crate::error::{OptimError, Result};
use crate::meta::MetaOptimizerKind;
use crate::preprocess::Preprocessor;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn check_positive(name: &str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(OptimError::InvalidConfig(format!(
            "{name} must be a positive finite number, got {value}"
        )))
    }
}

fn check_nonzero(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        Err(OptimError::InvalidConfig(format!("{name} must be at least 1")))
    } else {
        Ok(())
    }
}

/// Hyper-parameters of the closed-form Adam rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl AdamConfig {
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for a non-positive learning rate or epsilon, or a
    /// beta outside `[0, 1)`.
    pub fn validate(&self) -> Result<()> {
        check_positive("adam learning_rate", self.learning_rate)?;
        check_positive("adam epsilon", self.epsilon)?;
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(OptimError::InvalidConfig(format!(
                    "adam {name} must lie in [0, 1), got {beta}"
                )));
            }
        }
        Ok(())
    }
}

/// The recurrent rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LstmConfig {
    pub num_layers: usize,
    pub state_size: usize,
    /// Rule invocations per engine step.
    pub unroll_len: usize,
    pub preprocessor: Preprocessor,
    /// Scale applied to every network output.
    pub learning_rate: f32,
    /// Registers the learning rate as a meta-trained parameter.
    pub train_learning_rate: bool,
}

impl Default for LstmConfig {
    fn default() -> Self {
        Self {
            num_layers: 2,
            state_size: 20,
            unroll_len: 20,
            preprocessor: Preprocessor::LogSign { k: 5.0 },
            learning_rate: 1e-4,
            train_learning_rate: false,
        }
    }
}

impl LstmConfig {
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for zero sizes or a bad learning rate.
    pub fn validate(&self) -> Result<()> {
        check_nonzero("num_layers", self.num_layers)?;
        check_nonzero("state_size", self.state_size)?;
        check_nonzero("unroll_len", self.unroll_len)?;
        check_positive("learning_rate", self.learning_rate)?;
        self.preprocessor.validate()
    }
}

/// Network shape and output scale shared by the feed-forward rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpConfig {
    pub layer_width: usize,
    pub hidden_layers: usize,
    pub preprocessor: Preprocessor,
    pub learning_rate: f32,
    pub train_learning_rate: bool,
    pub unroll_len: usize,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            layer_width: 20,
            hidden_layers: 0,
            preprocessor: Preprocessor::None,
            learning_rate: 1e-4,
            train_learning_rate: false,
            unroll_len: 1,
        }
    }
}

impl MlpConfig {
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for a zero width, zero unroll or bad learning rate.
    pub fn validate(&self) -> Result<()> {
        check_nonzero("layer_width", self.layer_width)?;
        check_nonzero("unroll_len", self.unroll_len)?;
        check_positive("learning_rate", self.learning_rate)?;
        self.preprocessor.validate()
    }
}

const fn default_limit() -> usize {
    5
}

/// The gradient-history rule: an MLP fed with the last `limit` preprocessed gradients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradHistoryConfig {
    #[serde(flatten)]
    pub network: MlpConfig,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for GradHistoryConfig {
    fn default() -> Self {
        Self {
            network: MlpConfig::default(),
            limit: default_limit(),
        }
    }
}

impl GradHistoryConfig {
    /// # Errors
    ///
    /// See [`MlpConfig::validate`]; also rejects `limit == 0`.
    pub fn validate(&self) -> Result<()> {
        check_nonzero("limit", self.limit)?;
        self.network.validate()
    }
}

/// The variable-history rule: an MLP fed with normalised value and gradient-sign histories.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XHistoryConfig {
    pub layer_width: usize,
    pub hidden_layers: usize,
    pub limit: usize,
    /// Step size of the gradient-descent guide that fills the histories.
    pub guide_step: f32,
    pub unroll_len: usize,
}

impl Default for XHistoryConfig {
    fn default() -> Self {
        Self {
            layer_width: 20,
            hidden_layers: 0,
            limit: default_limit(),
            guide_step: 0.1,
            unroll_len: 1,
        }
    }
}

impl XHistoryConfig {
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for zero sizes or a bad guide step.
    pub fn validate(&self) -> Result<()> {
        check_nonzero("layer_width", self.layer_width)?;
        check_nonzero("limit", self.limit)?;
        check_nonzero("unroll_len", self.unroll_len)?;
        check_positive("guide_step", self.guide_step)
    }
}

/// Row normalisation of a gradient history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Divide by the row's infinity norm.
    #[default]
    InfNorm,
    /// Rescale the row to `[-1, 1]`.
    MinMax,
}

/// The non-learned history rules.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidedHistoryConfig {
    pub limit: usize,
    pub normalization: Normalization,
    /// Standard deviation of the multiplicative exploration noise.
    pub noise_stddev: f32,
    /// Learning rate of the Adam guide that fills the histories.
    pub guide_learning_rate: f32,
}

impl Default for GuidedHistoryConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            normalization: Normalization::InfNorm,
            noise_stddev: 0.01,
            guide_learning_rate: 0.01,
        }
    }
}

impl GuidedHistoryConfig {
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for `limit == 0`, a negative or non-finite noise
    /// level or a bad guide learning rate.
    pub fn validate(&self) -> Result<()> {
        check_nonzero("limit", self.limit)?;
        check_positive("guide_learning_rate", self.guide_learning_rate)?;
        if !(self.noise_stddev.is_finite() && self.noise_stddev >= 0.0) {
            return Err(OptimError::InvalidConfig(format!(
                "noise_stddev must be a non-negative finite number, got {}",
                self.noise_stddev
            )));
        }
        Ok(())
    }
}

/// Update rule selection, tagged by the `rule` key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RuleConfig {
    Adam(AdamConfig),
    Lstm(LstmConfig),
    MlpSimple(MlpConfig),
    MlpMovingAverage(MlpConfig),
    MlpGradHistory(GradHistoryConfig),
    MlpXHistory(XHistoryConfig),
    XHistoryGradNorm(GuidedHistoryConfig),
    XHistorySign(GuidedHistoryConfig),
}

impl RuleConfig {
    /// Name of the rule as written in the `rule` key.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Adam(_) => "adam",
            Self::Lstm(_) => "lstm",
            Self::MlpSimple(_) => "mlp_simple",
            Self::MlpMovingAverage(_) => "mlp_moving_average",
            Self::MlpGradHistory(_) => "mlp_grad_history",
            Self::MlpXHistory(_) => "mlp_x_history",
            Self::XHistoryGradNorm(_) => "x_history_grad_norm",
            Self::XHistorySign(_) => "x_history_sign",
        }
    }

    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` if a rule parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Adam(c) => c.validate(),
            Self::Lstm(c) => c.validate(),
            Self::MlpSimple(c) | Self::MlpMovingAverage(c) => c.validate(),
            Self::MlpGradHistory(c) => c.validate(),
            Self::MlpXHistory(c) => c.validate(),
            Self::XHistoryGradNorm(c) | Self::XHistorySign(c) => c.validate(),
        }
    }
}

const fn default_meta_learning_rate() -> f32 {
    0.01
}

/// Everything needed to rebuild an optimizer, apart from its trained parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(flatten)]
    pub rule: RuleConfig,
    /// Feed differentiable gradients to the rule so meta-gradients flow through them.
    #[serde(default)]
    pub second_derivatives: bool,
    #[serde(default = "default_meta_learning_rate")]
    pub meta_learning_rate: f32,
    #[serde(default)]
    pub meta_optimizer: MetaOptimizerKind,
    /// Seeds parameter initialisation and exploration noise.
    #[serde(default)]
    pub seed: u64,
}

impl OptimizerConfig {
    /// A config for `rule` with default global settings.
    pub fn new(rule: RuleConfig) -> Self {
        Self {
            rule,
            second_derivatives: false,
            meta_learning_rate: default_meta_learning_rate(),
            meta_optimizer: MetaOptimizerKind::default(),
            seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_second_derivatives(mut self, enabled: bool) -> Self {
        self.second_derivatives = enabled;
        self
    }

    pub fn with_meta_optimizer(mut self, kind: MetaOptimizerKind, learning_rate: f32) -> Self {
        self.meta_optimizer = kind;
        self.meta_learning_rate = learning_rate;
        self
    }

    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for any out-of-range value.
    pub fn validate(&self) -> Result<()> {
        check_positive("meta_learning_rate", self.meta_learning_rate)?;
        self.rule.validate()
    }

    /// Parses and validates a JSON record.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for malformed JSON, an unknown rule or preprocessor
    /// name, or an out-of-range value.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| OptimError::InvalidConfig(format!("config record: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `OptimError::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reads a record written by [`OptimizerConfig::save`].
    ///
    /// # Errors
    ///
    /// Returns `OptimError::Io` if the file cannot be read, otherwise see
    /// [`OptimizerConfig::from_json`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// # Errors
    ///
    /// Returns `OptimError::Io` if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_record_uses_defaults() {
        let config = OptimizerConfig::from_json(r#"{"rule": "mlp_simple"}"#).unwrap();
        assert_eq!(config.rule, RuleConfig::MlpSimple(MlpConfig::default()));
        assert_eq!(config.meta_learning_rate, 0.01);
        assert_eq!(config.meta_optimizer, MetaOptimizerKind::Adam);
        assert!(!config.second_derivatives);
    }

    #[test]
    fn test_record_is_flat() {
        let config = OptimizerConfig::new(RuleConfig::Lstm(LstmConfig::default())).with_seed(3);
        let value: serde_json::Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(value["rule"], "lstm");
        assert_eq!(value["state_size"], 20);
        assert_eq!(value["seed"], 3);
        assert_eq!(value["preprocessor"]["name"], "log_sign");
    }

    #[test]
    fn test_round_trip_through_json() {
        let config = OptimizerConfig::new(RuleConfig::MlpGradHistory(GradHistoryConfig {
            limit: 7,
            network: MlpConfig {
                preprocessor: Preprocessor::LogSign { k: 3.0 },
                hidden_layers: 1,
                ..MlpConfig::default()
            },
        }))
        .with_meta_optimizer(MetaOptimizerKind::Sgd, 0.5);
        let parsed = OptimizerConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_unknown_names_are_invalid_config() {
        assert!(matches!(
            OptimizerConfig::from_json(r#"{"rule": "rmsprop"}"#),
            Err(OptimError::InvalidConfig(_))
        ));
        assert!(matches!(
            OptimizerConfig::from_json(r#"{"rule": "mlp_simple", "preprocessor": {"name": "cube"}}"#),
            Err(OptimError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validation() {
        let bad_eps = RuleConfig::Adam(AdamConfig {
            epsilon: 0.0,
            ..AdamConfig::default()
        });
        assert!(bad_eps.validate().is_err());

        let bad_beta = RuleConfig::Adam(AdamConfig {
            beta2: 1.0,
            ..AdamConfig::default()
        });
        assert!(bad_beta.validate().is_err());

        let bad_limit = RuleConfig::XHistorySign(GuidedHistoryConfig {
            limit: 0,
            ..GuidedHistoryConfig::default()
        });
        assert!(bad_limit.validate().is_err());

        let bad_noise = RuleConfig::XHistoryGradNorm(GuidedHistoryConfig {
            noise_stddev: f32::NAN,
            ..GuidedHistoryConfig::default()
        });
        assert!(bad_noise.validate().is_err());

        let mut config = OptimizerConfig::new(RuleConfig::Adam(AdamConfig::default()));
        config.meta_learning_rate = -1.0;
        assert!(matches!(config.validate(), Err(OptimError::InvalidConfig(_))));
    }

    #[test]
    fn test_save_and_load_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt_config.json");
        let config = OptimizerConfig::new(RuleConfig::XHistorySign(GuidedHistoryConfig {
            normalization: Normalization::MinMax,
            ..GuidedHistoryConfig::default()
        }));
        config.save(&path).unwrap();
        assert_eq!(OptimizerConfig::load(&path).unwrap(), config);
    }
}
