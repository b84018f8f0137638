//! Gradient preprocessing.
//!
//! Raw gradients span many orders of magnitude across problems and across training. Update
//! rules with a neural core therefore see a transformed gradient instead.
//!
//! [`Preprocessor::LogSign`] splits each coordinate into a scaled log-magnitude and a sign:
//!
//! $$
//! g \mapsto \begin{cases}
//! \left(\frac{\ln |g|}{k}, \operatorname{sign}(g)\right) & |g| \ge e^{-k} \\
//! \left(-1, e^{k} g\right) & \text{otherwise}
//! \end{cases}
//! $$
//!
//! The output has twice as many columns as the input: all magnitudes first, then all signs.

use crate::error::{OptimError, Result};
use crate::{Matrix, Var};
use serde::{Deserialize, Serialize};

const fn default_k() -> f32 {
    5.0
}

/// Transform applied to flattened gradients before they reach a network.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Preprocessor {
    /// Identity.
    #[default]
    None,
    /// Log-magnitude and sign encoding with scale `k`.
    LogSign {
        #[serde(default = "default_k")]
        k: f32,
    },
}

impl Preprocessor {
    /// Output columns produced per input column.
    pub const fn width(&self) -> usize {
        match self {
            Self::None => 1,
            Self::LogSign { .. } => 2,
        }
    }

    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` if `k` is not a positive finite number.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::None => Ok(()),
            Self::LogSign { k } if k.is_finite() && *k > 0.0 => Ok(()),
            Self::LogSign { k } => Err(OptimError::InvalidConfig(format!(
                "log-sign preprocessor needs k > 0, got {k}"
            ))),
        }
    }

    /// Applies the transform. Differentiable with respect to `gradient`.
    ///
    /// # Errors
    ///
    /// Propagates tensor errors; none occur for well-formed input.
    pub fn transform(&self, gradient: &Var) -> Result<Var> {
        match *self {
            Self::None => Ok(gradient.clone()),
            Self::LogSign { k } => log_sign(gradient, k),
        }
    }
}

fn log_sign(gradient: &Var, k: f32) -> Result<Var> {
    let threshold = (-k).exp();
    let large: Matrix = gradient
        .value()
        .map(|g| if g.abs() >= threshold { 1.0 } else { 0.0 });
    let small = large.map(|m| 1.0 - m);
    let large_mask = Var::new(large);
    let small_mask = Var::new(small.clone());

    // ln(|g| + 1) on masked-out entries is ln(1) = 0, which keeps the graph finite at g = 0.
    let safe_abs = gradient.abs().add(&small_mask)?;
    let magnitude = safe_abs
        .ln()
        .scale(1.0 / k)
        .mul(&large_mask)?
        .add(&Var::new(small.scale(-1.0)))?;

    let sign = gradient
        .sign()
        .mul(&large_mask)?
        .add(&gradient.scale(k.exp()).mul(&small_mask)?)?;

    Ok(Var::concat_columns(&[&magnitude, &sign])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn column(data: Vec<f32>) -> Var {
        let n = data.len();
        Var::new(Tensor::new(data, [n, 1]).unwrap())
    }

    #[test]
    fn test_identity() {
        let g = column(vec![1.0, -2.0]);
        let out = Preprocessor::None.transform(&g).unwrap();
        assert_eq!(out.value(), g.value());
        assert_eq!(Preprocessor::None.width(), 1);
    }

    #[test]
    fn test_log_sign_values() {
        let k = 5.0f32;
        let p = Preprocessor::LogSign { k };
        let tiny = 1e-4f32; // below e^-5 ~ 6.7e-3
        let g = column(vec![2.0, -0.5, tiny, 0.0]);
        let out = p.transform(&g).unwrap();
        assert_eq!(out.shape(), &[4, 2]);

        let d = out.value().data();
        // row 0: (ln 2 / 5, 1)
        assert!((d[0] - 2.0f32.ln() / k).abs() < 1e-6);
        assert_eq!(d[1], 1.0);
        // row 1: (ln 0.5 / 5, -1)
        assert!((d[2] - 0.5f32.ln() / k).abs() < 1e-6);
        assert_eq!(d[3], -1.0);
        // row 2: (-1, e^5 * 1e-4)
        assert_eq!(d[4], -1.0);
        assert!((d[5] - k.exp() * tiny).abs() < 1e-6);
        // row 3: (-1, 0)
        assert_eq!(d[6], -1.0);
        assert_eq!(d[7], 0.0);
    }

    #[test]
    fn test_log_sign_is_differentiable_and_finite() {
        let p = Preprocessor::LogSign { k: 5.0 };
        let g = column(vec![2.0, 0.0]);
        p.transform(&g).unwrap().sum().backward().unwrap();
        let grad = g.grad_tensor().unwrap();
        // d/dg (ln g / 5) = 1 / (5 g) = 0.1 at g = 2; sign contributes nothing
        assert!((grad.data()[0] - 0.1).abs() < 1e-6);
        // small branch: d/dg (e^5 g) = e^5
        assert!((grad.data()[1] - 5.0f32.exp()).abs() < 1e-2);
        assert!(grad.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_validate_and_serde() {
        assert!(Preprocessor::LogSign { k: 0.0 }.validate().is_err());
        assert!(Preprocessor::LogSign { k: 3.0 }.validate().is_ok());

        let p: Preprocessor = serde_json::from_str(r#"{"name":"log_sign"}"#).unwrap();
        assert_eq!(p, Preprocessor::LogSign { k: 5.0 });
        assert!(serde_json::from_str::<Preprocessor>(r#"{"name":"cubic"}"#).is_err());
    }
}
