//! Activation Functions.
//!
//! # What is an Activation Function?
//!
//! Activation functions introduce **non-linearity** into neural networks. Without them, a
//! network (no matter how deep) would collapse to a single affine map.
//!
//! - **Softplus**: $\ln(1 + e^x)$. A smooth ReLU. Hidden layers of the feed-forward rules use it,
//!   so that second derivatives of the update with respect to the weights exist everywhere.
//! - **Tanh**: squashes to $(-1, 1)$. Bounds the output of the variable-history rule and the
//!   candidate cell update of the LSTM.
//! - **Sigmoid**: squashes to $(0, 1)$. The LSTM gates.

use crate::Var;

/// Element-wise nonlinearity applied to a graph variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Softplus,
    Tanh,
    Sigmoid,
}

impl Activation {
    pub fn apply(&self, x: &Var) -> Var {
        match self {
            Self::Identity => x.clone(),
            Self::Softplus => x.softplus(),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => x.sigmoid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softplus_value() {
        // softplus(0) = ln 2
        let y = Activation::Softplus.apply(&Var::scalar(0.0));
        assert!((y.value().data()[0] - 2.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_tanh_sigmoid_identity() {
        let x = Var::scalar(1.0);
        // tanh(1) approx 0.761594
        let t = Activation::Tanh.apply(&x).value().data()[0];
        assert!((t - 0.761594).abs() < 1e-5);
        // sigmoid(1) = 1 / (1 + e^-1) approx 0.731059
        let s = Activation::Sigmoid.apply(&x).value().data()[0];
        assert!((s - 0.731059).abs() < 1e-5);
        assert_eq!(Activation::Identity.apply(&x).value().data(), &[1.0]);
    }
}
