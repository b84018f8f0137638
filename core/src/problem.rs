//! Optimization problems.
//!
//! A [`Problem`] is what a learned optimizer is trained on: a set of named variables with fixed
//! shapes, a scalar loss over candidate values and gradients of that loss. The optimizer never
//! owns problem variables. It receives their initial values, proposes new values and asks
//! the problem for losses and gradients at those values.
//!
//! Three small problems are provided so optimizers can be trained and tested without an
//! external problem library:
//!
//! | Problem | Variables | Gradient |
//! |---|---|---|
//! | [`ElementwiseSquare`] | one `[dims, 1]` vector | analytic `2x`, differentiable |
//! | [`Rosenbrock`] | two `[1, 1]` scalars | analytic, differentiable |
//! | [`LinearRegression`] | `W [d, k]`, `b [1, k]` | autograd, first order only |

use crate::error::{OptimError, Result};
use crate::tensor::Tensor;
use crate::{Matrix, Var};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};

/// Name and native shape of one problem variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSpec {
    pub name: String,
    pub shape: [usize; 2],
}

impl VariableSpec {
    pub fn new(name: impl Into<String>, shape: [usize; 2]) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    /// Flattened length `rows * cols`.
    pub const fn len(&self) -> usize {
        self.shape[0] * self.shape[1]
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The contract between an optimizer and the function it minimizes.
///
/// All values exchanged through this trait are in the variables' **native** shapes, except for
/// [`Problem::set_shape`] and [`Problem::flatten`], which convert between native shapes and the
/// `[len, 1]` columns update rules work on.
pub trait Problem {
    /// Short identifier used in log events.
    fn name(&self) -> &str;

    /// Ordered variable declarations.
    fn variables(&self) -> &[VariableSpec];

    /// Flattened length of every variable, aligned with [`Problem::variables`].
    fn variables_flattened_shape(&self) -> Vec<usize> {
        self.variables().iter().map(VariableSpec::len).collect()
    }

    /// Values every episode starts from.
    ///
    /// Must return the same values on every call, so that resetting an optimizer is
    /// reproducible.
    fn initial_values(&self) -> Vec<Matrix>;

    /// Scalar `[1, 1]` loss at `values`.
    ///
    /// # Errors
    ///
    /// Returns an error if `values` does not match the declared variables.
    fn loss(&self, values: &[Var]) -> Result<Var>;

    /// Gradient of the loss with respect to each variable, in native shape.
    ///
    /// With `create_graph = false` the result is detached. With `create_graph = true` the
    /// gradients must themselves be differentiable functions of `values`, which is what the
    /// `second_derivatives` option of an optimizer relies on. The default implementation
    /// differentiates [`Problem::loss`] once and cannot provide that.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for `create_graph = true` unless overridden.
    fn gradients(&self, values: &[Var], create_graph: bool) -> Result<Vec<Var>> {
        if create_graph {
            return Err(OptimError::InvalidConfig(format!(
                "problem '{}' does not provide differentiable gradients",
                self.name()
            )));
        }
        let leaves: Vec<Var> = values.iter().map(Var::detach).collect();
        self.loss(&leaves)?.backward()?;
        Ok(leaves
            .iter()
            .map(|leaf| {
                Var::new(
                    leaf.grad_tensor()
                        .unwrap_or_else(|| Tensor::zeros(*leaf.shape())),
                )
            })
            .collect())
    }

    /// Reshapes a flat `[len, 1]` column back to the native shape of variable `index`.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::ShapeMismatch` if the length disagrees with the declaration.
    fn set_shape(&self, flat: &Var, index: usize) -> Result<Var> {
        let spec = spec_at(self.variables(), index)?;
        if flat.value().size() != spec.len() {
            return Err(OptimError::ShapeMismatch {
                variable: spec.name.clone(),
                expected: vec![spec.len(), 1],
                got: flat.shape().to_vec(),
            });
        }
        Ok(flat.reshape(spec.shape)?)
    }

    /// Flattens a native-shape value of variable `index` to a `[len, 1]` column.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::ShapeMismatch` if the size disagrees with the declaration.
    fn flatten(&self, value: &Var, index: usize) -> Result<Var> {
        let spec = spec_at(self.variables(), index)?;
        if value.value().size() != spec.len() {
            return Err(OptimError::ShapeMismatch {
                variable: spec.name.clone(),
                expected: spec.shape.to_vec(),
                got: value.shape().to_vec(),
            });
        }
        Ok(value.reshape([spec.len(), 1])?)
    }
}

fn spec_at(specs: &[VariableSpec], index: usize) -> Result<&VariableSpec> {
    specs.get(index).ok_or_else(|| {
        OptimError::InvalidConfig(format!(
            "variable index {index} out of range for {} variables",
            specs.len()
        ))
    })
}

fn check_arity(name: &str, expected: usize, values: &[Var]) -> Result<()> {
    if values.len() != expected {
        return Err(OptimError::InvalidConfig(format!(
            "problem '{name}' expects {expected} variables, got {}",
            values.len()
        )));
    }
    Ok(())
}

/// `loss(x) = sum_i x_i^2` over a single vector variable.
#[derive(Debug, Clone)]
pub struct ElementwiseSquare {
    specs: Vec<VariableSpec>,
    init: Matrix,
}

impl ElementwiseSquare {
    /// A `[dims, 1]` variable initialised uniformly in `[minval, maxval)`.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` if `dims == 0` or the range is empty.
    pub fn new(dims: usize, minval: f32, maxval: f32, seed: u64) -> Result<Self> {
        if dims == 0 || !(minval < maxval) {
            return Err(OptimError::InvalidConfig(format!(
                "elementwise square needs dims > 0 and minval < maxval, got {dims}, [{minval}, {maxval})"
            )));
        }
        let uniform = Uniform::new(minval, maxval)
            .map_err(|e| OptimError::InvalidConfig(format!("initial range: {e}")))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..dims).map(|_| uniform.sample(&mut rng)).collect();
        Self::from_values(data)
    }

    /// A `[values.len(), 1]` variable starting at `values`.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` for an empty vector.
    pub fn from_values(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(OptimError::InvalidConfig(
                "elementwise square needs at least one coordinate".to_string(),
            ));
        }
        let dims = values.len();
        Ok(Self {
            specs: vec![VariableSpec::new("x", [dims, 1])],
            init: Tensor::new(values, [dims, 1])?,
        })
    }
}

impl Problem for ElementwiseSquare {
    fn name(&self) -> &str {
        "elementwise_square"
    }

    fn variables(&self) -> &[VariableSpec] {
        &self.specs
    }

    fn initial_values(&self) -> Vec<Matrix> {
        vec![self.init.clone()]
    }

    fn loss(&self, values: &[Var]) -> Result<Var> {
        check_arity(self.name(), 1, values)?;
        Ok(values[0].square().sum())
    }

    fn gradients(&self, values: &[Var], create_graph: bool) -> Result<Vec<Var>> {
        check_arity(self.name(), 1, values)?;
        let grad = values[0].scale(2.0);
        Ok(vec![if create_graph { grad } else { grad.detach() }])
    }
}

/// The Rosenbrock function `(1 - x)^2 + 100 (y - x^2)^2` over two scalar variables.
#[derive(Debug, Clone)]
pub struct Rosenbrock {
    specs: Vec<VariableSpec>,
    init: [f32; 2],
}

impl Rosenbrock {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            specs: vec![VariableSpec::new("x", [1, 1]), VariableSpec::new("y", [1, 1])],
            init: [x, y],
        }
    }
}

impl Default for Rosenbrock {
    fn default() -> Self {
        Self::new(-3.0, 3.0)
    }
}

impl Problem for Rosenbrock {
    fn name(&self) -> &str {
        "rosenbrock"
    }

    fn variables(&self) -> &[VariableSpec] {
        &self.specs
    }

    fn initial_values(&self) -> Vec<Matrix> {
        self.init.iter().map(|&v| Tensor::full([1, 1], v)).collect()
    }

    fn loss(&self, values: &[Var]) -> Result<Var> {
        check_arity(self.name(), 2, values)?;
        let (x, y) = (&values[0], &values[1]);
        let a = x.neg().add_scalar(1.0).square();
        let b = y.sub(&x.square())?.square().scale(100.0);
        Ok(a.add(&b)?.sum())
    }

    fn gradients(&self, values: &[Var], create_graph: bool) -> Result<Vec<Var>> {
        check_arity(self.name(), 2, values)?;
        let (x, y) = (&values[0], &values[1]);
        // d/dx = -2 (1 - x) - 400 x (y - x^2),  d/dy = 200 (y - x^2)
        let residual = y.sub(&x.square())?;
        let dx = x
            .add_scalar(-1.0)
            .scale(2.0)
            .sub(&x.mul(&residual)?.scale(400.0))?;
        let dy = residual.scale(200.0);
        let grads = vec![dx, dy];
        Ok(if create_graph {
            grads
        } else {
            grads.iter().map(Var::detach).collect()
        })
    }
}

/// Least squares `mean((X W + b - Y)^2)` on a fixed synthetic data set.
///
/// Targets are generated from a hidden `W*` with small Gaussian noise, so the minimum is close
/// to but not exactly zero. Gradients come from the default autograd implementation.
#[derive(Debug, Clone)]
pub struct LinearRegression {
    specs: Vec<VariableSpec>,
    inputs: Matrix,
    targets: Matrix,
    init: Vec<Matrix>,
}

impl LinearRegression {
    /// `samples` rows of `features` inputs regressed onto `outputs` targets.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` if any dimension is zero.
    pub fn new(samples: usize, features: usize, outputs: usize, seed: u64) -> Result<Self> {
        if samples == 0 || features == 0 || outputs == 0 {
            return Err(OptimError::InvalidConfig(format!(
                "linear regression needs non-zero dimensions, got {samples}x{features}->{outputs}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let unit = Normal::new(0.0f32, 1.0)
            .map_err(|e| OptimError::InvalidConfig(format!("data distribution: {e}")))?;
        let noise = Normal::new(0.0f32, 0.01)
            .map_err(|e| OptimError::InvalidConfig(format!("noise distribution: {e}")))?;

        let mut draw = |n: usize, dist: &Normal<f32>| -> Vec<f32> {
            (0..n).map(|_| dist.sample(&mut rng)).collect()
        };
        let inputs = Tensor::new(draw(samples * features, &unit), [samples, features])?;
        let true_w = Tensor::new(draw(features * outputs, &unit), [features, outputs])?;
        let jitter = Tensor::new(draw(samples * outputs, &noise), [samples, outputs])?;
        let targets = (&inputs.matmul(&true_w)? + &jitter)?;

        Ok(Self {
            specs: vec![
                VariableSpec::new("w", [features, outputs]),
                VariableSpec::new("b", [1, outputs]),
            ],
            inputs,
            targets,
            init: vec![
                Tensor::zeros([features, outputs]),
                Tensor::zeros([1, outputs]),
            ],
        })
    }
}

impl Problem for LinearRegression {
    fn name(&self) -> &str {
        "linear_regression"
    }

    fn variables(&self) -> &[VariableSpec] {
        &self.specs
    }

    fn initial_values(&self) -> Vec<Matrix> {
        self.init.clone()
    }

    fn loss(&self, values: &[Var]) -> Result<Var> {
        check_arity(self.name(), 2, values)?;
        let x = Var::new(self.inputs.clone());
        let y = Var::new(self.targets.clone());
        let prediction = x.matmul(&values[0])?.add(&values[1])?;
        Ok(prediction.sub(&y)?.square().mean())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(problem: &dyn Problem) -> Vec<Var> {
        problem.initial_values().into_iter().map(Var::new).collect()
    }

    #[test]
    fn test_elementwise_square_loss_and_grad() {
        let p = ElementwiseSquare::from_values(vec![1.0, -2.0, 3.0]).unwrap();
        let v = vars(&p);
        // 1 + 4 + 9
        assert_eq!(p.loss(&v).unwrap().value().data(), &[14.0]);
        let g = p.gradients(&v, false).unwrap();
        assert_eq!(g[0].value().data(), &[2.0, -4.0, 6.0]);
        assert!(!g[0].is_tracked());

        let g = p.gradients(&v, true).unwrap();
        assert!(g[0].is_tracked());
    }

    #[test]
    fn test_elementwise_square_seeded_init() {
        let a = ElementwiseSquare::new(5, -10.0, 10.0, 7).unwrap();
        let b = ElementwiseSquare::new(5, -10.0, 10.0, 7).unwrap();
        assert_eq!(a.initial_values(), b.initial_values());
        assert!(
            a.initial_values()[0]
                .data()
                .iter()
                .all(|v| (-10.0..10.0).contains(v))
        );
        assert!(ElementwiseSquare::new(0, -1.0, 1.0, 0).is_err());
        assert!(ElementwiseSquare::new(3, 1.0, 1.0, 0).is_err());
    }

    #[test]
    fn test_rosenbrock_gradient_matches_autograd() {
        let p = Rosenbrock::new(-1.5, 2.0);
        let v = vars(&p);
        let analytic = p.gradients(&v, false).unwrap();

        let leaves: Vec<Var> = v.iter().map(Var::detach).collect();
        p.loss(&leaves).unwrap().backward().unwrap();
        for (a, leaf) in analytic.iter().zip(&leaves) {
            let auto = leaf.grad_tensor().unwrap();
            assert!((a.value().data()[0] - auto.data()[0]).abs() < 1e-3);
        }

        // Minimum at (1, 1)
        let at_min = vec![Var::scalar(1.0), Var::scalar(1.0)];
        assert_eq!(p.loss(&at_min).unwrap().value().data(), &[0.0]);
    }

    #[test]
    fn test_linear_regression_default_gradients() {
        let p = LinearRegression::new(8, 3, 2, 1).unwrap();
        assert_eq!(p.variables_flattened_shape(), vec![6, 2]);
        let v = vars(&p);
        let g = p.gradients(&v, false).unwrap();
        assert_eq!(g[0].shape(), &[3, 2]);
        assert_eq!(g[1].shape(), &[1, 2]);
        assert!(g[0].value().data().iter().any(|x| *x != 0.0));

        let err = p.gradients(&v, true);
        assert!(matches!(err, Err(OptimError::InvalidConfig(_))));
    }

    #[test]
    fn test_flatten_and_set_shape() {
        let p = LinearRegression::new(4, 3, 2, 1).unwrap();
        let w = Var::new(Tensor::new((0..6).map(|i| i as f32).collect(), [3, 2]).unwrap());
        let flat = p.flatten(&w, 0).unwrap();
        assert_eq!(flat.shape(), &[6, 1]);
        let back = p.set_shape(&flat, 0).unwrap();
        assert_eq!(back.shape(), &[3, 2]);
        assert_eq!(back.value(), w.value());

        let wrong = Var::zeros([5, 1]);
        assert!(matches!(
            p.set_shape(&wrong, 0),
            Err(OptimError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            p.flatten(&wrong, 7),
            Err(OptimError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_arity_is_checked() {
        let p = Rosenbrock::default();
        assert!(p.loss(&[Var::scalar(0.0)]).is_err());
    }
}
