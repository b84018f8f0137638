//! Per-episode optimizer state.
//!
//! # State kinds
//!
//! Every update rule declares which [`StateKind`] it carries and produces a matching
//! [`RuleState`] at the start of an episode:
//!
//! | Kind | Contents | Rules |
//! |---|---|---|
//! | `Stateless` | nothing | MLP simple |
//! | `Moments` | `m`, `v` per variable, step counter `t` | Adam |
//! | `Hidden` | LSTM `(c, h)` per variable per layer | LSTM |
//! | `MovingAverage` | EMA of the preprocessed gradient | MLP moving-average |
//! | `GradientHistory` | ring buffer of preprocessed gradients | MLP gradient-history |
//! | `VariableHistory` | ring buffers of values and gradients | MLP x-history, x-history grad-norm/sign |
//!
//! # Ring buffers
//!
//! A [`HistoryBuffer`] keeps, per variable, a `[len, limit * width]` matrix: `limit` slots of
//! `width` columns each. One write pointer is shared by all variables of a buffer.
//!
//! The pointer always names the **most recently written** slot. A write first advances it,
//! `p <- (p + 1) mod limit`, then overwrites slot `p`. A fresh buffer starts at `p = limit - 1`,
//! so the first write lands in slot 0 and after `limit` writes the pointer is back where it
//! started.
//!
//! Reads present slots newest first: `p, p - 1, ..., 0, limit - 1, ..., p + 1`. See
//! [`recency_order`].
//!
//! ```rust
//! use l2l::state::recency_order;
//!
//! // Capacity 4, last write went to slot 0: slot 0 is newest, slot 1 oldest.
//! assert_eq!(recency_order(0, 4), vec![0, 3, 2, 1]);
//! ```
//!
//! Buffers hold graph variables, so a read inside an unroll is differentiable with respect to
//! everything written earlier in the same unroll.

use crate::error::{OptimError, Result};
use crate::tensor::Tensor;

pub use crate::nn::LstmState;
use crate::{Matrix, Var};

/// Added to a min-max range before dividing.
pub const RANGE_EPSILON: f32 = 1e-7;

/// Tag naming the state an update rule carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Stateless,
    Moments,
    Hidden,
    MovingAverage,
    GradientHistory,
    VariableHistory,
}

/// Slot indices at pointer `ptr`, most recent first.
///
/// `ptr` is reduced modulo `limit`; an empty buffer has no slots.
pub fn recency_order(ptr: usize, limit: usize) -> Vec<usize> {
    if limit == 0 {
        return Vec::new();
    }
    let ptr = ptr % limit;
    (0..limit).map(|k| (ptr + limit - k) % limit).collect()
}

/// Column indices of a `limit * width` buffer in recency order, slot by slot.
pub fn recency_columns(ptr: usize, limit: usize, width: usize) -> Vec<usize> {
    recency_order(ptr, limit)
        .into_iter()
        .flat_map(|slot| slot * width..(slot + 1) * width)
        .collect()
}

/// Row-wise `(x - min) / (max - min + 1e-7)`. Results lie in `[0, 1]`; constant rows map to 0.
///
/// # Errors
///
/// Returns a tensor error for a matrix without columns.
pub fn min_max_normalize(history: &Var) -> Result<Var> {
    let max = history.row_max()?;
    let min = history.row_min()?;
    let range = max.sub(&min)?.add_scalar(RANGE_EPSILON);
    Ok(history.sub(&min)?.div(&range)?)
}

/// Row-wise rescaling to `[-1, 1]`: `2 (x - min) / (max - min) - 1`. Constant rows map to 0.
///
/// # Errors
///
/// Returns a tensor error for a matrix without columns.
pub fn min_max_symmetric(history: &Var) -> Result<Var> {
    let max = history.row_max()?;
    let min = history.row_min()?;
    let range = max.sub(&min)?;
    let flat: Matrix = range.value().map(|r| if r == 0.0 { 1.0 } else { 0.0 });
    let live = Var::new(flat.map(|f| 1.0 - f));
    let safe = range.add(&Var::new(flat))?;
    let scaled = history
        .sub(&min)?
        .div(&safe)?
        .scale(2.0)
        .add_scalar(-1.0);
    Ok(scaled.mul(&live)?)
}

/// Row-wise division by the infinity norm, with divisor 1 where the norm is exactly 0.
///
/// # Errors
///
/// Returns a tensor error for a matrix without columns.
pub fn inf_norm_normalize(history: &Var) -> Result<Var> {
    let norm = history.abs().row_max()?;
    let zero = Var::new(norm.value().map(|n| if n == 0.0 { 1.0 } else { 0.0 }));
    let safe = norm.add(&zero)?;
    Ok(history.div(&safe)?)
}

/// Row-wise `(max, min)` as `[rows, 1]` columns.
///
/// # Errors
///
/// Returns a tensor error for a matrix without columns.
pub fn row_range(history: &Var) -> Result<(Var, Var)> {
    Ok((history.row_max()?, history.row_min()?))
}

/// Ring buffer of per-variable column blocks with one shared write pointer.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    buffers: Vec<Var>,
    limit: usize,
    width: usize,
    ptr: usize,
}

impl HistoryBuffer {
    /// Zero buffers for variables of the given flattened lengths.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` if `limit` or `width` is zero.
    pub fn zeros(lengths: &[usize], limit: usize, width: usize) -> Result<Self> {
        if limit == 0 || width == 0 {
            return Err(OptimError::InvalidConfig(format!(
                "history buffer needs limit > 0 and width > 0, got {limit} and {width}"
            )));
        }
        Ok(Self {
            buffers: lengths
                .iter()
                .map(|&len| Var::zeros([len, limit * width]))
                .collect(),
            limit,
            width,
            ptr: limit - 1,
        })
    }

    /// A buffer whose every slot holds `values[i]` for variable `i`, pointer at `limit - 1`.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidConfig` if a value is not `width` columns wide.
    pub fn filled(values: &[Var], limit: usize, width: usize) -> Result<Self> {
        let lengths: Vec<usize> = values.iter().map(|v| v.shape()[0]).collect();
        let mut buffer = Self::zeros(&lengths, limit, width)?;
        for _ in 0..limit {
            buffer.write(values).map_err(|e| match e {
                OptimError::ShapeMismatch { variable, expected, got } => OptimError::InvalidConfig(
                    format!("history fill for {variable}: expected {expected:?}, got {got:?}"),
                ),
                other => other,
            })?;
        }
        Ok(buffer)
    }

    pub const fn limit(&self) -> usize {
        self.limit
    }

    pub const fn width(&self) -> usize {
        self.width
    }

    /// Slot written most recently.
    pub const fn ptr(&self) -> usize {
        self.ptr
    }

    pub fn num_variables(&self) -> usize {
        self.buffers.len()
    }

    /// Advances the pointer and writes `values[i]` (`[len_i, width]`) into the new slot of
    /// every variable.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::ShapeMismatch` if the number of values or a value's shape is
    /// wrong. The buffer is unchanged on error.
    pub fn write(&mut self, values: &[Var]) -> Result<()> {
        if values.len() != self.buffers.len() {
            return Err(OptimError::ShapeMismatch {
                variable: "history".to_string(),
                expected: vec![self.buffers.len()],
                got: vec![values.len()],
            });
        }
        let ptr = (self.ptr + 1) % self.limit;
        let mut next = Vec::with_capacity(values.len());
        for (i, (buffer, value)) in self.buffers.iter().zip(values).enumerate() {
            let expected = [buffer.shape()[0], self.width];
            if *value.shape() != expected {
                return Err(OptimError::ShapeMismatch {
                    variable: format!("history[{i}]"),
                    expected: expected.to_vec(),
                    got: value.shape().to_vec(),
                });
            }
            next.push(buffer.write_columns(ptr * self.width, value)?);
        }
        self.buffers = next;
        self.ptr = ptr;
        Ok(())
    }

    /// Buffer of variable `index` with slots in recency order.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidState` for an unknown variable index.
    pub fn read_recent(&self, index: usize) -> Result<Var> {
        let columns = recency_columns(self.ptr, self.limit, self.width);
        Ok(self.raw(index)?.select_columns(&columns)?)
    }

    /// Buffer of variable `index` in storage order.
    ///
    /// # Errors
    ///
    /// Returns `OptimError::InvalidState` for an unknown variable index.
    pub fn raw(&self, index: usize) -> Result<&Var> {
        self.buffers.get(index).ok_or_else(|| {
            OptimError::InvalidState(format!(
                "history has {} variables, asked for {index}",
                self.buffers.len()
            ))
        })
    }

    /// Same contents and pointer, cut from the graph.
    pub fn detach(&self) -> Self {
        Self {
            buffers: self.buffers.iter().map(Var::detach).collect(),
            limit: self.limit,
            width: self.width,
            ptr: self.ptr,
        }
    }

    fn values(&self) -> impl Iterator<Item = Matrix> + '_ {
        self.buffers.iter().map(|b| b.value().clone())
    }
}

/// Value and gradient histories written in lock-step.
#[derive(Debug, Clone)]
pub struct VariableHistory {
    pub values: HistoryBuffer,
    pub gradients: HistoryBuffer,
}

impl VariableHistory {
    /// # Errors
    ///
    /// See [`HistoryBuffer::zeros`].
    pub fn zeros(lengths: &[usize], limit: usize) -> Result<Self> {
        Ok(Self {
            values: HistoryBuffer::zeros(lengths, limit, 1)?,
            gradients: HistoryBuffer::zeros(lengths, limit, 1)?,
        })
    }

    /// Writes one `[len, 1]` value column and one gradient column per variable.
    ///
    /// # Errors
    ///
    /// See [`HistoryBuffer::write`]. Neither buffer changes on error.
    pub fn write(&mut self, values: &[Var], gradients: &[Var]) -> Result<()> {
        let mut next_values = self.values.clone();
        next_values.write(values)?;
        let mut next_gradients = self.gradients.clone();
        next_gradients.write(gradients)?;
        self.values = next_values;
        self.gradients = next_gradients;
        Ok(())
    }

    pub const fn ptr(&self) -> usize {
        self.values.ptr()
    }

    pub fn detach(&self) -> Self {
        Self {
            values: self.values.detach(),
            gradients: self.gradients.detach(),
        }
    }
}

/// Adam moment estimates.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentState {
    pub m: Vec<Matrix>,
    pub v: Vec<Matrix>,
    /// Step counter, starts at 1.
    pub t: u64,
}

impl MomentState {
    pub fn zeros(lengths: &[usize]) -> Self {
        Self {
            m: lengths.iter().map(|&n| Tensor::zeros([n, 1])).collect(),
            v: lengths.iter().map(|&n| Tensor::zeros([n, 1])).collect(),
            t: 1,
        }
    }
}

/// State carried by an update rule through an episode.
#[derive(Debug, Clone)]
pub enum RuleState {
    Stateless,
    Moments(MomentState),
    /// Per variable, per layer.
    Hidden(Vec<Vec<LstmState>>),
    /// Per variable `[len, width]`.
    MovingAverage(Vec<Var>),
    GradientHistory(HistoryBuffer),
    VariableHistory(VariableHistory),
}

/// Plain-value copy of a [`RuleState`], comparable with `==`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub tensors: Vec<Matrix>,
    /// Pointers and step counters.
    pub counters: Vec<u64>,
}

impl RuleState {
    pub const fn kind(&self) -> StateKind {
        match self {
            Self::Stateless => StateKind::Stateless,
            Self::Moments(_) => StateKind::Moments,
            Self::Hidden(_) => StateKind::Hidden,
            Self::MovingAverage(_) => StateKind::MovingAverage,
            Self::GradientHistory(_) => StateKind::GradientHistory,
            Self::VariableHistory(_) => StateKind::VariableHistory,
        }
    }

    /// Same state, cut from the graph, so the next unroll starts a fresh tape.
    pub fn detach(&self) -> Self {
        match self {
            Self::Stateless => Self::Stateless,
            Self::Moments(m) => Self::Moments(m.clone()),
            Self::Hidden(layers) => Self::Hidden(
                layers
                    .iter()
                    .map(|per_var| per_var.iter().map(LstmState::detach).collect())
                    .collect(),
            ),
            Self::MovingAverage(avg) => Self::MovingAverage(avg.iter().map(Var::detach).collect()),
            Self::GradientHistory(h) => Self::GradientHistory(h.detach()),
            Self::VariableHistory(h) => Self::VariableHistory(h.detach()),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let (tensors, counters): (Vec<Matrix>, Vec<u64>) = match self {
            Self::Stateless => (Vec::new(), Vec::new()),
            Self::Moments(s) => (s.m.iter().chain(&s.v).cloned().collect(), vec![s.t]),
            Self::Hidden(vars) => (
                vars.iter()
                    .flatten()
                    .flat_map(|s| {
                        let (c, h) = s.values();
                        [c, h]
                    })
                    .collect(),
                Vec::new(),
            ),
            Self::MovingAverage(avg) => (avg.iter().map(|a| a.value().clone()).collect(), Vec::new()),
            Self::GradientHistory(h) => (h.values().collect(), vec![h.ptr() as u64]),
            Self::VariableHistory(h) => (
                h.values.values().chain(h.gradients.values()).collect(),
                vec![h.values.ptr() as u64, h.gradients.ptr() as u64],
            ),
        };
        StateSnapshot { tensors, counters }
    }
}

/// Variable values and rule state threaded through an unroll.
#[derive(Debug, Clone)]
pub struct StepState {
    /// Current values in native shapes.
    pub variables: Vec<Var>,
    pub rule: RuleState,
}

impl StepState {
    /// Same state, cut from the graph.
    pub fn detach(&self) -> Self {
        Self {
            variables: self.variables.iter().map(Var::detach).collect(),
            rule: self.rule.detach(),
        }
    }

    pub fn values(&self) -> Vec<Matrix> {
        self.variables.iter().map(|v| v.value().clone()).collect()
    }

    /// Variable values followed by the rule state.
    pub fn snapshot(&self) -> StateSnapshot {
        let rule = self.rule.snapshot();
        StateSnapshot {
            tensors: self.values().into_iter().chain(rule.tensors).collect(),
            counters: rule.counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(data: Vec<f32>) -> Var {
        let n = data.len();
        Var::new(Tensor::new(data, [n, 1]).unwrap())
    }

    fn row(data: Vec<f32>) -> Var {
        let n = data.len();
        Var::new(Tensor::new(data, [1, n]).unwrap())
    }

    #[test]
    fn test_recency_order() {
        assert_eq!(recency_order(3, 4), vec![3, 2, 1, 0]);
        assert_eq!(recency_order(1, 4), vec![1, 0, 3, 2]);
        assert_eq!(recency_order(5, 4), vec![1, 0, 3, 2]);
        assert!(recency_order(0, 0).is_empty());
        assert_eq!(recency_columns(0, 3, 2), vec![0, 1, 4, 5, 2, 3]);
    }

    #[test]
    fn test_pointer_returns_after_limit_writes() {
        let mut h = HistoryBuffer::zeros(&[2], 3, 1).unwrap();
        let start = h.ptr();
        assert_eq!(start, 2);
        for k in 0..3 {
            h.write(&[column(vec![k as f32, k as f32])]).unwrap();
        }
        assert_eq!(h.ptr(), start);
        // Newest first, slot (p + 1) mod limit last
        let recent = h.read_recent(0).unwrap();
        assert_eq!(recent.value().data(), &[2.0, 1.0, 0.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_write_checks_shapes() {
        let mut h = HistoryBuffer::zeros(&[2, 3], 2, 1).unwrap();
        assert!(matches!(
            h.write(&[column(vec![1.0, 2.0])]),
            Err(OptimError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            h.write(&[column(vec![1.0, 2.0]), column(vec![1.0])]),
            Err(OptimError::ShapeMismatch { .. })
        ));
        // Unchanged after the failed writes
        assert_eq!(h.ptr(), 1);
        assert!(HistoryBuffer::zeros(&[1], 0, 1).is_err());
        assert!(h.raw(2).is_err());
    }

    #[test]
    fn test_wide_slots() {
        let mut h = HistoryBuffer::zeros(&[1], 2, 2).unwrap();
        h.write(&[row(vec![1.0, 10.0])]).unwrap();
        h.write(&[row(vec![2.0, 20.0])]).unwrap();
        assert_eq!(h.raw(0).unwrap().value().data(), &[1.0, 10.0, 2.0, 20.0]);
        assert_eq!(h.read_recent(0).unwrap().value().data(), &[2.0, 20.0, 1.0, 10.0]);
    }

    #[test]
    fn test_filled() {
        let h = HistoryBuffer::filled(&[column(vec![3.0])], 3, 1).unwrap();
        assert_eq!(h.raw(0).unwrap().value().data(), &[3.0, 3.0, 3.0]);
        assert_eq!(h.ptr(), 2);
        assert!(matches!(
            HistoryBuffer::filled(&[row(vec![1.0, 2.0])], 3, 1),
            Err(OptimError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_history_reads_are_differentiable() {
        let mut h = HistoryBuffer::zeros(&[1], 2, 1).unwrap();
        let g = Var::scalar(4.0);
        h.write(&[g.clone()]).unwrap();
        h.read_recent(0).unwrap().sum().backward().unwrap();
        assert_eq!(g.grad_tensor().unwrap().data(), &[1.0]);
    }

    #[test]
    fn test_min_max_normalize_bounds() {
        let x = Var::new(Tensor::new(vec![1.0, 3.0, 2.0, 5.0, 5.0, 5.0], [2, 3]).unwrap());
        let n = min_max_normalize(&x).unwrap();
        let d = n.value().data();
        assert!(d.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(d[0], 0.0);
        assert!((d[1] - 1.0).abs() < 1e-6);
        assert!((d[2] - 0.5).abs() < 1e-6);
        // Constant row
        assert_eq!(&d[3..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_min_max_symmetric() {
        let x = Var::new(Tensor::new(vec![1.0, 3.0, 2.0, 4.0, 4.0, 4.0], [2, 3]).unwrap());
        let n = min_max_symmetric(&x).unwrap();
        assert_eq!(n.value().data(), &[-1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_inf_norm_normalize() {
        let x = Var::new(Tensor::new(vec![-4.0, 2.0, 0.0, 0.0], [2, 2]).unwrap());
        let n = inf_norm_normalize(&x).unwrap();
        assert_eq!(n.value().data(), &[-1.0, 0.5, 0.0, 0.0]);
        assert!(n.value().data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_variable_history_lock_step() {
        let mut h = VariableHistory::zeros(&[1], 3).unwrap();
        h.write(&[Var::scalar(1.0)], &[Var::scalar(-1.0)]).unwrap();
        assert_eq!(h.values.ptr(), h.gradients.ptr());
        assert_eq!(h.ptr(), 0);
        // A failing gradient write leaves both buffers untouched
        assert!(h.write(&[Var::scalar(1.0)], &[]).is_err());
        assert_eq!(h.ptr(), 0);
    }

    #[test]
    fn test_snapshot_and_detach() {
        let mut h = HistoryBuffer::zeros(&[1], 2, 1).unwrap();
        h.write(&[Var::scalar(1.0).scale(2.0)]).unwrap();
        let state = RuleState::GradientHistory(h);
        assert_eq!(state.kind(), StateKind::GradientHistory);

        let detached = state.detach();
        assert_eq!(detached.snapshot(), state.snapshot());
        assert_eq!(state.snapshot().counters, vec![0]);

        let moments = RuleState::Moments(MomentState::zeros(&[2]));
        assert_eq!(moments.snapshot().counters, vec![1]);
        assert_eq!(moments.kind(), StateKind::Moments);
    }
}
