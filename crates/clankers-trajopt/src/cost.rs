//! Cost model strategies.
//!
//! Every cost here reads only the leading state and action components of
//! the trajectory, so an `(x, u)` cost can be lifted into the joint
//! `(x, u, v)` space of a robust game with [`DisturbedCost`].

use nalgebra::{DMatrix, DVector};

use crate::error::{ApproximationError, ConfigError};
use crate::linalg::{segment, symmetrize};
use crate::model::CostModel;
use crate::types::{CostQuadratic, TrajectoryDistribution};

// ---------------------------------------------------------------------------
// QuadraticCost
// ---------------------------------------------------------------------------

/// `½ (x - x*)ᵀ Q (x - x*) + ½ uᵀ R u`, with the state term scaled by
/// `final_weight` at the last step.
#[derive(Clone, Debug, PartialEq)]
pub struct QuadraticCost {
    q: DMatrix<f64>,
    r: DMatrix<f64>,
    target: DVector<f64>,
    final_weight: f64,
}

impl QuadraticCost {
    pub fn new(q: DMatrix<f64>, r: DMatrix<f64>) -> Result<Self, ConfigError> {
        if !q.is_square() {
            return Err(ConfigError::DimensionMismatch {
                what: "Q columns".into(),
                expected: q.nrows(),
                got: q.ncols(),
            });
        }
        if !r.is_square() {
            return Err(ConfigError::DimensionMismatch {
                what: "R columns".into(),
                expected: r.nrows(),
                got: r.ncols(),
            });
        }
        let n = q.nrows();
        Ok(Self {
            q: symmetrize(&q),
            r: symmetrize(&r),
            target: DVector::zeros(n),
            final_weight: 1.0,
        })
    }

    pub fn with_target(mut self, target: DVector<f64>) -> Result<Self, ConfigError> {
        if target.len() != self.state_dim() {
            return Err(ConfigError::DimensionMismatch {
                what: "cost target".into(),
                expected: self.state_dim(),
                got: target.len(),
            });
        }
        self.target = target;
        Ok(self)
    }

    #[must_use]
    pub fn with_final_weight(mut self, final_weight: f64) -> Self {
        self.final_weight = final_weight;
        self
    }

    pub fn state_dim(&self) -> usize {
        self.q.nrows()
    }

    pub fn action_dim(&self) -> usize {
        self.r.nrows()
    }

    /// Exact expansion at step `t` of a horizon `horizon`.
    pub fn expansion(&self, t: usize, horizon: usize) -> CostQuadratic {
        let n = self.state_dim();
        let m = self.action_dim();
        let weight = if t + 1 == horizon { self.final_weight } else { 1.0 };
        let q = &self.q * weight;
        let qx = &q * &self.target;

        let mut out = CostQuadratic::zeros(n + m);
        out.cm.view_mut((0, 0), (n, n)).copy_from(&q);
        out.cm.view_mut((n, n), (m, m)).copy_from(&self.r);
        out.cv.rows_mut(0, n).copy_from(&(-&qx));
        out.cc = 0.5 * self.target.dot(&qx);
        out
    }
}

impl CostModel for QuadraticCost {
    fn quadratize(
        &self,
        trajectory: &TrajectoryDistribution,
        t: usize,
    ) -> Result<CostQuadratic, ApproximationError> {
        if trajectory.state_dim() != self.state_dim() {
            return Err(ApproximationError::DimensionMismatch {
                t,
                what: "cost state",
                expected: (self.state_dim(), 1),
                got: (trajectory.state_dim(), 1),
            });
        }
        Ok(self.expansion(t, trajectory.horizon()))
    }
    fn dims(&self) -> Option<(usize, usize)> {
        Some((self.state_dim(), self.action_dim()))
    }
}

// ---------------------------------------------------------------------------
// FiniteDifferenceCost
// ---------------------------------------------------------------------------

/// Numerical second-order expansion of a scalar running cost `l(x, u, t)`.
pub struct FiniteDifferenceCost<F> {
    cost: F,
    action_dim: usize,
    epsilon: f64,
}

impl<F> FiniteDifferenceCost<F>
where
    F: Fn(&DVector<f64>, &DVector<f64>, usize) -> f64 + Send + Sync,
{
    /// `action_dim` is the number of leading action components `l` reads.
    pub fn new(cost: F, action_dim: usize) -> Self {
        Self {
            cost,
            action_dim,
            epsilon: 1e-4,
        }
    }

    #[must_use]
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    fn eval(&self, z: &DVector<f64>, n: usize, t: usize) -> Result<f64, ApproximationError> {
        let value = (self.cost)(&segment(z, 0, n), &segment(z, n, self.action_dim), t);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ApproximationError::NonFinite {
                t,
                what: "cost value",
            })
        }
    }
}

impl<F> CostModel for FiniteDifferenceCost<F>
where
    F: Fn(&DVector<f64>, &DVector<f64>, usize) -> f64 + Send + Sync,
{
    fn quadratize(
        &self,
        trajectory: &TrajectoryDistribution,
        t: usize,
    ) -> Result<CostQuadratic, ApproximationError> {
        let n = trajectory.state_dim();
        if trajectory.action_dim() < self.action_dim {
            return Err(ApproximationError::DimensionMismatch {
                t,
                what: "cost action",
                expected: (self.action_dim, 1),
                got: (trajectory.action_dim(), 1),
            });
        }
        let dim = n + self.action_dim;
        let z = segment(trajectory.mean(t), 0, dim);
        let h = self.epsilon;
        let shifted = |i: usize, di: f64, j: usize, dj: f64| -> Result<f64, ApproximationError> {
            let mut p = z.clone();
            p[i] += di;
            p[j] += dj;
            self.eval(&p, n, t)
        };

        let value = self.eval(&z, n, t)?;
        let mut grad = DVector::zeros(dim);
        let mut hess = DMatrix::zeros(dim, dim);
        for i in 0..dim {
            let plus = shifted(i, h, i, 0.0)?;
            let minus = shifted(i, -h, i, 0.0)?;
            grad[i] = (plus - minus) / (2.0 * h);
            hess[(i, i)] = (plus - 2.0 * value + minus) / (h * h);
            for j in 0..i {
                let pp = shifted(i, h, j, h)?;
                let pm = shifted(i, h, j, -h)?;
                let mp = shifted(i, -h, j, h)?;
                let mm = shifted(i, -h, j, -h)?;
                let hij = (pp - pm - mp + mm) / (4.0 * h * h);
                hess[(i, j)] = hij;
                hess[(j, i)] = hij;
            }
        }
        Ok(CostQuadratic::from_expansion(&z, value, &grad, &hess))
    }
}

// ---------------------------------------------------------------------------
// CompositeCost
// ---------------------------------------------------------------------------

/// Weighted sum of cost terms over the same space.
#[derive(Default)]
pub struct CompositeCost {
    terms: Vec<(f64, Box<dyn CostModel>)>,
}

impl CompositeCost {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, weight: f64, cost: impl CostModel + 'static) -> Self {
        self.terms.push((weight, Box::new(cost)));
        self
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl CostModel for CompositeCost {
    fn quadratize(
        &self,
        trajectory: &TrajectoryDistribution,
        t: usize,
    ) -> Result<CostQuadratic, ApproximationError> {
        let mut terms = self.terms.iter();
        let Some((w0, first)) = terms.next() else {
            return Err(ApproximationError::Undefined {
                t,
                reason: "composite cost has no terms".into(),
            });
        };
        let mut total = first.quadratize(trajectory, t)?.scaled(*w0);
        for (weight, term) in terms {
            let q = term.quadratize(trajectory, t)?;
            if q.dim() != total.dim() {
                return Err(ApproximationError::DimensionMismatch {
                    t,
                    what: "composite cost term",
                    expected: (total.dim(), 1),
                    got: (q.dim(), 1),
                });
            }
            total = total.plus(&q.scaled(*weight));
        }
        Ok(total)
    }
    fn dims(&self) -> Option<(usize, usize)> {
        self.terms.iter().find_map(|(_, term)| term.dims())
    }
}

// ---------------------------------------------------------------------------
// DisturbedCost
// ---------------------------------------------------------------------------

/// Lifts an `(x, u)` cost into the `(x, u, v)` space by padding zero rows
/// and columns for the `disturbance_dim` trailing disturbance inputs.
pub struct DisturbedCost<C> {
    inner: C,
    disturbance_dim: usize,
}

impl<C: CostModel> DisturbedCost<C> {
    pub fn new(inner: C, disturbance_dim: usize) -> Self {
        Self {
            inner,
            disturbance_dim,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: CostModel> CostModel for DisturbedCost<C> {
    fn quadratize(
        &self,
        trajectory: &TrajectoryDistribution,
        t: usize,
    ) -> Result<CostQuadratic, ApproximationError> {
        let q = self.inner.quadratize(trajectory, t)?;
        let inner_dim = q.dim();
        let dim = inner_dim + self.disturbance_dim;
        let mut out = CostQuadratic::zeros(dim);
        out.cm.view_mut((0, 0), (inner_dim, inner_dim)).copy_from(&q.cm);
        out.cv.rows_mut(0, inner_dim).copy_from(&q.cv);
        out.cc = q.cc;
        Ok(out)
    }
    fn dims(&self) -> Option<(usize, usize)> {
        self.inner.dims().map(|(n, a)| (n, a + self.disturbance_dim))
    }
}
