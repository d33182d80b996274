//! Core data types: local models, linear-Gaussian controllers and the
//! trajectory distributions they induce.

use nalgebra::{DMatrix, DVector};

use crate::error::ConfigError;
use crate::linalg::{block, block_diag, concat, definite_cholesky, segment};

/// Local linear-Gaussian dynamics `x' ~ N(F [x; a] + f, Σ_dyn)` at one time step.
#[derive(Clone, Debug, PartialEq)]
pub struct DynamicsLinear {
    /// Transition matrix, n × (n + a).
    pub fm: DMatrix<f64>,
    /// Offset, n.
    pub fv: DVector<f64>,
    /// Process noise covariance, n × n.
    pub covar: DMatrix<f64>,
}

impl DynamicsLinear {
    pub fn state_dim(&self) -> usize {
        self.fm.nrows()
    }

    pub fn action_dim(&self) -> usize {
        self.fm.ncols().saturating_sub(self.fm.nrows())
    }

    /// Predicted next-state mean for a stacked `[x; a]` point.
    pub fn predict(&self, xa: &DVector<f64>) -> DVector<f64> {
        &self.fm * xa + &self.fv
    }
}

/// Local quadratic cost `c(z) ≈ cc + cvᵀz + ½ zᵀ cm z` over the stacked
/// state-action vector, in absolute coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct CostQuadratic {
    pub cm: DMatrix<f64>,
    pub cv: DVector<f64>,
    pub cc: f64,
}

impl CostQuadratic {
    pub fn zeros(dim: usize) -> Self {
        Self {
            cm: DMatrix::zeros(dim, dim),
            cv: DVector::zeros(dim),
            cc: 0.0,
        }
    }

    pub fn dim(&self) -> usize {
        self.cv.len()
    }

    /// Expansion around `point` with gradient `grad` and Hessian `hess`,
    /// rewritten in absolute coordinates.
    pub fn from_expansion(
        point: &DVector<f64>,
        value: f64,
        grad: &DVector<f64>,
        hess: &DMatrix<f64>,
    ) -> Self {
        let hp = hess * point;
        Self {
            cm: hess.clone(),
            cv: grad - &hp,
            cc: value - grad.dot(point) + 0.5 * point.dot(&hp),
        }
    }

    /// Value of the quadratic at `z`.
    pub fn evaluate(&self, z: &DVector<f64>) -> f64 {
        self.cc + self.cv.dot(z) + 0.5 * z.dot(&(&self.cm * z))
    }

    /// Expected value under `N(mean, covar)`.
    pub fn expectation(&self, mean: &DVector<f64>, covar: &DMatrix<f64>) -> f64 {
        self.evaluate(mean) + 0.5 * self.cm.component_mul(covar).sum()
    }

    /// Same expansion with the Hessian projected onto the PSD cone.
    ///
    /// The constant is shifted so the value at `anchor` is unchanged.
    #[must_use]
    pub fn regularized(&self, anchor: &DVector<f64>) -> Self {
        let cm = crate::linalg::project_psd(&self.cm, 0.0);
        let grad = &self.cm * anchor + &self.cv;
        Self::from_expansion(anchor, self.evaluate(anchor), &grad, &cm)
    }

    /// `scale * self`.
    #[must_use]
    pub fn scaled(&self, scale: f64) -> Self {
        Self {
            cm: &self.cm * scale,
            cv: &self.cv * scale,
            cc: self.cc * scale,
        }
    }

    /// Sum of two expansions over the same space.
    #[must_use]
    pub fn plus(&self, other: &Self) -> Self {
        Self {
            cm: &self.cm + &other.cm,
            cv: &self.cv + &other.cv,
            cc: self.cc + other.cc,
        }
    }
}

/// One time step of a linear-Gaussian controller `a ~ N(K x + k, Σ)`.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearGaussianStep {
    /// Feedback gain K, a × n.
    pub gain: DMatrix<f64>,
    /// Bias k, a.
    pub bias: DVector<f64>,
    /// Covariance Σ, a × a.
    pub covar: DMatrix<f64>,
    /// Lower Cholesky factor of Σ.
    pub chol_covar: DMatrix<f64>,
    /// Precision Σ⁻¹.
    pub inv_covar: DMatrix<f64>,
}

impl LinearGaussianStep {
    /// Builds a step from its covariance, deriving the factor and precision.
    ///
    /// Returns `None` when the covariance is not positive definite.
    pub fn new(gain: DMatrix<f64>, bias: DVector<f64>, covar: DMatrix<f64>) -> Option<Self> {
        let chol = definite_cholesky(&covar)?;
        let inv_covar = chol.inverse();
        Some(Self {
            gain,
            bias,
            chol_covar: chol.l(),
            inv_covar,
            covar,
        })
    }

    /// Builds a step from its precision, which is what the backward pass
    /// produces.
    pub fn from_precision(
        gain: DMatrix<f64>,
        bias: DVector<f64>,
        inv_covar: DMatrix<f64>,
    ) -> Option<Self> {
        let covar = crate::linalg::symmetrize(&definite_cholesky(&inv_covar)?.inverse());
        let chol_covar = definite_cholesky(&covar)?.l();
        Some(Self {
            gain,
            bias,
            covar,
            chol_covar,
            inv_covar,
        })
    }

    /// Zero gain and bias with isotropic covariance `var·I`.
    pub fn isotropic(action_dim: usize, state_dim: usize, var: f64) -> Self {
        let eye = DMatrix::<f64>::identity(action_dim, action_dim);
        Self {
            gain: DMatrix::zeros(action_dim, state_dim),
            bias: DVector::zeros(action_dim),
            covar: &eye * var,
            chol_covar: &eye * var.sqrt(),
            inv_covar: &eye * var.recip(),
        }
    }

    pub fn action_dim(&self) -> usize {
        self.bias.len()
    }

    pub fn state_dim(&self) -> usize {
        self.gain.ncols()
    }

    /// Mean action at state `x`.
    pub fn mean_action(&self, x: &DVector<f64>) -> DVector<f64> {
        &self.gain * x + &self.bias
    }
}

/// Time-indexed linear-Gaussian controller.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearGaussianController {
    steps: Vec<LinearGaussianStep>,
}

impl LinearGaussianController {
    pub fn from_steps(steps: Vec<LinearGaussianStep>) -> Self {
        Self { steps }
    }

    /// Zero-gain controller with covariance `var·I` at every step.
    pub fn zero(horizon: usize, state_dim: usize, action_dim: usize, var: f64) -> Self {
        Self {
            steps: (0..horizon)
                .map(|_| LinearGaussianStep::isotropic(action_dim, state_dim, var))
                .collect(),
        }
    }

    /// Joint controller acting on `[a; b]` with block-diagonal covariance.
    ///
    /// Both controllers must share horizon and state dimension.
    pub fn stacked(a: &Self, b: &Self) -> Self {
        let steps = a
            .steps
            .iter()
            .zip(&b.steps)
            .map(|(sa, sb)| {
                let mut gain = DMatrix::zeros(sa.action_dim() + sb.action_dim(), sa.state_dim());
                gain.view_mut((0, 0), sa.gain.shape()).copy_from(&sa.gain);
                gain.view_mut((sa.action_dim(), 0), sb.gain.shape())
                    .copy_from(&sb.gain);
                LinearGaussianStep {
                    gain,
                    bias: concat(&sa.bias, &sb.bias),
                    covar: block_diag(&sa.covar, &sb.covar),
                    chol_covar: block_diag(&sa.chol_covar, &sb.chol_covar),
                    inv_covar: block_diag(&sa.inv_covar, &sb.inv_covar),
                }
            })
            .collect();
        Self { steps }
    }

    pub fn horizon(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, t: usize) -> &LinearGaussianStep {
        &self.steps[t]
    }

    pub fn steps(&self) -> &[LinearGaussianStep] {
        &self.steps
    }

    pub fn action_dim(&self) -> usize {
        self.steps.first().map_or(0, LinearGaussianStep::action_dim)
    }

    pub fn state_dim(&self) -> usize {
        self.steps.first().map_or(0, LinearGaussianStep::state_dim)
    }

    /// Largest absolute difference of gains and biases between two controllers.
    pub fn max_mean_difference(&self, other: &Self) -> f64 {
        self.steps
            .iter()
            .zip(&other.steps)
            .map(|(a, b)| (&a.gain - &b.gain).amax().max((&a.bias - &b.bias).amax()))
            .fold(0.0, f64::max)
    }
}

/// Gaussian distribution of the state at `t = 0`.
#[derive(Clone, Debug, PartialEq)]
pub struct InitialState {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

impl InitialState {
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> Self {
        Self { mean, covariance }
    }

    /// Point mass at `mean`.
    pub fn deterministic(mean: DVector<f64>) -> Self {
        let n = mean.len();
        Self {
            mean,
            covariance: DMatrix::zeros(n, n),
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Checks shapes against the configured state dimension.
    pub fn validate(&self, state_dim: usize) -> Result<(), ConfigError> {
        if self.mean.len() != state_dim {
            return Err(ConfigError::DimensionMismatch {
                what: "initial state mean".into(),
                expected: state_dim,
                got: self.mean.len(),
            });
        }
        if self.covariance.shape() != (state_dim, state_dim) {
            return Err(ConfigError::DimensionMismatch {
                what: "initial state covariance".into(),
                expected: state_dim,
                got: self.covariance.nrows(),
            });
        }
        if !self.mean.iter().chain(self.covariance.iter()).all(|v| v.is_finite()) {
            return Err(ConfigError::invalid("initial_state", "contains non-finite values"));
        }
        Ok(())
    }
}

/// Marginals of the stacked state-action vector over the horizon, together
/// with the controller that generated them.
///
/// Produced whole by a forward pass and never edited afterwards; a new
/// round always builds a new value.
#[derive(Clone, Debug, PartialEq)]
pub struct TrajectoryDistribution {
    pub(crate) controller: LinearGaussianController,
    pub(crate) mu: Vec<DVector<f64>>,
    pub(crate) sigma: Vec<DMatrix<f64>>,
    pub(crate) state_dim: usize,
}

impl TrajectoryDistribution {
    pub fn controller(&self) -> &LinearGaussianController {
        &self.controller
    }

    pub fn horizon(&self) -> usize {
        self.mu.len()
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn action_dim(&self) -> usize {
        self.controller.action_dim()
    }

    /// Joint mean of `[x; a]` at `t`.
    pub fn mean(&self, t: usize) -> &DVector<f64> {
        &self.mu[t]
    }

    /// Joint covariance of `[x; a]` at `t`.
    pub fn covariance(&self, t: usize) -> &DMatrix<f64> {
        &self.sigma[t]
    }

    pub fn state_mean(&self, t: usize) -> DVector<f64> {
        segment(&self.mu[t], 0, self.state_dim)
    }

    pub fn action_mean(&self, t: usize) -> DVector<f64> {
        segment(&self.mu[t], self.state_dim, self.action_dim())
    }

    pub fn state_covariance(&self, t: usize) -> DMatrix<f64> {
        block(&self.sigma[t], 0, 0, self.state_dim, self.state_dim)
    }

    /// Largest absolute difference between the joint means of two distributions.
    pub fn max_mean_difference(&self, other: &Self) -> f64 {
        self.mu
            .iter()
            .zip(&other.mu)
            .map(|(a, b)| (a - b).amax())
            .fold(0.0, f64::max)
    }
}

/// One sweep of local approximations along a trajectory.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalModel {
    pub dynamics: Vec<DynamicsLinear>,
    pub costs: Vec<CostQuadratic>,
}

impl LocalModel {
    pub fn horizon(&self) -> usize {
        self.costs.len()
    }
}
