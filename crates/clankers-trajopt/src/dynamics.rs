//! Dynamics model strategies: analytic, finite-difference and fitted.

use nalgebra::{DMatrix, DVector};

use crate::error::{ApproximationError, ConfigError};
use crate::linalg::{block, definite_cholesky, project_psd, segment, symmetrize};
use crate::model::DynamicsModel;
use crate::types::{DynamicsLinear, TrajectoryDistribution};

// ---------------------------------------------------------------------------
// LinearDynamics
// ---------------------------------------------------------------------------

/// Time-invariant linear dynamics `x' = A x + B u + E v + c + w`,
/// `w ~ N(0, noise)`. The disturbance input `E` is only present in robust
/// mode.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearDynamics {
    a: DMatrix<f64>,
    b: DMatrix<f64>,
    e: Option<DMatrix<f64>>,
    offset: DVector<f64>,
    noise: DMatrix<f64>,
}

impl LinearDynamics {
    pub fn new(a: DMatrix<f64>, b: DMatrix<f64>) -> Result<Self, ConfigError> {
        let n = a.nrows();
        if !a.is_square() {
            return Err(ConfigError::DimensionMismatch {
                what: "A columns".into(),
                expected: n,
                got: a.ncols(),
            });
        }
        if b.nrows() != n {
            return Err(ConfigError::DimensionMismatch {
                what: "B rows".into(),
                expected: n,
                got: b.nrows(),
            });
        }
        Ok(Self {
            a,
            b,
            e: None,
            offset: DVector::zeros(n),
            noise: DMatrix::zeros(n, n),
        })
    }

    pub fn with_offset(mut self, offset: DVector<f64>) -> Result<Self, ConfigError> {
        self.check_rows("offset", offset.len())?;
        self.offset = offset;
        Ok(self)
    }

    pub fn with_noise(mut self, noise: DMatrix<f64>) -> Result<Self, ConfigError> {
        self.check_rows("noise covariance", noise.nrows())?;
        self.noise = symmetrize(&noise);
        Ok(self)
    }

    /// Adds a disturbance input matrix `E` (n × d).
    pub fn with_disturbance(mut self, e: DMatrix<f64>) -> Result<Self, ConfigError> {
        self.check_rows("disturbance matrix", e.nrows())?;
        self.e = Some(e);
        Ok(self)
    }

    pub fn state_dim(&self) -> usize {
        self.a.nrows()
    }

    pub fn action_dim(&self) -> usize {
        self.b.ncols()
    }

    pub fn disturbance_dim(&self) -> usize {
        self.e.as_ref().map_or(0, DMatrix::ncols)
    }

    /// `[A B (E)]`.
    pub fn transition_matrix(&self) -> DMatrix<f64> {
        let n = self.state_dim();
        let m = self.action_dim();
        let d = self.disturbance_dim();
        let mut fm = DMatrix::zeros(n, n + m + d);
        fm.view_mut((0, 0), (n, n)).copy_from(&self.a);
        fm.view_mut((0, n), (n, m)).copy_from(&self.b);
        if let Some(e) = &self.e {
            fm.view_mut((0, n + m), (n, d)).copy_from(e);
        }
        fm
    }

    fn check_rows(&self, what: &str, rows: usize) -> Result<(), ConfigError> {
        if rows == self.state_dim() {
            Ok(())
        } else {
            Err(ConfigError::DimensionMismatch {
                what: what.into(),
                expected: self.state_dim(),
                got: rows,
            })
        }
    }
}

impl DynamicsModel for LinearDynamics {
    fn linearize(
        &self,
        _trajectory: &TrajectoryDistribution,
        _t: usize,
    ) -> Result<DynamicsLinear, ApproximationError> {
        Ok(DynamicsLinear {
            fm: self.transition_matrix(),
            fv: self.offset.clone(),
            covar: self.noise.clone(),
        })
    }
    fn dims(&self) -> Option<(usize, usize)> {
        Some((self.state_dim(), self.action_dim() + self.disturbance_dim()))
    }
}

// ---------------------------------------------------------------------------
// FiniteDifferenceDynamics
// ---------------------------------------------------------------------------

/// Central-difference linearization of a deterministic step function
/// `x' = f(x, a)` around the trajectory mean.
pub struct FiniteDifferenceDynamics<F> {
    step: F,
    state_dim: usize,
    epsilon: f64,
    noise: DMatrix<f64>,
}

impl<F> FiniteDifferenceDynamics<F>
where
    F: Fn(&DVector<f64>, &DVector<f64>) -> DVector<f64> + Send + Sync,
{
    pub fn new(step: F, state_dim: usize) -> Self {
        Self {
            step,
            state_dim,
            epsilon: 1e-6,
            noise: DMatrix::zeros(state_dim, state_dim),
        }
    }

    #[must_use]
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    #[must_use]
    pub fn with_noise(mut self, noise: DMatrix<f64>) -> Self {
        self.noise = noise;
        self
    }

    fn eval(&self, z: &DVector<f64>, t: usize) -> Result<DVector<f64>, ApproximationError> {
        let n = self.state_dim;
        let x = segment(z, 0, n);
        let a = segment(z, n, z.len() - n);
        let next = (self.step)(&x, &a);
        if next.len() != n {
            return Err(ApproximationError::DimensionMismatch {
                t,
                what: "step function output",
                expected: (n, 1),
                got: (next.len(), 1),
            });
        }
        if !next.iter().all(|v| v.is_finite()) {
            return Err(ApproximationError::NonFinite {
                t,
                what: "step function output",
            });
        }
        Ok(next)
    }
}

impl<F> DynamicsModel for FiniteDifferenceDynamics<F>
where
    F: Fn(&DVector<f64>, &DVector<f64>) -> DVector<f64> + Send + Sync,
{
    fn linearize(
        &self,
        trajectory: &TrajectoryDistribution,
        t: usize,
    ) -> Result<DynamicsLinear, ApproximationError> {
        let z = trajectory.mean(t);
        let dim = z.len();
        let h = self.epsilon;
        let mut fm = DMatrix::zeros(self.state_dim, dim);
        for j in 0..dim {
            let mut plus = z.clone();
            let mut minus = z.clone();
            plus[j] += h;
            minus[j] -= h;
            let column = (self.eval(&plus, t)? - self.eval(&minus, t)?) / (2.0 * h);
            fm.set_column(j, &column);
        }
        let fv = self.eval(z, t)? - &fm * z;
        Ok(DynamicsLinear {
            fm,
            fv,
            covar: self.noise.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// FittedDynamics
// ---------------------------------------------------------------------------

/// One observed transition.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub state: DVector<f64>,
    pub action: DVector<f64>,
    pub next_state: DVector<f64>,
}

/// Normal-inverse-Wishart prior on the joint `[x; a; x']` Gaussian.
#[derive(Clone, Debug, PartialEq)]
pub struct NiwPrior {
    /// Prior mean; zero when `None`.
    pub mu0: Option<DVector<f64>>,
    /// Prior scatter `Φ = phi · I`.
    pub phi: f64,
    /// Strength of the prior mean.
    pub m: f64,
    /// Strength of the prior scatter.
    pub n0: f64,
}

impl Default for NiwPrior {
    fn default() -> Self {
        Self {
            mu0: None,
            phi: 1e-6,
            m: 0.0,
            n0: 0.0,
        }
    }
}

/// Per-step linear-Gaussian dynamics fitted to sampled transitions.
///
/// Step `t` uses the transitions observed from `t` to `t + 1`. Queries past
/// the last fitted step reuse the last model; the backward and forward
/// passes never read dynamics at the final step.
#[derive(Clone, Debug)]
pub struct FittedDynamics {
    models: Vec<DynamicsLinear>,
}

impl FittedDynamics {
    /// Fits one model per entry of `samples`.
    pub fn fit(
        samples: &[Vec<Transition>],
        prior: &NiwPrior,
        sig_reg: f64,
    ) -> Result<Self, ApproximationError> {
        let models = samples
            .iter()
            .enumerate()
            .map(|(t, batch)| fit_step(t, batch, prior, sig_reg))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { models })
    }

    pub fn models(&self) -> &[DynamicsLinear] {
        &self.models
    }
}

fn fit_step(
    t: usize,
    batch: &[Transition],
    prior: &NiwPrior,
    sig_reg: f64,
) -> Result<DynamicsLinear, ApproximationError> {
    if batch.len() < 2 {
        return Err(ApproximationError::InsufficientSamples {
            t,
            required: 2,
            got: batch.len(),
        });
    }
    let n = batch[0].state.len();
    let a = batch[0].action.len();
    let xu = n + a;
    let dim = xu + n;
    let count = batch.len() as f64;

    for s in batch {
        check_len(t, "transition state", n, s.state.len())?;
        check_len(t, "transition action", a, s.action.len())?;
        check_len(t, "transition next state", n, s.next_state.len())?;
    }
    if let Some(mu0) = &prior.mu0 {
        check_len(t, "prior mean", dim, mu0.len())?;
    }

    let points: Vec<DVector<f64>> = batch
        .iter()
        .map(|s| {
            let mut p = DVector::zeros(dim);
            p.rows_mut(0, n).copy_from(&s.state);
            p.rows_mut(n, a).copy_from(&s.action);
            p.rows_mut(xu, n).copy_from(&s.next_state);
            p
        })
        .collect();

    let mean = points.iter().fold(DVector::zeros(dim), |acc, p| acc + p) / count;
    let empirical = points
        .iter()
        .map(|p| {
            let d = p - &mean;
            &d * d.transpose()
        })
        .fold(DMatrix::zeros(dim, dim), |acc, outer| acc + outer)
        / count;

    let mu0 = prior.mu0.clone().unwrap_or_else(|| DVector::zeros(dim));
    let dm = &mean - &mu0;
    let shrink = if prior.m > 0.0 {
        count * prior.m / (count + prior.m)
    } else {
        0.0
    };
    let mut sigma = (empirical * count
        + DMatrix::identity(dim, dim) * prior.phi
        + &dm * dm.transpose() * shrink)
        / (count + prior.n0);
    sigma = symmetrize(&sigma);
    for i in 0..xu {
        sigma[(i, i)] += sig_reg;
    }

    let s_xx = block(&sigma, 0, 0, xu, xu);
    let s_xy = block(&sigma, 0, xu, xu, n);
    let Some(chol) = definite_cholesky(&s_xx) else {
        return Err(ApproximationError::Undefined {
            t,
            reason: "state-action sample covariance is singular".into(),
        });
    };
    let fm = chol.solve(&s_xy).transpose();
    let fv = segment(&mean, xu, n) - &fm * segment(&mean, 0, xu);
    let covar = block(&sigma, xu, xu, n, n) - &fm * &s_xx * fm.transpose();
    Ok(DynamicsLinear {
        fm,
        fv,
        covar: project_psd(&covar, 0.0),
    })
}

fn check_len(
    t: usize,
    what: &'static str,
    expected: usize,
    got: usize,
) -> Result<(), ApproximationError> {
    if expected == got {
        Ok(())
    } else {
        Err(ApproximationError::DimensionMismatch {
            t,
            what,
            expected: (expected, 1),
            got: (got, 1),
        })
    }
}

impl DynamicsModel for FittedDynamics {
    fn linearize(
        &self,
        _trajectory: &TrajectoryDistribution,
        t: usize,
    ) -> Result<DynamicsLinear, ApproximationError> {
        self.models
            .get(t)
            .or_else(|| self.models.last())
            .cloned()
            .ok_or(ApproximationError::Undefined {
                t,
                reason: "no fitted dynamics".into(),
            })
    }
    fn dims(&self) -> Option<(usize, usize)> {
        self.models.first().map(|m| (m.state_dim(), m.action_dim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::ForwardPass;
    use crate::types::{InitialState, LinearGaussianController};
    use approx::assert_relative_eq;
    use clankers_test_utils::seeded_rng;
    use rand_distr::{Distribution, Normal};

    fn nominal(n: usize, m: usize) -> TrajectoryDistribution {
        let controller = LinearGaussianController::zero(2, n, m, 1.0);
        let dynamics = LinearDynamics::new(DMatrix::identity(n, n), DMatrix::zeros(n, m)).unwrap();
        let x0 = InitialState::deterministic(DVector::from_element(n, 0.5));
        ForwardPass::rollout(&controller, &dynamics, &x0).unwrap()
    }

    #[test]
    fn linear_dynamics_stacks_inputs() {
        let dynamics = LinearDynamics::new(DMatrix::identity(2, 2), DMatrix::from_element(2, 1, 0.5))
            .unwrap()
            .with_disturbance(DMatrix::from_element(2, 1, 0.1))
            .unwrap();
        let fm = dynamics.transition_matrix();
        assert_eq!(fm.shape(), (2, 4));
        assert_relative_eq!(fm[(1, 2)], 0.5);
        assert_relative_eq!(fm[(0, 3)], 0.1);
    }

    #[test]
    fn linear_dynamics_rejects_bad_shapes() {
        assert!(LinearDynamics::new(DMatrix::identity(2, 2), DMatrix::zeros(3, 1)).is_err());
        let dynamics = LinearDynamics::new(DMatrix::identity(2, 2), DMatrix::zeros(2, 1)).unwrap();
        assert!(dynamics.with_offset(DVector::zeros(3)).is_err());
    }

    #[test]
    fn finite_difference_recovers_linear_system() {
        let fd = FiniteDifferenceDynamics::new(
            |x: &DVector<f64>, u: &DVector<f64>| {
                DVector::from_vec(vec![x[0] + 0.1 * x[1], x[1] + 0.1 * u[0] + 0.3])
            },
            2,
        );
        let lin = fd.linearize(&nominal(2, 1), 0).unwrap();
        let expected = DMatrix::from_row_slice(2, 3, &[1.0, 0.1, 0.0, 0.0, 1.0, 0.1]);
        assert_relative_eq!(lin.fm, expected, epsilon = 1e-6);
        assert_relative_eq!(lin.fv[1], 0.3, epsilon = 1e-6);
    }

    #[test]
    fn finite_difference_linearizes_around_mean() {
        let fd = FiniteDifferenceDynamics::new(
            |x: &DVector<f64>, u: &DVector<f64>| DVector::from_vec(vec![x[0] * x[0] + u[0]]),
            1,
        );
        let lin = fd.linearize(&nominal(1, 1), 0).unwrap();
        // d/dx x^2 at x = 0.5
        assert_relative_eq!(lin.fm[(0, 0)], 1.0, epsilon = 1e-6);
        // first-order model is exact at the mean: 0.25 = 1.0 * 0.5 + fv
        assert_relative_eq!(lin.fv[0], -0.25, epsilon = 1e-6);
    }

    #[test]
    fn finite_difference_reports_non_finite() {
        let fd = FiniteDifferenceDynamics::new(
            |_: &DVector<f64>, _: &DVector<f64>| DVector::from_element(1, f64::NAN),
            1,
        );
        assert!(matches!(
            fd.linearize(&nominal(1, 1), 0),
            Err(ApproximationError::NonFinite { .. })
        ));
    }

    #[test]
    fn fitted_dynamics_recovers_system_from_samples() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.1, -0.2, 0.9]);
        let b = DMatrix::from_row_slice(2, 1, &[0.0, 0.5]);
        let c = DVector::from_vec(vec![0.05, -0.1]);
        let unit = Normal::new(0.0, 1.0).unwrap();
        let noise = Normal::new(0.0, 1e-3).unwrap();
        let mut rng = seeded_rng(7);

        let batch: Vec<Transition> = (0..400)
            .map(|_| {
                let state = DVector::from_fn(2, |_, _| unit.sample(&mut rng));
                let action = DVector::from_fn(1, |_, _| unit.sample(&mut rng));
                let w = DVector::from_fn(2, |_, _| noise.sample(&mut rng));
                let next_state = &a * &state + &b * &action + &c + w;
                Transition {
                    state,
                    action,
                    next_state,
                }
            })
            .collect();

        let fitted = FittedDynamics::fit(&[batch], &NiwPrior::default(), 1e-8).unwrap();
        let model = &fitted.models()[0];
        assert_relative_eq!(block(&model.fm, 0, 0, 2, 2), a, epsilon = 1e-2);
        assert_relative_eq!(block(&model.fm, 0, 2, 2, 1), b, epsilon = 1e-2);
        assert_relative_eq!(model.fv, c, epsilon = 1e-2);
        assert!(model.covar[(0, 0)] < 1e-4);
    }

    #[test]
    fn fitted_dynamics_needs_samples() {
        let err = FittedDynamics::fit(&[Vec::new()], &NiwPrior::default(), 0.0).unwrap_err();
        assert!(matches!(err, ApproximationError::InsufficientSamples { got: 0, .. }));
    }

    fn line_sample(x: f64) -> Transition {
        Transition {
            state: DVector::from_vec(vec![x, -x]),
            action: DVector::from_element(1, 0.5 * x),
            next_state: DVector::from_vec(vec![2.0 * x, x]),
        }
    }

    #[test]
    fn fitted_dynamics_rejects_ragged_batch() {
        let mut batch = vec![line_sample(1.0), line_sample(-1.0), line_sample(0.5)];
        batch[2].state = DVector::from_element(1, 0.5);
        let err = FittedDynamics::fit(&[batch], &NiwPrior::default(), 1e-6).unwrap_err();
        assert_eq!(
            err,
            ApproximationError::DimensionMismatch {
                t: 0,
                what: "transition state",
                expected: (2, 1),
                got: (1, 1),
            }
        );
    }

    #[test]
    fn fitted_dynamics_rejects_ragged_next_state() {
        let mut batch = vec![line_sample(1.0), line_sample(-1.0)];
        batch[1].next_state = DVector::zeros(3);
        let err = FittedDynamics::fit(&[batch], &NiwPrior::default(), 1e-6).unwrap_err();
        assert!(matches!(
            err,
            ApproximationError::DimensionMismatch {
                what: "transition next state",
                ..
            }
        ));
    }

    #[test]
    fn fitted_dynamics_rejects_prior_mean_of_wrong_length() {
        let batch = vec![line_sample(1.0), line_sample(-1.0), line_sample(0.5)];
        let prior = NiwPrior {
            mu0: Some(DVector::zeros(3)),
            ..NiwPrior::default()
        };
        let err = FittedDynamics::fit(&[batch], &prior, 1e-6).unwrap_err();
        assert_eq!(
            err,
            ApproximationError::DimensionMismatch {
                t: 0,
                what: "prior mean",
                expected: (5, 1),
                got: (3, 1),
            }
        );
    }

    #[test]
    fn fitted_dynamics_reuses_last_model() {
        let sample = |x: f64| Transition {
            state: DVector::from_element(1, x),
            action: DVector::from_element(1, -x),
            next_state: DVector::from_element(1, 2.0 * x),
        };
        let fitted =
            FittedDynamics::fit(&[vec![sample(1.0), sample(-1.0), sample(0.5)]], &NiwPrior::default(), 1e-6)
                .unwrap();
        let traj = nominal(1, 1);
        assert_eq!(fitted.linearize(&traj, 5).unwrap(), fitted.models()[0]);
    }
}
