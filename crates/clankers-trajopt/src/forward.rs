//! Moment propagation of a linear-Gaussian controller through linear
//! dynamics.

use nalgebra::{DMatrix, DVector};

use crate::error::ApproximationError;
use crate::linalg::{block, segment, symmetrize};
use crate::model::{DynamicsModel, linearize_checked};
use crate::types::{
    CostQuadratic, DynamicsLinear, InitialState, LinearGaussianController, LinearGaussianStep,
    LocalModel, TrajectoryDistribution,
};

/// Joint `[x; a]` moments at one step from the state moments and the
/// controller step.
fn joint_moments(
    step: &LinearGaussianStep,
    x_mean: &DVector<f64>,
    x_cov: &DMatrix<f64>,
) -> (DVector<f64>, DMatrix<f64>) {
    let n = x_mean.len();
    let a = step.action_dim();
    let k_sxx = &step.gain * x_cov;

    let mut mu = DVector::zeros(n + a);
    mu.rows_mut(0, n).copy_from(x_mean);
    mu.rows_mut(n, a).copy_from(&step.mean_action(x_mean));

    let mut sigma = DMatrix::zeros(n + a, n + a);
    sigma.view_mut((0, 0), (n, n)).copy_from(x_cov);
    sigma.view_mut((n, 0), (a, n)).copy_from(&k_sxx);
    sigma.view_mut((0, n), (n, a)).copy_from(&k_sxx.transpose());
    sigma
        .view_mut((n, n), (a, a))
        .copy_from(&(&k_sxx * step.gain.transpose() + &step.covar));
    (mu, symmetrize(&sigma))
}

/// Next-state moments from joint moments at `t`.
fn propagate(
    dyn_t: &DynamicsLinear,
    mu: &DVector<f64>,
    sigma: &DMatrix<f64>,
) -> (DVector<f64>, DMatrix<f64>) {
    let mean = dyn_t.predict(mu);
    let cov = &dyn_t.fm * sigma * dyn_t.fm.transpose() + &dyn_t.covar;
    (mean, symmetrize(&cov))
}

/// Rolls `controller` forward through a fixed sequence of local dynamics.
///
/// Pure function of its inputs; the output has the controller's horizon.
pub struct ForwardPass;

impl ForwardPass {
    /// Needs one dynamics entry per step except the last.
    pub fn run(
        controller: &LinearGaussianController,
        dynamics: &[DynamicsLinear],
        x0: &InitialState,
    ) -> Result<TrajectoryDistribution, ApproximationError> {
        let needed = controller.horizon().saturating_sub(1);
        if dynamics.len() < needed {
            return Err(ApproximationError::DimensionMismatch {
                t: dynamics.len(),
                what: "dynamics sequence",
                expected: (needed, 1),
                got: (dynamics.len(), 1),
            });
        }
        Ok(Self::propagate_all(controller, dynamics, x0))
    }

    /// [`ForwardPass::run`] over a model built by
    /// [`crate::model::approximate`], which holds one entry per step.
    pub(crate) fn through(
        controller: &LinearGaussianController,
        model: &LocalModel,
        x0: &InitialState,
    ) -> TrajectoryDistribution {
        Self::propagate_all(controller, &model.dynamics, x0)
    }

    fn propagate_all(
        controller: &LinearGaussianController,
        dynamics: &[DynamicsLinear],
        x0: &InitialState,
    ) -> TrajectoryDistribution {
        let horizon = controller.horizon();
        let mut mu = Vec::with_capacity(horizon);
        let mut sigma = Vec::with_capacity(horizon);
        let mut x_mean = x0.mean.clone();
        let mut x_cov = x0.covariance.clone();
        for t in 0..horizon {
            let (mu_t, sigma_t) = joint_moments(controller.step(t), &x_mean, &x_cov);
            if t + 1 < horizon {
                (x_mean, x_cov) = propagate(&dynamics[t], &mu_t, &sigma_t);
            }
            mu.push(mu_t);
            sigma.push(sigma_t);
        }
        TrajectoryDistribution {
            controller: controller.clone(),
            mu,
            sigma,
            state_dim: x0.dim(),
        }
    }

    /// Rolls `controller` forward while linearizing `dynamics` step by step
    /// along the partially built trajectory.
    ///
    /// Used when no previous trajectory exists to linearize around.
    pub fn rollout(
        controller: &LinearGaussianController,
        dynamics: &dyn DynamicsModel,
        x0: &InitialState,
    ) -> Result<TrajectoryDistribution, ApproximationError> {
        let horizon = controller.horizon();
        let n = x0.dim();
        let a = controller.action_dim();
        let mut traj = TrajectoryDistribution {
            controller: controller.clone(),
            mu: vec![DVector::zeros(n + a); horizon],
            sigma: vec![DMatrix::zeros(n + a, n + a); horizon],
            state_dim: n,
        };
        let mut x_mean = x0.mean.clone();
        let mut x_cov = x0.covariance.clone();
        for t in 0..horizon {
            let (mu_t, sigma_t) = joint_moments(controller.step(t), &x_mean, &x_cov);
            traj.mu[t] = mu_t;
            traj.sigma[t] = sigma_t;
            if t + 1 < horizon {
                let dyn_t = linearize_checked(dynamics, &traj, t)?;
                (x_mean, x_cov) = propagate(&dyn_t, &traj.mu[t], &traj.sigma[t]);
            }
        }
        Ok(traj)
    }
}

/// Laplace estimate of the expected total cost of a trajectory under a
/// sequence of local cost expansions.
pub fn expected_cost(trajectory: &TrajectoryDistribution, costs: &[CostQuadratic]) -> f64 {
    costs
        .iter()
        .enumerate()
        .map(|(t, c)| c.expectation(trajectory.mean(t), trajectory.covariance(t)))
        .sum()
}

/// Per-step expected costs, for reporting.
pub fn expected_cost_per_step(
    trajectory: &TrajectoryDistribution,
    costs: &[CostQuadratic],
) -> Vec<f64> {
    costs
        .iter()
        .enumerate()
        .map(|(t, c)| c.expectation(trajectory.mean(t), trajectory.covariance(t)))
        .collect()
}

/// State marginals `(mean, covariance)` of a trajectory, one per step.
pub fn state_marginals(trajectory: &TrajectoryDistribution) -> Vec<(DVector<f64>, DMatrix<f64>)> {
    let n = trajectory.state_dim();
    (0..trajectory.horizon())
        .map(|t| {
            (
                segment(trajectory.mean(t), 0, n),
                block(trajectory.covariance(t), 0, 0, n, n),
            )
        })
        .collect()
}
