//! Closed-form KL divergence between linear-Gaussian trajectory
//! distributions.

use nalgebra::{DMatrix, DVector};

use crate::types::{LinearGaussianController, LinearGaussianStep, TrajectoryDistribution};

fn log_det_from_factor(chol: &DMatrix<f64>) -> f64 {
    2.0 * chol.diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// `E_{x ~ N(mean, cov)} KL(new(.|x) || prev(.|x))` for one step.
pub fn step_kl(
    new: &LinearGaussianStep,
    prev: &LinearGaussianStep,
    state_mean: &DVector<f64>,
    state_cov: &DMatrix<f64>,
) -> f64 {
    let dim = new.action_dim() as f64;
    let prec = &prev.inv_covar;

    let covariance_term = prec.component_mul(&new.covar).sum() - dim
        + log_det_from_factor(&prev.chol_covar)
        - log_det_from_factor(&new.chol_covar);

    let d_gain = &new.gain - &prev.gain;
    let d_mean = &d_gain * state_mean + (&new.bias - &prev.bias);
    let mean_term = d_mean.dot(&(prec * &d_mean))
        + (d_gain.transpose() * prec * &d_gain)
            .component_mul(state_cov)
            .sum();

    (0.5 * (covariance_term + mean_term)).max(0.0)
}

/// Per-step divergences of the controller that generated `new` from `prev`,
/// weighted by the state marginals of `new`.
pub fn kl_per_step(new: &TrajectoryDistribution, prev: &LinearGaussianController) -> Vec<f64> {
    controller_kl_per_step(new.controller(), prev, new)
}

/// Per-step divergences between two controllers over the state marginals of
/// `marginals`. The controllers may act on a subset of the actions in
/// `marginals` (one role of a joint trajectory).
pub fn controller_kl_per_step(
    new: &LinearGaussianController,
    prev: &LinearGaussianController,
    marginals: &TrajectoryDistribution,
) -> Vec<f64> {
    new.steps()
        .iter()
        .zip(prev.steps())
        .enumerate()
        .map(|(t, (n, p))| {
            step_kl(
                n,
                p,
                &marginals.state_mean(t),
                &marginals.state_covariance(t),
            )
        })
        .collect()
}

/// Total divergence summed over time.
pub fn trajectory_kl(new: &TrajectoryDistribution, prev: &LinearGaussianController) -> f64 {
    kl_per_step(new, prev).iter().sum()
}
