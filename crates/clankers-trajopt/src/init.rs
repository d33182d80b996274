//! Initial controllers.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::backward::BackwardPass;
use crate::config::{InitConfig, InitKind, TrajOptConfig};
use crate::error::TrajOptError;
use crate::forward::ForwardPass;
use crate::model::{CostModel, DynamicsModel, approximate};
use crate::types::{InitialState, LinearGaussianController, LinearGaussianStep};

/// Proportional-derivative feedback around `x0`.
///
/// Assumes the state starts with `action_dim` positions followed by their
/// velocities; coordinates beyond those get zero gain.
pub fn pd_controller(
    horizon: usize,
    action_dim: usize,
    init: &InitConfig,
    x0: &DVector<f64>,
) -> LinearGaussianController {
    let n = x0.len();
    let mut gain = DMatrix::zeros(action_dim, n);
    for i in 0..action_dim {
        if i < n {
            gain[(i, i)] = -init.pos_gains;
        }
        if action_dim + i < n {
            gain[(i, action_dim + i)] = -init.pos_gains * init.vel_gains_mult;
        }
    }
    let bias = -(&gain * x0);
    let covar = DMatrix::identity(action_dim, action_dim) * init.init_var;
    let chol_covar = DMatrix::identity(action_dim, action_dim) * init.init_var.sqrt();
    let inv_covar = DMatrix::identity(action_dim, action_dim) * init.init_var.recip();
    let step = LinearGaussianStep {
        gain,
        bias,
        covar,
        chol_covar,
        inv_covar,
    };
    LinearGaussianController::from_steps(vec![step; horizon])
}

/// LQR controller on the models linearized along the zero-controller
/// rollout from `x0`.
pub fn lqr_controller(
    config: &TrajOptConfig,
    dynamics: &dyn DynamicsModel,
    cost: &dyn CostModel,
    x0: &InitialState,
) -> Result<LinearGaussianController, TrajOptError> {
    let p = &config.problem;
    let seed = LinearGaussianController::zero(
        p.horizon,
        p.state_dim,
        p.action_dim,
        config.initialization.init_var,
    );
    let rollout = ForwardPass::rollout(&seed, dynamics, x0)?;
    let model = approximate(dynamics, cost, &rollout)?;
    let controller = BackwardPass::new(&config.regularization).run(&model, None, 1.0)?;
    debug!(horizon = p.horizon, "Built LQR initial controller");
    Ok(controller)
}

/// Builds the configured initial controller for the control input.
pub fn initial_controller(
    config: &TrajOptConfig,
    dynamics: &dyn DynamicsModel,
    cost: &dyn CostModel,
    x0: &InitialState,
) -> Result<LinearGaussianController, TrajOptError> {
    let p = &config.problem;
    let init = &config.initialization;
    match init.kind {
        InitKind::Zero => Ok(LinearGaussianController::zero(
            p.horizon,
            p.state_dim,
            p.action_dim,
            init.init_var,
        )),
        InitKind::ProportionalDerivative => {
            Ok(pd_controller(p.horizon, p.action_dim, init, &x0.mean))
        }
        InitKind::Lqr => lqr_controller(config, dynamics, cost, x0),
    }
}
