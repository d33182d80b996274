//! Pluggable local approximators for dynamics and cost.

use crate::error::{ApproximationError, ConfigError};
use crate::linalg::all_finite;
use crate::types::{CostQuadratic, DynamicsLinear, LocalModel, TrajectoryDistribution};

/// Produces a local linear-Gaussian transition model at a time step.
///
/// Implementations may only read the trajectory at indices `<= t`: the
/// initial rollout queries the model while later steps are still being
/// filled in.
pub trait DynamicsModel: Send + Sync {
    /// Linearize around the trajectory mean at `t`.
    fn linearize(
        &self,
        trajectory: &TrajectoryDistribution,
        t: usize,
    ) -> Result<DynamicsLinear, ApproximationError>;

    /// `(state, input)` dimensions when fixed up front, checked at setup.
    fn dims(&self) -> Option<(usize, usize)> {
        None
    }
}

/// Produces a local quadratic cost expansion at a time step.
pub trait CostModel: Send + Sync {
    /// Quadratize around the trajectory mean at `t`.
    fn quadratize(
        &self,
        trajectory: &TrajectoryDistribution,
        t: usize,
    ) -> Result<CostQuadratic, ApproximationError>;

    /// `(state, input)` dimensions when fixed up front, checked at setup.
    fn dims(&self) -> Option<(usize, usize)> {
        None
    }
}

/// Compares the models' declared dimensions with the configured ones.
pub(crate) fn check_model_dims(
    dynamics: &dyn DynamicsModel,
    cost: &dyn CostModel,
    state_dim: usize,
    input_dim: usize,
) -> Result<(), ConfigError> {
    for (model, dims) in [("dynamics", dynamics.dims()), ("cost", cost.dims())] {
        let Some((n, a)) = dims else { continue };
        if n != state_dim {
            return Err(ConfigError::DimensionMismatch {
                what: format!("{model} state dimension"),
                expected: state_dim,
                got: n,
            });
        }
        if a != input_dim {
            return Err(ConfigError::DimensionMismatch {
                what: format!("{model} input dimension"),
                expected: input_dim,
                got: a,
            });
        }
    }
    Ok(())
}

/// Linearizes dynamics at `t` and checks shape and finiteness.
pub fn linearize_checked(
    dynamics: &dyn DynamicsModel,
    trajectory: &TrajectoryDistribution,
    t: usize,
) -> Result<DynamicsLinear, ApproximationError> {
    let n = trajectory.state_dim();
    let a = trajectory.action_dim();
    let dyn_t = dynamics.linearize(trajectory, t)?;
    check_shape(t, "dynamics matrix", (n, n + a), dyn_t.fm.shape())?;
    check_shape(t, "dynamics offset", (n, 1), dyn_t.fv.shape())?;
    check_shape(t, "dynamics covariance", (n, n), dyn_t.covar.shape())?;
    if !all_finite(&dyn_t.fm) {
        return Err(ApproximationError::NonFinite {
            t,
            what: "dynamics matrix",
        });
    }
    if !dyn_t.fv.iter().all(|v| v.is_finite()) {
        return Err(ApproximationError::NonFinite {
            t,
            what: "dynamics offset",
        });
    }
    if !all_finite(&dyn_t.covar) {
        return Err(ApproximationError::NonFinite {
            t,
            what: "dynamics covariance",
        });
    }
    Ok(dyn_t)
}

/// Quadratizes the cost at `t`, checks it and projects its Hessian onto the
/// PSD cone around the trajectory mean.
pub fn quadratize_checked(
    cost: &dyn CostModel,
    trajectory: &TrajectoryDistribution,
    t: usize,
) -> Result<CostQuadratic, ApproximationError> {
    let dim = trajectory.state_dim() + trajectory.action_dim();
    let cost_t = cost.quadratize(trajectory, t)?;
    check_shape(t, "cost hessian", (dim, dim), cost_t.cm.shape())?;
    check_shape(t, "cost gradient", (dim, 1), cost_t.cv.shape())?;
    if !all_finite(&cost_t.cm) || !cost_t.cv.iter().all(|v| v.is_finite()) || !cost_t.cc.is_finite()
    {
        return Err(ApproximationError::NonFinite {
            t,
            what: "cost expansion",
        });
    }
    Ok(cost_t.regularized(trajectory.mean(t)))
}

/// Runs both models over the whole horizon.
pub fn approximate(
    dynamics: &dyn DynamicsModel,
    cost: &dyn CostModel,
    trajectory: &TrajectoryDistribution,
) -> Result<LocalModel, ApproximationError> {
    let horizon = trajectory.horizon();
    let mut dyn_seq = Vec::with_capacity(horizon);
    let mut cost_seq = Vec::with_capacity(horizon);
    for t in 0..horizon {
        dyn_seq.push(linearize_checked(dynamics, trajectory, t)?);
        cost_seq.push(quadratize_checked(cost, trajectory, t)?);
    }
    Ok(LocalModel {
        dynamics: dyn_seq,
        costs: cost_seq,
    })
}

/// Re-quadratizes the cost only, keeping the given dynamics.
pub fn requadratize(
    cost: &dyn CostModel,
    trajectory: &TrajectoryDistribution,
) -> Result<Vec<CostQuadratic>, ApproximationError> {
    (0..trajectory.horizon())
        .map(|t| quadratize_checked(cost, trajectory, t))
        .collect()
}

fn check_shape(
    t: usize,
    what: &'static str,
    expected: (usize, usize),
    got: (usize, usize),
) -> Result<(), ApproximationError> {
    if expected == got {
        Ok(())
    } else {
        Err(ApproximationError::DimensionMismatch {
            t,
            what,
            expected,
            got,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::ForwardPass;
    use crate::types::{InitialState, LinearGaussianController};
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};

    struct Fixed(DynamicsLinear);

    impl DynamicsModel for Fixed {
        fn linearize(
            &self,
            _trajectory: &TrajectoryDistribution,
            _t: usize,
        ) -> Result<DynamicsLinear, ApproximationError> {
            Ok(self.0.clone())
        }
    }

    struct FixedCost(CostQuadratic);

    impl CostModel for FixedCost {
        fn quadratize(
            &self,
            _trajectory: &TrajectoryDistribution,
            _t: usize,
        ) -> Result<CostQuadratic, ApproximationError> {
            Ok(self.0.clone())
        }
    }

    fn scalar_dynamics() -> DynamicsLinear {
        DynamicsLinear {
            fm: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            fv: DVector::zeros(1),
            covar: DMatrix::zeros(1, 1),
        }
    }

    fn trajectory() -> TrajectoryDistribution {
        let controller = LinearGaussianController::zero(3, 1, 1, 1.0);
        ForwardPass::run(
            &controller,
            &vec![scalar_dynamics(); 3],
            &InitialState::deterministic(DVector::from_element(1, 1.0)),
        )
        .unwrap()
    }

    #[test]
    fn wrong_dynamics_shape_is_reported() {
        let bad = Fixed(DynamicsLinear {
            fm: DMatrix::zeros(1, 3),
            ..scalar_dynamics()
        });
        assert_eq!(
            linearize_checked(&bad, &trajectory(), 1),
            Err(ApproximationError::DimensionMismatch {
                t: 1,
                what: "dynamics matrix",
                expected: (1, 2),
                got: (1, 3),
            })
        );
    }

    #[test]
    fn non_finite_dynamics_are_rejected() {
        let mut lin = scalar_dynamics();
        lin.fv[0] = f64::NAN;
        assert!(matches!(
            linearize_checked(&Fixed(lin), &trajectory(), 0),
            Err(ApproximationError::NonFinite {
                what: "dynamics offset",
                ..
            })
        ));
    }

    #[test]
    fn non_finite_cost_is_rejected() {
        let mut cost = CostQuadratic::zeros(2);
        cost.cc = f64::INFINITY;
        let err = approximate(&Fixed(scalar_dynamics()), &FixedCost(cost), &trajectory()).unwrap_err();
        assert!(matches!(err, ApproximationError::NonFinite { t: 0, .. }));
    }

    #[test]
    fn indefinite_cost_is_projected() {
        let cost = CostQuadratic {
            cm: DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -3.0]),
            cv: DVector::zeros(2),
            cc: 0.0,
        };
        let model = approximate(&Fixed(scalar_dynamics()), &FixedCost(cost), &trajectory()).unwrap();
        assert_eq!(model.horizon(), 3);
        for c in &model.costs {
            assert!(c.cm.clone().symmetric_eigen().eigenvalues.min() >= -1e-12);
            assert_relative_eq!(c.cm[(0, 0)], 1.0, epsilon = 1e-12);
        }
    }
}
