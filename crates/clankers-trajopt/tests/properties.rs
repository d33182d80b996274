//! Properties of the passes and the optimizer on random linear-quadratic
//! problems.

use approx::assert_relative_eq;
use clankers_test_utils::{deterministic_vec, random_spd, random_stable_dynamics, seeded_rng};
use clankers_trajopt::{
    BackwardPass, CancelFlag, CostQuadratic, DynamicsLinear, ForwardPass, InitialState,
    LinearDynamics, LinearGaussianController, LocalModel, Optimizer, QuadraticCost,
    RegularizationConfig, TrajOptConfig, TrajectoryDistribution, approximate, trajectory_kl,
};
use nalgebra::{DMatrix, DVector};

const STATE_DIM: usize = 3;
const ACTION_DIM: usize = 2;
const HORIZON: usize = 6;

struct Problem {
    config: TrajOptConfig,
    dynamics: LinearDynamics,
    cost: QuadraticCost,
    x0: InitialState,
}

fn random_problem(seed: u64) -> Problem {
    let mut rng = seeded_rng(seed);
    let (a, b) = random_stable_dynamics(STATE_DIM, ACTION_DIM, 0.1, &mut rng);
    let q = random_spd(STATE_DIM, 0.1, &mut rng);
    let r = random_spd(ACTION_DIM, 0.5, &mut rng);
    let mut config = TrajOptConfig::default();
    config.problem.horizon = HORIZON;
    config.problem.state_dim = STATE_DIM;
    config.problem.action_dim = ACTION_DIM;
    Problem {
        config,
        dynamics: LinearDynamics::new(a, b).unwrap(),
        cost: QuadraticCost::new(q, r).unwrap(),
        x0: InitialState::new(
            DVector::from_vec(deterministic_vec(STATE_DIM, seed)),
            DMatrix::identity(STATE_DIM, STATE_DIM) * 0.01,
        ),
    }
}

/// Zero controller, its rollout and the local model around it.
fn linearized(problem: &Problem) -> (LinearGaussianController, TrajectoryDistribution, LocalModel) {
    let prev = LinearGaussianController::zero(HORIZON, STATE_DIM, ACTION_DIM, 1.0);
    let traj = ForwardPass::rollout(&prev, &problem.dynamics, &problem.x0).unwrap();
    let model = approximate(&problem.dynamics, &problem.cost, &traj).unwrap();
    (prev, traj, model)
}

#[test]
fn optimizer_is_deterministic() {
    for seed in [1, 2, 3] {
        let problem = random_problem(seed);
        let optimizer = Optimizer::new(&problem.config, &problem.dynamics, &problem.cost).unwrap();
        let first = optimizer.run(&problem.x0, &CancelFlag::new()).unwrap();
        let second = optimizer.run(&problem.x0, &CancelFlag::new()).unwrap();
        assert_eq!(first.status, second.status);
        assert_eq!(first.iterations, second.iterations);
        assert_eq!(first.cost_history, second.cost_history);
        assert_eq!(first.trajectory, second.trajectory);
    }
}

#[test]
fn kl_is_non_negative_and_zero_for_identical_controllers() {
    for seed in [4, 5, 6] {
        let problem = random_problem(seed);
        let (prev, traj, model) = linearized(&problem);
        assert_relative_eq!(trajectory_kl(&traj, &prev), 0.0, epsilon = 1e-10);

        let reg = RegularizationConfig::default();
        for eta in [1e-2, 1.0, 1e2] {
            let controller = BackwardPass::new(&reg).run(&model, Some(&prev), eta).unwrap();
            let new = ForwardPass::run(&controller, &model.dynamics, &problem.x0).unwrap();
            assert!(trajectory_kl(&new, &prev) >= 0.0);
        }
    }
}

#[test]
fn kl_shrinks_as_eta_grows() {
    let etas = [1e-3, 1e-2, 1e-1, 1.0, 10.0, 100.0];
    for seed in [7, 8, 9] {
        let problem = random_problem(seed);
        let (prev, _, model) = linearized(&problem);
        let reg = RegularizationConfig::default();
        let kls: Vec<f64> = etas
            .iter()
            .map(|&eta| {
                let controller = BackwardPass::new(&reg).run(&model, Some(&prev), eta).unwrap();
                let traj = ForwardPass::run(&controller, &model.dynamics, &problem.x0).unwrap();
                trajectory_kl(&traj, &prev)
            })
            .collect();
        for pair in kls.windows(2) {
            assert!(
                pair[1] <= pair[0] * (1.0 + 1e-9) + 1e-12,
                "KL grew with eta: {kls:?}"
            );
        }
    }
}

#[test]
fn large_eta_keeps_previous_controller() {
    let problem = random_problem(10);
    let (prev, _, model) = linearized(&problem);
    let reg = RegularizationConfig::default();
    let controller = BackwardPass::new(&reg).run(&model, Some(&prev), 1e12).unwrap();
    for t in 0..HORIZON {
        assert_relative_eq!(controller.step(t).gain, prev.step(t).gain, epsilon = 1e-6);
        assert_relative_eq!(controller.step(t).bias, prev.step(t).bias, epsilon = 1e-6);
        assert_relative_eq!(controller.step(t).covar, prev.step(t).covar, epsilon = 1e-6);
    }
}

/// One-step model: `c(x, u) = ½ [x; u]ᵀ C [x; u] + cᵀ [x; u]`.
fn single_step(cm: DMatrix<f64>, cv: DVector<f64>) -> LocalModel {
    let dim = cm.nrows();
    LocalModel {
        dynamics: vec![DynamicsLinear {
            fm: DMatrix::zeros(1, dim),
            fv: DVector::zeros(1),
            covar: DMatrix::zeros(1, 1),
        }],
        costs: vec![CostQuadratic { cm, cv, cc: 0.0 }],
    }
}

#[test]
fn single_step_matches_closed_form() {
    // x ∈ R¹, u ∈ R¹: Quu = 2, Qux = 0.5, qu = -1.
    let cm = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 2.0]);
    let cv = DVector::from_vec(vec![0.3, -1.0]);
    let model = single_step(cm, cv);
    let reg = RegularizationConfig::default();
    let controller = BackwardPass::new(&reg).run(&model, None, 1.0).unwrap();
    let step = controller.step(0);
    assert_relative_eq!(step.gain[(0, 0)], -0.25, epsilon = 1e-12);
    assert_relative_eq!(step.bias[0], 0.5, epsilon = 1e-12);
    assert_relative_eq!(step.covar[(0, 0)], 0.5, epsilon = 1e-12);
}

#[test]
fn regularization_is_bounded() {
    let cm = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -100.0]);
    let model = single_step(cm, DVector::zeros(2));

    let mut reg = RegularizationConfig {
        initial_shift: 1e-6,
        shift_factor: 10.0,
        max_attempts: 3,
        ..RegularizationConfig::default()
    };
    let err = BackwardPass::new(&reg).run(&model, None, 1.0).unwrap_err();
    assert_eq!(err.t, 0);
    assert_eq!(err.attempts, 3);
    assert_relative_eq!(err.last_shift, 1e-4, max_relative = 1e-9);

    // Shifts up to 1e3 clear the -100 block.
    reg.max_attempts = 10;
    let controller = BackwardPass::new(&reg).run(&model, None, 1.0).unwrap();
    assert!(controller.step(0).covar[(0, 0)] > 0.0);
}
