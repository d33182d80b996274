//! Outer-iteration driver for a single initial condition.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::backward::BackwardPass;
use crate::config::TrajOptConfig;
use crate::divergence::kl_per_step;
use crate::error::{ApproximationError, ConfigError, SingularControlCostError, TrajOptError};
use crate::forward::{ForwardPass, expected_cost};
use crate::init::initial_controller;
use crate::model::{CostModel, DynamicsModel, approximate, check_model_dims, requadratize};
use crate::step::{Probe, StepOutcome, StepSizeController, TrustRegionProblem};
use crate::types::{InitialState, LinearGaussianController, LocalModel, TrajectoryDistribution};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared cancellation signal, polled between outer iterations.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Terminal status of an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Relative cost change stayed below tolerance for the configured window.
    Converged,
    MaxIterationsReached,
    /// Too many consecutive rounds without an acceptable step.
    NoFeasibleStep,
    /// Too many consecutive rounds aborted by the local approximators.
    ApproximationFailed,
    Cancelled,
}

/// Result of [`Optimizer::run`]. The trajectory is always the best one
/// accepted so far.
#[derive(Debug, Clone)]
pub struct OptimizationReport {
    pub status: ConvergenceStatus,
    pub trajectory: TrajectoryDistribution,
    /// Outer iterations started.
    pub iterations: usize,
    /// Dual variable of the last accepted step (initial η if none); the
    /// mean over steps under a per-step constraint.
    pub eta: f64,
    /// Per-step dual variables under a per-step constraint.
    pub eta_per_step: Option<Vec<f64>>,
    pub step_mult: f64,
    /// Expected cost of the initial trajectory followed by that of every
    /// accepted step.
    pub cost_history: Vec<f64>,
    /// Total rounds that produced no step.
    pub stalled_rounds: usize,
    /// Iterations aborted by the approximators, with the error raised.
    pub approximation_failures: Vec<(usize, ApproximationError)>,
}

impl OptimizationReport {
    /// Expected cost of the returned trajectory.
    pub fn final_cost(&self) -> f64 {
        self.cost_history.last().copied().unwrap_or(f64::NAN)
    }
}

// ---------------------------------------------------------------------------
// Trust-region subproblem
// ---------------------------------------------------------------------------

/// One round of the standard (single-player) subproblem.
struct StandardProblem<'p> {
    model: &'p LocalModel,
    prev: &'p LinearGaussianController,
    x0: &'p InitialState,
    cost: &'p dyn CostModel,
    backward: BackwardPass<'p>,
    reference: f64,
}

impl TrustRegionProblem for StandardProblem<'_> {
    fn reference_objective(&self) -> f64 {
        self.reference
    }

    fn probe(&self, eta: f64) -> Result<Probe, SingularControlCostError> {
        let controller = self.backward.run(self.model, Some(self.prev), eta)?;
        Ok(self.evaluate(eta, controller))
    }

    fn probe_per_step(&self, etas: &[f64]) -> Result<Probe, SingularControlCostError> {
        let controller = self.backward.run_per_step(self.model, self.prev, etas)?;
        let eta = etas.iter().sum::<f64>() / etas.len().max(1) as f64;
        Ok(self.evaluate(eta, controller))
    }

    fn actual_objective(&self, probe: &Probe) -> Result<f64, ApproximationError> {
        let costs = requadratize(self.cost, &probe.trajectory)?;
        Ok(expected_cost(&probe.trajectory, &costs))
    }
}

impl StandardProblem<'_> {
    fn evaluate(&self, eta: f64, controller: LinearGaussianController) -> Probe {
        let trajectory = ForwardPass::through(&controller, self.model, self.x0);
        let kl_per_step = kl_per_step(&trajectory, self.prev);
        let predicted = expected_cost(&trajectory, &self.model.costs);
        Probe {
            eta,
            trajectory,
            controller,
            kl: kl_per_step.iter().sum(),
            kl_per_step,
            predicted,
        }
    }
}

// ---------------------------------------------------------------------------
// Step multiplier and convergence bookkeeping
// ---------------------------------------------------------------------------

/// Rescales the step multiplier from the ratio of predicted to realized
/// improvement of the last accepted step.
pub(crate) fn adapt_step_mult(
    config: &TrajOptConfig,
    step_mult: f64,
    previous: f64,
    predicted: f64,
    actual: f64,
) -> f64 {
    let predicted_gain = previous - predicted;
    let actual_gain = previous - actual;
    let ratio = predicted_gain / (2.0 * (predicted_gain - actual_gain).max(1e-4));
    let tr = &config.trust_region;
    (step_mult * ratio.clamp(0.1, 5.0)).clamp(tr.min_step_mult, tr.max_step_mult)
}

/// Tracks consecutive small relative changes of the expected cost.
#[derive(Debug, Default)]
pub(crate) struct ConvergenceWindow {
    quiet: usize,
}

impl ConvergenceWindow {
    /// Records an accepted step; true once `window` consecutive steps
    /// changed the cost by less than the relative tolerance.
    pub(crate) fn record(&mut self, config: &TrajOptConfig, old: f64, new: f64) -> bool {
        let c = &config.convergence;
        if (new - old).abs() <= c.cost_tolerance * old.abs().max(f64::EPSILON) {
            self.quiet += 1;
        } else {
            self.quiet = 0;
        }
        self.quiet >= c.window
    }
}

// ---------------------------------------------------------------------------
// Optimizer
// ---------------------------------------------------------------------------

/// KL-constrained iterative LQG optimizer for one initial condition.
pub struct Optimizer<'a> {
    config: &'a TrajOptConfig,
    dynamics: &'a dyn DynamicsModel,
    cost: &'a dyn CostModel,
}

impl<'a> Optimizer<'a> {
    /// Validates the configuration and binds the models.
    pub fn new(
        config: &'a TrajOptConfig,
        dynamics: &'a dyn DynamicsModel,
        cost: &'a dyn CostModel,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        check_model_dims(dynamics, cost, config.problem.state_dim, config.problem.action_dim)?;
        Ok(Self {
            config,
            dynamics,
            cost,
        })
    }

    pub const fn config(&self) -> &TrajOptConfig {
        self.config
    }

    /// Rolls the configured initial controller out from `x0`.
    pub fn initial_trajectory(
        &self,
        x0: &InitialState,
    ) -> Result<TrajectoryDistribution, TrajOptError> {
        x0.validate(self.config.problem.state_dim)?;
        let controller = initial_controller(self.config, self.dynamics, self.cost, x0)?;
        Ok(ForwardPass::rollout(&controller, self.dynamics, x0)?)
    }

    /// Runs outer iterations from `x0` until convergence, a budget or
    /// cancellation.
    #[allow(clippy::too_many_lines)]
    pub fn run(
        &self,
        x0: &InitialState,
        cancel: &CancelFlag,
    ) -> Result<OptimizationReport, TrajOptError> {
        let config = self.config;
        let mut trajectory = self.initial_trajectory(x0)?;
        let initial_cost = expected_cost(&trajectory, &requadratize(self.cost, &trajectory)?);
        info!(cost = initial_cost, horizon = trajectory.horizon(), "Initial trajectory");

        let search = StepSizeController::new(&config.step_size, &config.regularization);
        let mut report = OptimizationReport {
            status: ConvergenceStatus::MaxIterationsReached,
            trajectory: trajectory.clone(),
            iterations: 0,
            eta: config.step_size.initial_eta,
            eta_per_step: config
                .trust_region
                .per_step
                .then(|| vec![config.step_size.initial_eta; trajectory.horizon()]),
            step_mult: config.trust_region.initial_step_mult,
            cost_history: vec![initial_cost],
            stalled_rounds: 0,
            approximation_failures: Vec::new(),
        };
        let mut window = ConvergenceWindow::default();
        let mut consecutive_stalls = 0;
        let mut consecutive_failures = 0;
        // (reference, predicted) of the last accepted step, awaiting the
        // objective of its trajectory under the next linearization.
        let mut pending: Option<(f64, f64)> = None;

        for iteration in 0..config.convergence.max_iterations {
            if cancel.is_cancelled() {
                info!(iteration, "Optimization cancelled");
                report.status = ConvergenceStatus::Cancelled;
                break;
            }
            report.iterations = iteration + 1;

            let round = approximate(self.dynamics, self.cost, &trajectory).map(|model| {
                // Previous controller re-forwarded under the new linearization.
                let reference_traj = ForwardPass::through(trajectory.controller(), &model, x0);
                let reference = expected_cost(&reference_traj, &model.costs);
                (model, reference)
            });
            let (model, reference) = match round {
                Ok(round) => round,
                Err(err) => {
                    warn!(iteration, error = %err, "Local approximation failed, iteration aborted");
                    report.approximation_failures.push((iteration, err));
                    consecutive_failures += 1;
                    if consecutive_failures >= config.convergence.max_approximation_failures {
                        report.status = ConvergenceStatus::ApproximationFailed;
                        break;
                    }
                    continue;
                }
            };

            if let Some((previous, predicted)) = pending.take() {
                if config.trust_region.adapt_step {
                    let adapted =
                        adapt_step_mult(config, report.step_mult, previous, predicted, reference);
                    debug!(from = report.step_mult, to = adapted, "Adapted step multiplier");
                    report.step_mult = adapted;
                }
            }

            let problem = StandardProblem {
                model: &model,
                prev: trajectory.controller(),
                x0,
                cost: self.cost,
                backward: BackwardPass::new(&config.regularization),
                reference,
            };
            let (searched, kl_target) = match &report.eta_per_step {
                Some(etas) => {
                    let kl_step = config.kl_step_target(report.step_mult);
                    (search.search_per_step(&problem, etas, kl_step), kl_step)
                }
                None => {
                    let kl_target = config.kl_target(report.step_mult);
                    (search.search(&problem, report.eta, kl_target), kl_target)
                }
            };
            let outcome = match searched {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(iteration, error = %err, "Cost re-query failed, iteration aborted");
                    report.approximation_failures.push((iteration, err));
                    consecutive_failures += 1;
                    if consecutive_failures >= config.convergence.max_approximation_failures {
                        report.status = ConvergenceStatus::ApproximationFailed;
                        break;
                    }
                    continue;
                }
            };
            consecutive_failures = 0;

            match outcome {
                StepOutcome::Accepted(step) => {
                    consecutive_stalls = 0;
                    let old_cost = report.final_cost();
                    info!(
                        iteration,
                        cost = step.actual,
                        kl = step.kl,
                        kl_target,
                        eta = step.eta,
                        probes = step.probes,
                        "Accepted step"
                    );
                    pending = Some((step.reference, step.predicted));
                    report.eta = step.eta;
                    if step.eta_per_step.is_some() {
                        report.eta_per_step = step.eta_per_step;
                    }
                    report.cost_history.push(step.actual);
                    trajectory = step.trajectory;
                    report.trajectory = trajectory.clone();
                    if window.record(config, old_cost, step.actual) {
                        report.status = ConvergenceStatus::Converged;
                        break;
                    }
                }
                StepOutcome::Rejected(reason) => {
                    consecutive_stalls += 1;
                    report.stalled_rounds += 1;
                    report.step_mult = (report.step_mult * config.convergence.stall_shrink)
                        .max(config.trust_region.min_step_mult);
                    warn!(iteration, ?reason, step_mult = report.step_mult, "No feasible step");
                    if consecutive_stalls >= config.convergence.max_stalled {
                        report.status = ConvergenceStatus::NoFeasibleStep;
                        break;
                    }
                }
            }
        }

        info!(
            status = ?report.status,
            iterations = report.iterations,
            cost = report.final_cost(),
            "Optimization finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::QuadraticCost;
    use crate::dynamics::LinearDynamics;
    use nalgebra::{DMatrix, DVector};

    struct Undefined;

    impl DynamicsModel for Undefined {
        fn linearize(
            &self,
            _trajectory: &TrajectoryDistribution,
            t: usize,
        ) -> Result<crate::types::DynamicsLinear, ApproximationError> {
            Err(ApproximationError::Undefined {
                t,
                reason: "singular configuration".into(),
            })
        }
    }

    fn scalar_config() -> TrajOptConfig {
        let mut config = TrajOptConfig::default();
        config.problem.horizon = 4;
        config.problem.state_dim = 1;
        config.problem.action_dim = 1;
        config
    }

    fn scalar_models() -> (LinearDynamics, QuadraticCost) {
        (
            LinearDynamics::new(DMatrix::identity(1, 1), DMatrix::identity(1, 1)).unwrap(),
            QuadraticCost::new(DMatrix::identity(1, 1), DMatrix::identity(1, 1)).unwrap(),
        )
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn cancelled_before_start_returns_initial_trajectory() {
        let config = scalar_config();
        let (dynamics, cost) = scalar_models();
        let optimizer = Optimizer::new(&config, &dynamics, &cost).unwrap();
        let x0 = InitialState::deterministic(DVector::from_element(1, 1.0));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = optimizer.run(&x0, &cancel).unwrap();
        assert_eq!(report.status, ConvergenceStatus::Cancelled);
        assert_eq!(report.iterations, 0);
        assert_eq!(report.trajectory, optimizer.initial_trajectory(&x0).unwrap());
    }

    #[test]
    fn rejects_invalid_config_and_initial_state() {
        let mut config = scalar_config();
        let (dynamics, cost) = scalar_models();
        config.problem.horizon = 0;
        assert!(Optimizer::new(&config, &dynamics, &cost).is_err());

        let config = scalar_config();
        let optimizer = Optimizer::new(&config, &dynamics, &cost).unwrap();
        let x0 = InitialState::deterministic(DVector::zeros(3));
        assert!(matches!(
            optimizer.run(&x0, &CancelFlag::new()),
            Err(TrajOptError::Config(ConfigError::DimensionMismatch { .. }))
        ));
    }

    #[test]
    fn model_dimensions_are_checked_at_setup() {
        let config = scalar_config();
        let (_, cost) = scalar_models();
        let planar = LinearDynamics::new(DMatrix::identity(2, 2), DMatrix::zeros(2, 1)).unwrap();
        assert!(matches!(
            Optimizer::new(&config, &planar, &cost),
            Err(ConfigError::DimensionMismatch { expected: 1, got: 2, .. })
        ));

        let (dynamics, _) = scalar_models();
        let wide = QuadraticCost::new(DMatrix::identity(1, 1), DMatrix::identity(2, 2)).unwrap();
        let err = Optimizer::new(&config, &dynamics, &wide).err().unwrap();
        assert_eq!(err.to_string(), "Dimension mismatch for cost input dimension: expected 1, got 2");

        let disturbed = LinearDynamics::new(DMatrix::identity(1, 1), DMatrix::identity(1, 1))
            .unwrap()
            .with_disturbance(DMatrix::identity(1, 1))
            .unwrap();
        assert!(Optimizer::new(&config, &disturbed, &cost).is_err());
    }

    #[test]
    fn failing_first_rollout_is_an_error() {
        let config = scalar_config();
        let (_, cost) = scalar_models();
        let optimizer = Optimizer::new(&config, &Undefined, &cost).unwrap();
        let x0 = InitialState::deterministic(DVector::from_element(1, 1.0));
        assert!(matches!(
            optimizer.run(&x0, &CancelFlag::new()),
            Err(TrajOptError::Approximation(ApproximationError::Undefined { .. }))
        ));
    }

    #[test]
    fn cost_decreases_on_scalar_problem() {
        let mut config = scalar_config();
        config.trust_region.base_kl_step = 1.0;
        let (dynamics, cost) = scalar_models();
        let optimizer = Optimizer::new(&config, &dynamics, &cost).unwrap();
        let x0 = InitialState::deterministic(DVector::from_element(1, 2.0));
        let report = optimizer.run(&x0, &CancelFlag::new()).unwrap();
        assert!(report.cost_history.len() > 1);
        for pair in report.cost_history.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-9);
        }
        assert!(report.final_cost() < report.cost_history[0]);
    }

    #[test]
    fn step_mult_grows_when_prediction_is_exact() {
        let config = scalar_config();
        // predicted gain 1, actual gain 1 -> ratio 1 / 2e-4 clamped to 5
        let mult = adapt_step_mult(&config, 1.0, 10.0, 9.0, 9.0);
        assert!((mult - 5.0).abs() < 1e-12);
        // realized nothing -> ratio 0.5
        let mult = adapt_step_mult(&config, 1.0, 10.0, 9.0, 10.0);
        assert!((mult - 0.5).abs() < 1e-12);
    }

    #[test]
    fn convergence_window_needs_consecutive_quiet_steps() {
        let mut config = scalar_config();
        config.convergence.window = 2;
        config.convergence.cost_tolerance = 1e-3;
        let mut window = ConvergenceWindow::default();
        assert!(!window.record(&config, 10.0, 10.0));
        assert!(!window.record(&config, 10.0, 5.0));
        assert!(!window.record(&config, 5.0, 5.0));
        assert!(window.record(&config, 5.0, 5.0001));
    }
}
