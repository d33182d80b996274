//! Dual-variable search enforcing the KL trust region.

use tracing::debug;

use crate::config::{RegularizationConfig, StepSizeConfig};
use crate::error::{ApproximationError, SingularControlCostError};
use crate::types::{LinearGaussianController, TrajectoryDistribution};

/// Result of one backward + forward evaluation at a fixed η.
#[derive(Clone, Debug)]
pub struct Probe {
    pub eta: f64,
    /// Trajectory induced by the new controller under the local model.
    pub trajectory: TrajectoryDistribution,
    /// Controller whose divergence is constrained (the optimized role's in
    /// robust mode, otherwise the trajectory's own controller).
    pub controller: LinearGaussianController,
    /// Total divergence, the sum of `kl_per_step`.
    pub kl: f64,
    pub kl_per_step: Vec<f64>,
    /// Objective of `trajectory` under the current local model.
    pub predicted: f64,
}

/// One round of the trust-region subproblem, seen by [`StepSizeController`].
///
/// Objectives are always minimized; a maximizing player negates its payoff.
pub trait TrustRegionProblem {
    /// Objective of the previous trajectory under the current local model.
    fn reference_objective(&self) -> f64;

    /// Runs one backward and forward pass at `eta`.
    fn probe(&self, eta: f64) -> Result<Probe, SingularControlCostError>;

    /// Runs one backward and forward pass with η of step `t` at `etas[t]`.
    fn probe_per_step(&self, etas: &[f64]) -> Result<Probe, SingularControlCostError>;

    /// Objective of the probe with the cost model re-queried along it.
    fn actual_objective(&self, probe: &Probe) -> Result<f64, ApproximationError>;
}

/// An accepted trust-region step.
#[derive(Clone, Debug)]
pub struct AcceptedStep {
    pub trajectory: TrajectoryDistribution,
    pub controller: LinearGaussianController,
    /// η of the step, or the mean over steps under a per-step constraint.
    pub eta: f64,
    /// Per-step η under a per-step constraint.
    pub eta_per_step: Option<Vec<f64>>,
    pub kl: f64,
    /// Total target, or the per-step target under a per-step constraint.
    pub kl_target: f64,
    /// Objective of the previous trajectory under the local model.
    pub reference: f64,
    /// Objective of the new trajectory under the same local model.
    pub predicted: f64,
    /// Objective of the new trajectory with the cost re-queried along it.
    pub actual: f64,
    pub probes: u32,
}

/// Why a round produced no step. The previous trajectory is kept.
#[derive(Clone, Debug, PartialEq)]
pub enum RejectionReason {
    /// No probe satisfied both the divergence and the improvement test.
    ProbeBudgetExhausted { probes: u32, last_eta: f64, last_kl: f64 },
    /// The control block stayed singular through every η increase.
    SingularControlCost(SingularControlCostError),
    /// η had to move beyond the configured maximum.
    EtaLimitReached { eta: f64 },
    /// The single probe of a fixed-η round did not improve the objective.
    NoImprovement { eta: f64, reference: f64, actual: f64 },
}

/// Typed outcome of a step-size search.
#[derive(Clone, Debug)]
pub enum StepOutcome {
    Accepted(Box<AcceptedStep>),
    Rejected(RejectionReason),
}

impl StepOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Bracket-then-bisect search on η.
///
/// While only one side of the target has been observed, η moves by
/// `bracket_factor`; once both sides are known it moves to the geometric
/// mean of the bracket, never further than one factor per probe.
pub struct StepSizeController<'a> {
    config: &'a StepSizeConfig,
    reg: &'a RegularizationConfig,
}

#[derive(Default)]
struct Bracket {
    /// Largest η seen with divergence above target (η too small).
    lo: Option<f64>,
    /// Smallest η seen with divergence below target (η too large).
    hi: Option<f64>,
}

impl<'a> StepSizeController<'a> {
    pub const fn new(config: &'a StepSizeConfig, reg: &'a RegularizationConfig) -> Self {
        Self { config, reg }
    }

    pub const fn config(&self) -> &StepSizeConfig {
        self.config
    }

    /// Searches for an η whose step hits `kl_target` within tolerance and
    /// improves the objective. `eta0` is the starting guess, usually the
    /// previous round's η.
    pub fn search(
        &self,
        problem: &impl TrustRegionProblem,
        eta0: f64,
        kl_target: f64,
    ) -> Result<StepOutcome, ApproximationError> {
        if let Some(eta) = self.config.fixed_eta {
            return self.single_probe(problem, eta, kl_target);
        }

        let cfg = self.config;
        let reference = problem.reference_objective();
        let mut eta = eta0.clamp(cfg.min_eta, cfg.max_eta);
        let mut bracket = Bracket::default();
        let mut increment = self.reg.eta_increment;
        let mut increases = 0;
        let mut last_kl = f64::NAN;

        for probe_idx in 0..cfg.max_probes {
            let probe = match problem.probe(eta) {
                Ok(probe) => probe,
                Err(err) => {
                    increases += 1;
                    if increases > self.reg.max_eta_increases {
                        return Ok(StepOutcome::Rejected(RejectionReason::SingularControlCost(err)));
                    }
                    let next = eta + increment;
                    increment *= 2.0;
                    debug!(eta, next, t = err.t, "Singular control block, increasing eta");
                    if next > cfg.max_eta {
                        return Ok(StepOutcome::Rejected(RejectionReason::EtaLimitReached {
                            eta: next,
                        }));
                    }
                    bracket.lo = Some(eta);
                    eta = next;
                    continue;
                }
            };

            last_kl = probe.kl;
            let con = probe.kl - kl_target;
            let in_range = con.abs() < cfg.kl_tolerance * kl_target;
            let inactive = con < 0.0 && eta <= cfg.min_eta;

            let too_small = if in_range || inactive {
                let actual = problem.actual_objective(&probe)?;
                if self.improves(reference, probe.predicted, actual) {
                    debug!(
                        kl = probe.kl,
                        kl_target,
                        eta,
                        probes = probe_idx + 1,
                        "Accepted step"
                    );
                    return Ok(StepOutcome::Accepted(Box::new(AcceptedStep {
                        kl: probe.kl,
                        eta,
                        eta_per_step: None,
                        kl_target,
                        reference,
                        predicted: probe.predicted,
                        actual,
                        probes: probe_idx + 1,
                        trajectory: probe.trajectory,
                        controller: probe.controller,
                    })));
                }
                debug!(reference, actual, eta, "Insufficient improvement, shrinking step");
                true
            } else {
                con > 0.0
            };

            let next = self.next_eta(&mut bracket, eta, too_small);
            debug!(kl = probe.kl, kl_target, eta, next, "Adjusting eta");

            if next > cfg.max_eta {
                if eta >= cfg.max_eta {
                    return Ok(StepOutcome::Rejected(RejectionReason::EtaLimitReached {
                        eta: next,
                    }));
                }
                eta = cfg.max_eta;
            } else {
                eta = next.max(cfg.min_eta);
            }
        }

        Ok(StepOutcome::Rejected(RejectionReason::ProbeBudgetExhausted {
            probes: cfg.max_probes,
            last_eta: eta,
            last_kl,
        }))
    }

    /// Per-step variant of [`StepSizeController::search`]: every step has
    /// its own η and its own bracket, and the round is accepted once every
    /// step's divergence is within tolerance of `kl_step` (or below it at
    /// `min_eta`) and the objective improves. `eta0` holds one η per step.
    pub fn search_per_step(
        &self,
        problem: &impl TrustRegionProblem,
        eta0: &[f64],
        kl_step: f64,
    ) -> Result<StepOutcome, ApproximationError> {
        let cfg = self.config;
        if let Some(eta) = cfg.fixed_eta {
            let etas = vec![eta; eta0.len()];
            let probe = problem.probe_per_step(&etas);
            return self.finish_single(problem, probe, eta, Some(etas), kl_step);
        }

        let reference = problem.reference_objective();
        let mut etas: Vec<f64> = eta0.iter().map(|e| e.clamp(cfg.min_eta, cfg.max_eta)).collect();
        let mut brackets: Vec<Bracket> = etas.iter().map(|_| Bracket::default()).collect();
        let mut increments = vec![self.reg.eta_increment; etas.len()];
        let mut increases = 0;
        let mut last_kl = f64::NAN;

        for probe_idx in 0..cfg.max_probes {
            let probe = match problem.probe_per_step(&etas) {
                Ok(probe) => probe,
                Err(err) => {
                    increases += 1;
                    if increases > self.reg.max_eta_increases {
                        return Ok(StepOutcome::Rejected(RejectionReason::SingularControlCost(err)));
                    }
                    let Some(eta) = etas.get_mut(err.t) else {
                        return Ok(StepOutcome::Rejected(RejectionReason::SingularControlCost(err)));
                    };
                    let next = *eta + increments[err.t];
                    increments[err.t] *= 2.0;
                    debug!(eta = *eta, next, t = err.t, "Singular control block, increasing step eta");
                    if next > cfg.max_eta {
                        return Ok(StepOutcome::Rejected(RejectionReason::EtaLimitReached {
                            eta: next,
                        }));
                    }
                    brackets[err.t].lo = Some(*eta);
                    *eta = next;
                    continue;
                }
            };

            last_kl = probe.kl;
            let ok: Vec<bool> = probe
                .kl_per_step
                .iter()
                .zip(&etas)
                .map(|(&kl, &eta)| {
                    let con = kl - kl_step;
                    con.abs() < cfg.kl_tolerance * kl_step || (con < 0.0 && eta <= cfg.min_eta)
                })
                .collect();
            let all_satisfied = ok.iter().all(|&ok| ok);

            if all_satisfied {
                let actual = problem.actual_objective(&probe)?;
                if self.improves(reference, probe.predicted, actual) {
                    let eta = mean(&etas);
                    debug!(kl = probe.kl, kl_step, eta, probes = probe_idx + 1, "Accepted step");
                    return Ok(StepOutcome::Accepted(Box::new(AcceptedStep {
                        kl: probe.kl,
                        eta,
                        eta_per_step: Some(etas),
                        kl_target: kl_step,
                        reference,
                        predicted: probe.predicted,
                        actual,
                        probes: probe_idx + 1,
                        trajectory: probe.trajectory,
                        controller: probe.controller,
                    })));
                }
                debug!(reference, actual, "Insufficient improvement, shrinking every step");
            }

            // Satisfied steps keep their η unless the whole round must shrink.
            let mut moved = false;
            for (t, (eta, bracket)) in etas.iter_mut().zip(&mut brackets).enumerate() {
                if !all_satisfied && ok.get(t).copied().unwrap_or(true) {
                    continue;
                }
                let kl = probe.kl_per_step.get(t).copied().unwrap_or(0.0);
                let too_small = all_satisfied || kl > kl_step;
                let next = self
                    .next_eta(bracket, *eta, too_small)
                    .clamp(cfg.min_eta, cfg.max_eta);
                moved |= (next - *eta).abs() > f64::EPSILON * eta.abs();
                *eta = next;
            }
            if !moved {
                return Ok(StepOutcome::Rejected(RejectionReason::EtaLimitReached {
                    eta: cfg.max_eta,
                }));
            }
            debug!(kl = probe.kl, kl_step, eta = mean(&etas), "Adjusting step etas");
        }

        Ok(StepOutcome::Rejected(RejectionReason::ProbeBudgetExhausted {
            probes: cfg.max_probes,
            last_eta: mean(&etas),
            last_kl,
        }))
    }

    /// Next η for one bracket: stretch or shrink by `bracket_factor` until
    /// both sides are known, then the geometric mean capped at one factor.
    fn next_eta(&self, bracket: &mut Bracket, eta: f64, too_small: bool) -> f64 {
        let factor = self.config.bracket_factor;
        if too_small {
            bracket.lo = Some(eta);
            let stretch = eta * factor;
            bracket
                .hi
                .map_or(stretch, |hi| (eta * hi).sqrt().min(stretch))
        } else {
            bracket.hi = Some(eta);
            let shrink = eta / factor;
            bracket
                .lo
                .map_or(shrink, |lo| (lo * eta).sqrt().max(shrink))
        }
    }

    fn single_probe(
        &self,
        problem: &impl TrustRegionProblem,
        eta: f64,
        kl_target: f64,
    ) -> Result<StepOutcome, ApproximationError> {
        self.finish_single(problem, problem.probe(eta), eta, None, kl_target)
    }

    fn finish_single(
        &self,
        problem: &impl TrustRegionProblem,
        probe: Result<Probe, SingularControlCostError>,
        eta: f64,
        eta_per_step: Option<Vec<f64>>,
        kl_target: f64,
    ) -> Result<StepOutcome, ApproximationError> {
        let reference = problem.reference_objective();
        let probe = match probe {
            Ok(probe) => probe,
            Err(err) => {
                return Ok(StepOutcome::Rejected(RejectionReason::SingularControlCost(err)));
            }
        };
        let actual = problem.actual_objective(&probe)?;
        if !self.improves(reference, probe.predicted, actual) {
            return Ok(StepOutcome::Rejected(RejectionReason::NoImprovement {
                eta,
                reference,
                actual,
            }));
        }
        Ok(StepOutcome::Accepted(Box::new(AcceptedStep {
            kl: probe.kl,
            eta,
            eta_per_step,
            kl_target,
            reference,
            predicted: probe.predicted,
            actual,
            probes: 1,
            trajectory: probe.trajectory,
            controller: probe.controller,
        })))
    }

    /// Trust-region ratio test: the re-queried objective must realize at
    /// least `improvement_ratio` of the predicted improvement.
    fn improves(&self, reference: f64, predicted: f64, actual: f64) -> bool {
        let predicted_gain = (reference - predicted).max(0.0);
        let slack = self.config.cost_slack * reference.abs().max(1.0);
        actual <= reference - self.config.improvement_ratio * predicted_gain + slack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::ForwardPass;
    use crate::types::{DynamicsLinear, InitialState};
    use nalgebra::{DMatrix, DVector};
    use std::cell::Cell;

    /// Synthetic problem with `kl(eta) = scale / eta` and a configurable
    /// improvement profile.
    struct Synthetic {
        scale: f64,
        /// Per-step scales: `kl_t(eta) = step_scales[t] / eta_t`.
        step_scales: Vec<f64>,
        singular_below: f64,
        actual_penalty: f64,
        calls: Cell<u32>,
        trajectory: TrajectoryDistribution,
    }

    impl Synthetic {
        fn new(scale: f64) -> Self {
            let controller = LinearGaussianController::zero(1, 1, 1, 1.0);
            let dynamics = vec![DynamicsLinear {
                fm: DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
                fv: DVector::zeros(1),
                covar: DMatrix::zeros(1, 1),
            }];
            let x0 = InitialState::deterministic(DVector::zeros(1));
            Self {
                scale,
                step_scales: vec![scale],
                singular_below: 0.0,
                actual_penalty: 0.0,
                calls: Cell::new(0),
                trajectory: ForwardPass::run(&controller, &dynamics, &x0).unwrap(),
            }
        }
    }

    impl TrustRegionProblem for Synthetic {
        fn reference_objective(&self) -> f64 {
            10.0
        }

        fn probe(&self, eta: f64) -> Result<Probe, SingularControlCostError> {
            self.calls.set(self.calls.get() + 1);
            if eta < self.singular_below {
                return Err(SingularControlCostError {
                    t: 0,
                    attempts: 1,
                    last_shift: 1.0,
                });
            }
            Ok(Probe {
                eta,
                trajectory: self.trajectory.clone(),
                controller: self.trajectory.controller().clone(),
                kl: self.scale / eta,
                kl_per_step: vec![self.scale / eta],
                predicted: 10.0 - 1.0 / (1.0 + eta),
            })
        }

        fn probe_per_step(&self, etas: &[f64]) -> Result<Probe, SingularControlCostError> {
            self.calls.set(self.calls.get() + 1);
            if let Some(t) = etas.iter().position(|&eta| eta < self.singular_below) {
                return Err(SingularControlCostError {
                    t,
                    attempts: 1,
                    last_shift: 1.0,
                });
            }
            let kl_per_step: Vec<f64> =
                etas.iter().zip(&self.step_scales).map(|(eta, s)| s / eta).collect();
            let eta = mean(etas);
            Ok(Probe {
                eta,
                trajectory: self.trajectory.clone(),
                controller: self.trajectory.controller().clone(),
                kl: kl_per_step.iter().sum(),
                kl_per_step,
                predicted: 10.0 - 1.0 / (1.0 + eta),
            })
        }

        fn actual_objective(&self, probe: &Probe) -> Result<f64, ApproximationError> {
            Ok(probe.predicted + self.actual_penalty / probe.eta.max(1e-300).min(1.0))
        }
    }

    fn configs() -> (StepSizeConfig, RegularizationConfig) {
        (StepSizeConfig::default(), RegularizationConfig::default())
    }

    #[test]
    fn brackets_and_bisects_to_target() {
        let (cfg, reg) = configs();
        let problem = Synthetic::new(1.0);
        let outcome = StepSizeController::new(&cfg, &reg)
            .search(&problem, 1.0, 0.05)
            .unwrap();
        let StepOutcome::Accepted(step) = outcome else {
            panic!("expected an accepted step");
        };
        assert!((step.kl - 0.05).abs() < 0.1 * 0.05);
        assert!(step.eta > 10.0 && step.eta < 100.0);
        assert!(step.probes > 1);
    }

    #[test]
    fn inactive_constraint_accepts_at_min_eta() {
        let (cfg, reg) = configs();
        let problem = Synthetic::new(1e-12);
        let outcome = StepSizeController::new(&cfg, &reg)
            .search(&problem, 1.0, 1e6)
            .unwrap();
        let StepOutcome::Accepted(step) = outcome else {
            panic!("expected an accepted step");
        };
        assert!((step.eta - cfg.min_eta).abs() < 1e-20);
    }

    #[test]
    fn singular_blocks_push_eta_up() {
        let (cfg, reg) = configs();
        let mut problem = Synthetic::new(1.0);
        problem.singular_below = 0.5;
        let outcome = StepSizeController::new(&cfg, &reg)
            .search(&problem, 0.01, 0.5)
            .unwrap();
        let StepOutcome::Accepted(step) = outcome else {
            panic!("expected an accepted step");
        };
        assert!(step.eta >= 0.5);
    }

    #[test]
    fn singular_everywhere_is_rejected() {
        let (cfg, reg) = configs();
        let mut problem = Synthetic::new(1.0);
        problem.singular_below = f64::INFINITY;
        let outcome = StepSizeController::new(&cfg, &reg)
            .search(&problem, 1.0, 0.5)
            .unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Rejected(
                RejectionReason::SingularControlCost(_) | RejectionReason::EtaLimitReached { .. }
            )
        ));
        assert!(problem.calls.get() <= reg.max_eta_increases + 1);
    }

    #[test]
    fn no_improvement_exhausts_budget_without_step() {
        let (mut cfg, reg) = configs();
        cfg.max_probes = 12;
        let mut problem = Synthetic::new(1.0);
        problem.actual_penalty = 1e6;
        let outcome = StepSizeController::new(&cfg, &reg)
            .search(&problem, 1.0, 0.5)
            .unwrap();
        assert!(!outcome.is_accepted());
        assert!(problem.calls.get() <= 12);
    }

    #[test]
    fn fixed_eta_runs_single_probe() {
        let (mut cfg, reg) = configs();
        cfg.fixed_eta = Some(1e10);
        let problem = Synthetic::new(1.0);
        let outcome = StepSizeController::new(&cfg, &reg)
            .search(&problem, 1.0, 0.5)
            .unwrap();
        assert!(outcome.is_accepted());
        assert_eq!(problem.calls.get(), 1);
    }

    #[test]
    fn per_step_search_hits_every_step_target() {
        let (cfg, reg) = configs();
        let mut problem = Synthetic::new(1.0);
        problem.step_scales = vec![1.0, 4.0, 0.25];
        let outcome = StepSizeController::new(&cfg, &reg)
            .search_per_step(&problem, &[1.0; 3], 0.05)
            .unwrap();
        let StepOutcome::Accepted(step) = outcome else {
            panic!("expected an accepted step");
        };
        let etas = step.eta_per_step.unwrap();
        assert_eq!(etas.len(), 3);
        for (eta, scale) in etas.iter().zip(&problem.step_scales) {
            assert!((scale / eta - 0.05).abs() < 0.1 * 0.05);
        }
        assert!(etas[1] > etas[0] && etas[0] > etas[2]);
        assert!((step.kl_target - 0.05).abs() < 1e-15);
    }

    #[test]
    fn per_step_singular_block_raises_only_its_eta() {
        let (cfg, reg) = configs();
        let mut problem = Synthetic::new(1.0);
        problem.step_scales = vec![1.0, 1.0];
        problem.singular_below = 0.5;
        let outcome = StepSizeController::new(&cfg, &reg)
            .search_per_step(&problem, &[1.0, 0.01], 1.0)
            .unwrap();
        let StepOutcome::Accepted(step) = outcome else {
            panic!("expected an accepted step");
        };
        let etas = step.eta_per_step.unwrap();
        // Step 0 met its target on the first probe and never moved.
        assert!((etas[0] - 1.0).abs() < 1e-12);
        assert!(etas[1] >= 0.5);
        assert!((1.0 / etas[1] - 1.0).abs() < 0.1);
    }

    #[test]
    fn per_step_fixed_eta_runs_single_probe() {
        let (mut cfg, reg) = configs();
        cfg.fixed_eta = Some(1e10);
        let mut problem = Synthetic::new(1.0);
        problem.step_scales = vec![1.0, 1.0];
        let outcome = StepSizeController::new(&cfg, &reg)
            .search_per_step(&problem, &[1.0, 1.0], 0.5)
            .unwrap();
        let StepOutcome::Accepted(step) = outcome else {
            panic!("expected an accepted step");
        };
        assert_eq!(step.eta_per_step, Some(vec![1e10, 1e10]));
        assert_eq!(problem.calls.get(), 1);
    }
}
