//! Robust mode: a zero-sum game between the control input and a bounded
//! disturbance, solved by alternating KL-constrained turns.
//!
//! The joint action is `[u; v]`. The disturbance enters the dynamics
//! through the disturbance columns of the model scaled by γ, and the payoff
//! is `J = c(x, u, v) - ½ W |v|²`. The protagonist minimizes `J` and the
//! antagonist maximizes it. Each turn optimizes one role with the minimax
//! recursion while the other role's controller is held fixed in the forward
//! pass.
//!
//! [`GameState`] is an explicit state machine over [`GamePhase`]: a turn
//! ends with [`GameState::finish_turn`], and a full cycle (one turn per
//! role) whose largest mean change stays within tolerance converges the
//! game.

use tracing::{debug, info, warn};

use crate::backward::{BackwardPass, GameLayout};
use crate::config::{GameConfig, InitKind, Role, TrajOptConfig};
use crate::divergence::controller_kl_per_step;
use crate::error::{ApproximationError, ConfigError, SingularControlCostError, TrajOptError};
use crate::forward::{ForwardPass, expected_cost};
use crate::init::pd_controller;
use crate::model::{CostModel, DynamicsModel, approximate, check_model_dims, requadratize};
use crate::optimizer::{CancelFlag, adapt_step_mult};
use crate::step::{Probe, StepOutcome, StepSizeController, TrustRegionProblem};
use crate::types::{
    CostQuadratic, DynamicsLinear, InitialState, LinearGaussianController, LocalModel,
    TrajectoryDistribution,
};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Phase of the alternation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    ProtagonistTurn,
    AntagonistTurn,
    Converged,
}

impl GamePhase {
    /// Turn phase of `role`.
    pub const fn turn(role: Role) -> Self {
        match role {
            Role::Protagonist => Self::ProtagonistTurn,
            Role::Antagonist => Self::AntagonistTurn,
        }
    }

    /// Role being optimized, or `None` once converged.
    pub const fn active_role(self) -> Option<Role> {
        match self {
            Self::ProtagonistTurn => Some(Role::Protagonist),
            Self::AntagonistTurn => Some(Role::Antagonist),
            Self::Converged => None,
        }
    }
}

/// A value kept separately for each role.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerRole<T> {
    pub protagonist: T,
    pub antagonist: T,
}

impl<T> PerRole<T> {
    pub const fn get(&self, role: Role) -> &T {
        match role {
            Role::Protagonist => &self.protagonist,
            Role::Antagonist => &self.antagonist,
        }
    }

    pub fn get_mut(&mut self, role: Role) -> &mut T {
        match role {
            Role::Protagonist => &mut self.protagonist,
            Role::Antagonist => &mut self.antagonist,
        }
    }
}

impl<T: Clone> PerRole<T> {
    fn splat(value: T) -> Self {
        Self {
            protagonist: value.clone(),
            antagonist: value,
        }
    }
}

/// Both controllers, their joint trajectory and the alternation phase.
#[derive(Debug, Clone)]
pub struct GameState {
    phase: GamePhase,
    /// Disturbance magnitude γ.
    pub gamma: f64,
    cycle: usize,
    turns_in_cycle: usize,
    cycle_change: f64,
    controllers: PerRole<LinearGaussianController>,
    trajectory: TrajectoryDistribution,
    /// Dual variable carried between rounds, per role.
    pub eta: PerRole<f64>,
    /// Per-step dual variables under a per-step constraint, per role.
    pub eta_per_step: PerRole<Option<Vec<f64>>>,
    /// Trust-region step multiplier, per role.
    pub step_mult: PerRole<f64>,
}

impl GameState {
    pub fn new(
        config: &TrajOptConfig,
        game: &GameConfig,
        protagonist: LinearGaussianController,
        antagonist: LinearGaussianController,
        trajectory: TrajectoryDistribution,
    ) -> Self {
        Self {
            phase: GamePhase::turn(game.initial_role),
            gamma: game.gamma,
            cycle: 0,
            turns_in_cycle: 0,
            cycle_change: 0.0,
            controllers: PerRole {
                protagonist,
                antagonist,
            },
            trajectory,
            eta: PerRole::splat(config.step_size.initial_eta),
            eta_per_step: PerRole::splat(
                config
                    .trust_region
                    .per_step
                    .then(|| vec![config.step_size.initial_eta; config.problem.horizon]),
            ),
            step_mult: PerRole::splat(config.trust_region.initial_step_mult),
        }
    }

    pub const fn phase(&self) -> GamePhase {
        self.phase
    }

    /// Completed alternation cycles.
    pub const fn cycle(&self) -> usize {
        self.cycle
    }

    pub const fn active_role(&self) -> Option<Role> {
        self.phase.active_role()
    }

    /// Role whose controller is held fixed during the current turn.
    pub fn held_fixed(&self) -> Option<Role> {
        self.active_role().map(Role::other)
    }

    pub const fn controller(&self, role: Role) -> &LinearGaussianController {
        self.controllers.get(role)
    }

    pub const fn trajectory(&self) -> &TrajectoryDistribution {
        &self.trajectory
    }

    /// Joint `[u; v]` controller.
    pub fn joint_controller(&self) -> LinearGaussianController {
        LinearGaussianController::stacked(&self.controllers.protagonist, &self.controllers.antagonist)
    }

    fn apply_step(
        &mut self,
        role: Role,
        controller: LinearGaussianController,
        trajectory: TrajectoryDistribution,
    ) {
        *self.controllers.get_mut(role) = controller;
        self.trajectory = trajectory;
    }

    /// Ends the active turn, whose joint means moved by `change`, and
    /// advances the phase. A finished cycle whose largest change is within
    /// `tolerance` converges the game. Converged is absorbing.
    pub fn finish_turn(&mut self, change: f64, tolerance: f64) -> GamePhase {
        let Some(role) = self.phase.active_role() else {
            return self.phase;
        };
        self.cycle_change = self.cycle_change.max(change);
        self.turns_in_cycle += 1;
        if self.turns_in_cycle == 2 {
            self.cycle += 1;
            let quiet = self.cycle_change <= tolerance;
            self.turns_in_cycle = 0;
            self.cycle_change = 0.0;
            if quiet {
                self.phase = GamePhase::Converged;
                return self.phase;
            }
        }
        self.phase = GamePhase::turn(role.other());
        self.phase
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    Converged,
    /// Cycle budget exhausted; the last state is still returned.
    MaxAlternationCyclesReached,
    Cancelled,
    ApproximationFailed,
}

/// Summary of one finished turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRecord {
    pub cycle: usize,
    pub role: Role,
    pub iterations: usize,
    pub accepted: usize,
    /// Largest change of the joint means over the turn (inf-norm).
    pub change: f64,
    /// Payoff `J` after the turn.
    pub payoff: f64,
}

#[derive(Debug, Clone)]
pub struct GameReport {
    pub status: GameStatus,
    pub state: GameState,
    pub cycles: usize,
    pub turns: Vec<TurnRecord>,
    pub approximation_failures: Vec<(usize, ApproximationError)>,
}

impl GameReport {
    pub const fn protagonist(&self) -> &LinearGaussianController {
        self.state.controller(Role::Protagonist)
    }

    pub const fn trajectory(&self) -> &TrajectoryDistribution {
        self.state.trajectory()
    }
}

// ---------------------------------------------------------------------------
// Model adapters
// ---------------------------------------------------------------------------

/// Scales the disturbance columns of a dynamics model by γ.
struct ScaledDisturbance<'a> {
    inner: &'a dyn DynamicsModel,
    layout: GameLayout,
    gamma: f64,
}

impl DynamicsModel for ScaledDisturbance<'_> {
    fn linearize(
        &self,
        trajectory: &TrajectoryDistribution,
        t: usize,
    ) -> Result<DynamicsLinear, ApproximationError> {
        let mut lin = self.inner.linearize(trajectory, t)?;
        let start = self.layout.state_dim + self.layout.action_dim;
        let d = self.layout.disturbance_dim;
        // Shape errors are reported by the checked sweep.
        if lin.fm.ncols() == start + d {
            lin.fm.columns_mut(start, d).scale_mut(self.gamma);
        }
        Ok(lin)
    }
    fn dims(&self) -> Option<(usize, usize)> {
        self.inner.dims()
    }
}

// ---------------------------------------------------------------------------
// Turn subproblem
// ---------------------------------------------------------------------------

struct GameProblem<'p, 'a> {
    coordinator: &'p GameCoordinator<'a>,
    model: &'p LocalModel,
    role: Role,
    prev: &'p LinearGaussianController,
    fixed: &'p LinearGaussianController,
    x0: &'p InitialState,
    backward: BackwardPass<'p>,
    reference: f64,
}

impl TrustRegionProblem for GameProblem<'_, '_> {
    fn reference_objective(&self) -> f64 {
        self.reference
    }

    fn probe(&self, eta: f64) -> Result<Probe, SingularControlCostError> {
        let solution = self.backward.run_minimax(
            self.model,
            self.coordinator.layout,
            self.role,
            Some(self.prev),
            eta,
        )?;
        Ok(self.evaluate(eta, solution.controller))
    }

    fn probe_per_step(&self, etas: &[f64]) -> Result<Probe, SingularControlCostError> {
        let solution = self.backward.run_minimax_per_step(
            self.model,
            self.coordinator.layout,
            self.role,
            self.prev,
            etas,
        )?;
        let eta = etas.iter().sum::<f64>() / etas.len().max(1) as f64;
        Ok(self.evaluate(eta, solution.controller))
    }

    fn actual_objective(&self, probe: &Probe) -> Result<f64, ApproximationError> {
        Ok(self.role.sign() * self.coordinator.payoff(&probe.trajectory)?)
    }
}

impl GameProblem<'_, '_> {
    /// Forwards the joint controller and measures the divergence of the
    /// optimized role's controller along it.
    fn evaluate(&self, eta: f64, controller: LinearGaussianController) -> Probe {
        let joint = joint_controller(self.role, &controller, self.fixed);
        let trajectory = ForwardPass::through(&joint, self.model, self.x0);
        let kl_per_step = controller_kl_per_step(&controller, self.prev, &trajectory);
        let predicted = self.role.sign() * expected_cost(&trajectory, &self.model.costs);
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

fn joint_controller(
    role: Role,
    optimized: &LinearGaussianController,
    fixed: &LinearGaussianController,
) -> LinearGaussianController {
    match role {
        Role::Protagonist => LinearGaussianController::stacked(optimized, fixed),
        Role::Antagonist => LinearGaussianController::stacked(fixed, optimized),
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

enum TurnEnd {
    Completed,
    Cancelled,
    ApproximationFailed,
}

#[derive(Default)]
struct Bookkeeping {
    iteration: usize,
    consecutive_failures: usize,
    failures: Vec<(usize, ApproximationError)>,
    pending: PerRole<Option<(f64, f64)>>,
}

impl Default for PerRole<Option<(f64, f64)>> {
    fn default() -> Self {
        Self::splat(None)
    }
}

/// Drives the alternation for one initial condition.
///
/// The dynamics model must produce `F` over `[x; u; v]` and the cost model
/// must expand over the same space (see [`crate::cost::DisturbedCost`]).
pub struct GameCoordinator<'a> {
    config: &'a TrajOptConfig,
    game: &'a GameConfig,
    dynamics: ScaledDisturbance<'a>,
    cost: &'a dyn CostModel,
    layout: GameLayout,
}

impl<'a> GameCoordinator<'a> {
    pub fn new(
        config: &'a TrajOptConfig,
        dynamics: &'a dyn DynamicsModel,
        cost: &'a dyn CostModel,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let Some(game) = config.game.as_ref() else {
            return Err(ConfigError::invalid(
                "game",
                "robust mode requires a [game] section",
            ));
        };
        let layout = GameLayout {
            state_dim: config.problem.state_dim,
            action_dim: config.problem.action_dim,
            disturbance_dim: game.disturbance_dim,
        };
        check_model_dims(dynamics, cost, layout.state_dim, config.joint_action_dim())?;
        Ok(Self {
            config,
            game,
            dynamics: ScaledDisturbance {
                inner: dynamics,
                layout,
                gamma: game.gamma,
            },
            cost,
            layout,
        })
    }

    pub const fn layout(&self) -> GameLayout {
        self.layout
    }

    fn penalize(&self, costs: &mut [CostQuadratic]) {
        let start = self.layout.state_dim + self.layout.action_dim;
        for cost in costs {
            for i in start..start + self.layout.disturbance_dim {
                cost.cm[(i, i)] -= self.game.disturbance_penalty;
            }
        }
    }

    fn local_model(&self, trajectory: &TrajectoryDistribution) -> Result<LocalModel, ApproximationError> {
        let mut model = approximate(&self.dynamics, self.cost, trajectory)?;
        self.penalize(&mut model.costs);
        Ok(model)
    }

    /// Expected payoff `J` of a joint trajectory, with the cost re-queried
    /// along it.
    pub fn payoff(&self, trajectory: &TrajectoryDistribution) -> Result<f64, ApproximationError> {
        let mut costs = requadratize(self.cost, trajectory)?;
        self.penalize(&mut costs);
        Ok(expected_cost(trajectory, &costs))
    }

    /// Initial protagonist and antagonist controllers and their joint
    /// rollout from `x0`.
    pub fn initial_state(&self, x0: &InitialState) -> Result<GameState, TrajOptError> {
        let p = &self.config.problem;
        let init = &self.config.initialization;
        x0.validate(p.state_dim)?;

        let antagonist = LinearGaussianController::zero(
            p.horizon,
            p.state_dim,
            self.layout.disturbance_dim,
            self.game.disturbance_init_var,
        );
        let zero = LinearGaussianController::zero(p.horizon, p.state_dim, p.action_dim, init.init_var);
        let protagonist = match init.kind {
            InitKind::Zero => zero,
            InitKind::ProportionalDerivative => {
                pd_controller(p.horizon, p.action_dim, init, &x0.mean)
            }
            InitKind::Lqr => {
                let seed = LinearGaussianController::stacked(&zero, &antagonist);
                let rollout = ForwardPass::rollout(&seed, &self.dynamics, x0)?;
                let model = self.local_model(&rollout)?;
                BackwardPass::new(&self.config.regularization)
                    .run_minimax(&model, self.layout, Role::Protagonist, None, 1.0)?
                    .controller
            }
        };
        let joint = LinearGaussianController::stacked(&protagonist, &antagonist);
        let trajectory = ForwardPass::rollout(&joint, &self.dynamics, x0)?;
        Ok(GameState::new(self.config, self.game, protagonist, antagonist, trajectory))
    }

    /// Alternates turns from `x0` until the game converges, the cycle budget
    /// runs out, or cancellation.
    pub fn run(&self, x0: &InitialState, cancel: &CancelFlag) -> Result<GameReport, TrajOptError> {
        let mut state = self.initial_state(x0)?;
        let payoff = self.payoff(state.trajectory())?;
        info!(gamma = self.game.gamma, payoff, "Initial game state");

        let mut book = Bookkeeping::default();
        let mut turns = Vec::new();
        let status = loop {
            let Some(role) = state.active_role() else {
                break GameStatus::Converged;
            };
            if state.cycle() >= self.game.max_cycles {
                break GameStatus::MaxAlternationCyclesReached;
            }
            if cancel.is_cancelled() {
                break GameStatus::Cancelled;
            }

            let start = state.trajectory().clone();
            let iterations_before = book.iteration;
            let (end, accepted) = self.play_turn(role, &mut state, x0, cancel, &mut book);
            match end {
                TurnEnd::Completed => {}
                TurnEnd::Cancelled => break GameStatus::Cancelled,
                TurnEnd::ApproximationFailed => break GameStatus::ApproximationFailed,
            }

            let change = state.trajectory().max_mean_difference(&start);
            let payoff = match self.payoff(state.trajectory()) {
                Ok(payoff) => payoff,
                Err(err) => {
                    let iteration = book.iteration.saturating_sub(1);
                    self.record_failure(&mut book, iteration, err);
                    break GameStatus::ApproximationFailed;
                }
            };
            info!(cycle = state.cycle(), ?role, change, payoff, "Finished turn");
            turns.push(TurnRecord {
                cycle: state.cycle(),
                role,
                iterations: book.iteration - iterations_before,
                accepted,
                change,
                payoff,
            });
            state.finish_turn(change, self.game.tolerance);
        };

        info!(?status, cycles = state.cycle(), "Game finished");
        Ok(GameReport {
            status,
            cycles: state.cycle(),
            state,
            turns,
            approximation_failures: book.failures,
        })
    }

    /// Runs up to `iterations_per_turn` outer iterations for `role`.
    fn play_turn(
        &self,
        role: Role,
        state: &mut GameState,
        x0: &InitialState,
        cancel: &CancelFlag,
        book: &mut Bookkeeping,
    ) -> (TurnEnd, usize) {
        let config = self.config;
        let search = StepSizeController::new(&config.step_size, &config.regularization);
        let mut accepted = 0;

        for _ in 0..self.game.iterations_per_turn {
            if cancel.is_cancelled() {
                return (TurnEnd::Cancelled, accepted);
            }
            let iteration = book.iteration;
            book.iteration += 1;

            let round = self.local_model(state.trajectory()).map(|model| {
                let current = ForwardPass::through(&state.joint_controller(), &model, x0);
                let reference = role.sign() * expected_cost(&current, &model.costs);
                (model, reference)
            });
            let (model, reference) = match round {
                Ok(round) => round,
                Err(err) => {
                    if self.record_failure(book, iteration, err) {
                        return (TurnEnd::ApproximationFailed, accepted);
                    }
                    continue;
                }
            };

            if let Some((previous, predicted)) = book.pending.get_mut(role).take() {
                if config.trust_region.adapt_step {
                    let mult = state.step_mult.get_mut(role);
                    *mult = adapt_step_mult(config, *mult, previous, predicted, reference);
                }
            }

            let step_mult = *state.step_mult.get(role);
            let problem = GameProblem {
                coordinator: self,
                model: &model,
                role,
                prev: state.controller(role),
                fixed: state.controller(role.other()),
                x0,
                backward: BackwardPass::new(&config.regularization),
                reference,
            };
            let searched = match state.eta_per_step.get(role) {
                Some(etas) => search.search_per_step(&problem, etas, config.kl_step_target(step_mult)),
                None => search.search(&problem, *state.eta.get(role), config.kl_target(step_mult)),
            };
            let outcome = match searched {
                Ok(outcome) => outcome,
                Err(err) => {
                    if self.record_failure(book, iteration, err) {
                        return (TurnEnd::ApproximationFailed, accepted);
                    }
                    continue;
                }
            };
            book.consecutive_failures = 0;

            match outcome {
                StepOutcome::Accepted(step) => {
                    debug!(
                        iteration,
                        ?role,
                        objective = step.actual,
                        kl = step.kl,
                        eta = step.eta,
                        "Accepted game step"
                    );
                    accepted += 1;
                    *state.eta.get_mut(role) = step.eta;
                    if step.eta_per_step.is_some() {
                        *state.eta_per_step.get_mut(role) = step.eta_per_step;
                    }
                    *book.pending.get_mut(role) = Some((step.reference, step.predicted));
                    state.apply_step(role, step.controller, step.trajectory);
                }
                StepOutcome::Rejected(reason) => {
                    let mult = state.step_mult.get_mut(role);
                    *mult = (*mult * config.convergence.stall_shrink)
                        .max(config.trust_region.min_step_mult);
                    warn!(iteration, ?role, ?reason, step_mult = *mult, "No feasible game step");
                }
            }
        }
        (TurnEnd::Completed, accepted)
    }

    /// Records an aborted iteration; true once the failure budget is spent.
    fn record_failure(&self, book: &mut Bookkeeping, iteration: usize, err: ApproximationError) -> bool {
        warn!(iteration, error = %err, "Local approximation failed, iteration aborted");
        book.failures.push((iteration, err));
        book.consecutive_failures += 1;
        book.consecutive_failures >= self.config.convergence.max_approximation_failures
    }
}
