use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

const fn default_horizon() -> usize {
    50
}
const fn default_dim() -> usize {
    1
}
const fn default_base_kl_step() -> f64 {
    0.2
}
const fn default_one() -> f64 {
    1.0
}
const fn default_min_step_mult() -> f64 {
    0.01
}
const fn default_max_step_mult() -> f64 {
    10.0
}
const fn default_true() -> bool {
    true
}
const fn default_min_eta() -> f64 {
    1e-8
}
const fn default_max_eta() -> f64 {
    1e16
}
const fn default_bracket_factor() -> f64 {
    10.0
}
const fn default_kl_tolerance() -> f64 {
    0.1
}
const fn default_max_probes() -> u32 {
    50
}
const fn default_cost_slack() -> f64 {
    1e-9
}
const fn default_initial_shift() -> f64 {
    1e-6
}
const fn default_max_attempts() -> u32 {
    8
}
const fn default_eta_increment() -> f64 {
    1e-4
}
const fn default_max_eta_increases() -> u32 {
    30
}
const fn default_max_iterations() -> usize {
    20
}
const fn default_cost_tolerance() -> f64 {
    1e-4
}
const fn default_window() -> usize {
    2
}
const fn default_max_stalled() -> usize {
    3
}
const fn default_stall_shrink() -> f64 {
    0.5
}
const fn default_pos_gains() -> f64 {
    0.0
}
const fn default_vel_gains_mult() -> f64 {
    0.01
}
const fn default_gamma() -> f64 {
    0.1
}
const fn default_iterations_per_turn() -> usize {
    3
}
const fn default_max_cycles() -> usize {
    10
}
const fn default_game_tolerance() -> f64 {
    1e-4
}

// ---------------------------------------------------------------------------
// Problem
// ---------------------------------------------------------------------------

/// Horizon and dimensions of the control problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemConfig {
    /// Number of time steps T.
    #[serde(default = "default_horizon")]
    pub horizon: usize,

    /// State dimension n.
    #[serde(default = "default_dim")]
    pub state_dim: usize,

    /// Control dimension m (protagonist only in robust mode).
    #[serde(default = "default_dim")]
    pub action_dim: usize,
}

impl Default for ProblemConfig {
    fn default() -> Self {
        Self {
            horizon: default_horizon(),
            state_dim: default_dim(),
            action_dim: default_dim(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trust region
// ---------------------------------------------------------------------------

/// KL trust-region target and its per-round multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRegionConfig {
    /// Per-step KL bound. The total target of a round is
    /// `base_kl_step * step_mult * horizon`.
    #[serde(default = "default_base_kl_step")]
    pub base_kl_step: f64,

    #[serde(default = "default_one")]
    pub initial_step_mult: f64,

    #[serde(default = "default_min_step_mult")]
    pub min_step_mult: f64,

    #[serde(default = "default_max_step_mult")]
    pub max_step_mult: f64,

    /// Rescale `step_mult` from predicted vs. observed improvement.
    #[serde(default = "default_true")]
    pub adapt_step: bool,

    /// Bound the divergence of every step by `base_kl_step * step_mult`,
    /// each with its own η, instead of bounding the total.
    #[serde(default)]
    pub per_step: bool,
}

impl Default for TrustRegionConfig {
    fn default() -> Self {
        Self {
            base_kl_step: default_base_kl_step(),
            initial_step_mult: default_one(),
            min_step_mult: default_min_step_mult(),
            max_step_mult: default_max_step_mult(),
            adapt_step: true,
            per_step: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Step size search
// ---------------------------------------------------------------------------

/// Bracket-then-bisect search over the dual variable η.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSizeConfig {
    /// η used by the first round; later rounds start from the last accepted η.
    #[serde(default = "default_one")]
    pub initial_eta: f64,

    #[serde(default = "default_min_eta")]
    pub min_eta: f64,

    #[serde(default = "default_max_eta")]
    pub max_eta: f64,

    /// Multiplicative expansion used while the target is not bracketed.
    #[serde(default = "default_bracket_factor")]
    pub bracket_factor: f64,

    /// Relative KL tolerance ε: accept when `|kl - target| < ε * target`.
    #[serde(default = "default_kl_tolerance")]
    pub kl_tolerance: f64,

    /// Backward/forward evaluations allowed per round.
    #[serde(default = "default_max_probes")]
    pub max_probes: u32,

    /// Fraction of the predicted improvement the re-evaluated cost must
    /// realize. 0 only requires the cost not to increase.
    #[serde(default)]
    pub improvement_ratio: f64,

    /// Relative slack on the improvement test, scaled by `max(1, |cost|)`.
    #[serde(default = "default_cost_slack")]
    pub cost_slack: f64,

    /// Skip the search and evaluate a single probe at this η.
    #[serde(default)]
    pub fixed_eta: Option<f64>,
}

impl Default for StepSizeConfig {
    fn default() -> Self {
        Self {
            initial_eta: default_one(),
            min_eta: default_min_eta(),
            max_eta: default_max_eta(),
            bracket_factor: default_bracket_factor(),
            kl_tolerance: default_kl_tolerance(),
            max_probes: default_max_probes(),
            improvement_ratio: 0.0,
            cost_slack: default_cost_slack(),
            fixed_eta: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Regularization
// ---------------------------------------------------------------------------

/// Diagonal shifts for indefinite control blocks and the η escalation that
/// follows when they are exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegularizationConfig {
    #[serde(default = "default_initial_shift")]
    pub initial_shift: f64,

    #[serde(default = "default_bracket_factor")]
    pub shift_factor: f64,

    /// Shifts tried before the backward pass gives up at a time step.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First additive η increase after a singular control block; doubled on
    /// every further failure.
    #[serde(default = "default_eta_increment")]
    pub eta_increment: f64,

    #[serde(default = "default_max_eta_increases")]
    pub max_eta_increases: u32,
}

impl Default for RegularizationConfig {
    fn default() -> Self {
        Self {
            initial_shift: default_initial_shift(),
            shift_factor: default_bracket_factor(),
            max_attempts: default_max_attempts(),
            eta_increment: default_eta_increment(),
            max_eta_increases: default_max_eta_increases(),
        }
    }
}

// ---------------------------------------------------------------------------
// Convergence
// ---------------------------------------------------------------------------

/// Outer-loop budget and stopping rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Relative expected-cost change treated as no progress.
    #[serde(default = "default_cost_tolerance")]
    pub cost_tolerance: f64,

    /// Consecutive iterations below `cost_tolerance` required to stop.
    #[serde(default = "default_window")]
    pub window: usize,

    /// Consecutive rejected rounds before reporting `NoFeasibleStep`.
    #[serde(default = "default_max_stalled")]
    pub max_stalled: usize,

    /// Consecutive aborted iterations before reporting the condition failed.
    #[serde(default = "default_max_stalled")]
    pub max_approximation_failures: usize,

    /// Factor applied to `step_mult` after a rejected round.
    #[serde(default = "default_stall_shrink")]
    pub stall_shrink: f64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            cost_tolerance: default_cost_tolerance(),
            window: default_window(),
            max_stalled: default_max_stalled(),
            max_approximation_failures: default_max_stalled(),
            stall_shrink: default_stall_shrink(),
        }
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// How the first controller is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitKind {
    /// Zero gains, zero bias.
    #[default]
    Zero,
    /// PD feedback on the leading position/velocity coordinates.
    ProportionalDerivative,
    /// LQR on the models linearized along the zero-controller rollout.
    Lqr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitConfig {
    #[serde(default)]
    pub kind: InitKind,

    /// Initial controller covariance scale.
    #[serde(default = "default_one")]
    pub init_var: f64,

    #[serde(default = "default_pos_gains")]
    pub pos_gains: f64,

    #[serde(default = "default_vel_gains_mult")]
    pub vel_gains_mult: f64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            kind: InitKind::Zero,
            init_var: default_one(),
            pos_gains: default_pos_gains(),
            vel_gains_mult: default_vel_gains_mult(),
        }
    }
}

// ---------------------------------------------------------------------------
// Game
// ---------------------------------------------------------------------------

/// Player in the robust two-player formulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Chooses the control u to minimize the payoff.
    #[default]
    Protagonist,
    /// Chooses the disturbance v to maximize the payoff.
    Antagonist,
}

impl Role {
    /// The other player.
    pub const fn other(self) -> Self {
        match self {
            Self::Protagonist => Self::Antagonist,
            Self::Antagonist => Self::Protagonist,
        }
    }

    /// Sign turning the shared payoff into this role's minimization objective.
    pub const fn sign(self) -> f64 {
        match self {
            Self::Protagonist => 1.0,
            Self::Antagonist => -1.0,
        }
    }
}

/// Robust-mode settings. Present only when the disturbance game is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    /// Disturbance dimension d.
    #[serde(default = "default_dim")]
    pub disturbance_dim: usize,

    /// Disturbance magnitude γ scaling the disturbance channel of the dynamics.
    #[serde(default = "default_gamma")]
    pub gamma: f64,

    /// Weight W of the `-½ W |v|²` term paid by the antagonist.
    #[serde(default = "default_one")]
    pub disturbance_penalty: f64,

    #[serde(default)]
    pub initial_role: Role,

    /// Outer iterations per turn before the roles switch.
    #[serde(default = "default_iterations_per_turn")]
    pub iterations_per_turn: usize,

    #[serde(default = "default_max_cycles")]
    pub max_cycles: usize,

    /// Largest mean change (inf-norm) still counted as "unchanged" for a turn.
    #[serde(default = "default_game_tolerance")]
    pub tolerance: f64,

    /// Covariance scale of the initial antagonist controller.
    #[serde(default = "default_one")]
    pub disturbance_init_var: f64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            disturbance_dim: default_dim(),
            gamma: default_gamma(),
            disturbance_penalty: default_one(),
            initial_role: Role::Protagonist,
            iterations_per_turn: default_iterations_per_turn(),
            max_cycles: default_max_cycles(),
            tolerance: default_game_tolerance(),
            disturbance_init_var: default_one(),
        }
    }
}

// ---------------------------------------------------------------------------
// TrajOptConfig
// ---------------------------------------------------------------------------

/// Full optimizer configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajOptConfig {
    #[serde(default)]
    pub problem: ProblemConfig,

    #[serde(default)]
    pub trust_region: TrustRegionConfig,

    #[serde(default)]
    pub step_size: StepSizeConfig,

    #[serde(default)]
    pub regularization: RegularizationConfig,

    #[serde(default)]
    pub convergence: ConvergenceConfig,

    #[serde(default)]
    pub initialization: InitConfig,

    /// Enables robust mode.
    #[serde(default)]
    pub game: Option<GameConfig>,
}

fn positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{value} (must be finite and > 0)")))
    }
}

fn non_negative(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{value} (must be finite and >= 0)")))
    }
}

fn at_least_one(field: &str, value: usize) -> Result<(), ConfigError> {
    if value >= 1 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be >= 1"))
    }
}

impl TrajOptConfig {
    /// Load from a TOML file and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse from a TOML string and validate.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.problem;
        at_least_one("problem.horizon", p.horizon)?;
        at_least_one("problem.state_dim", p.state_dim)?;
        at_least_one("problem.action_dim", p.action_dim)?;

        let tr = &self.trust_region;
        positive("trust_region.base_kl_step", tr.base_kl_step)?;
        positive("trust_region.initial_step_mult", tr.initial_step_mult)?;
        positive("trust_region.min_step_mult", tr.min_step_mult)?;
        positive("trust_region.max_step_mult", tr.max_step_mult)?;
        if tr.min_step_mult > tr.max_step_mult {
            return Err(ConfigError::invalid(
                "trust_region.min_step_mult",
                "must be <= max_step_mult",
            ));
        }

        let s = &self.step_size;
        positive("step_size.initial_eta", s.initial_eta)?;
        positive("step_size.min_eta", s.min_eta)?;
        positive("step_size.max_eta", s.max_eta)?;
        if s.min_eta >= s.max_eta {
            return Err(ConfigError::invalid("step_size.min_eta", "must be < max_eta"));
        }
        if !(s.bracket_factor.is_finite() && s.bracket_factor > 1.0) {
            return Err(ConfigError::invalid("step_size.bracket_factor", "must be > 1"));
        }
        if !(s.kl_tolerance > 0.0 && s.kl_tolerance < 1.0) {
            return Err(ConfigError::invalid("step_size.kl_tolerance", "must be in (0, 1)"));
        }
        if s.max_probes == 0 {
            return Err(ConfigError::invalid("step_size.max_probes", "must be >= 1"));
        }
        non_negative("step_size.improvement_ratio", s.improvement_ratio)?;
        if s.improvement_ratio > 1.0 {
            return Err(ConfigError::invalid(
                "step_size.improvement_ratio",
                "must be <= 1",
            ));
        }
        non_negative("step_size.cost_slack", s.cost_slack)?;
        if let Some(eta) = s.fixed_eta {
            positive("step_size.fixed_eta", eta)?;
        }

        let r = &self.regularization;
        positive("regularization.initial_shift", r.initial_shift)?;
        if !(r.shift_factor.is_finite() && r.shift_factor > 1.0) {
            return Err(ConfigError::invalid("regularization.shift_factor", "must be > 1"));
        }
        positive("regularization.eta_increment", r.eta_increment)?;

        let c = &self.convergence;
        at_least_one("convergence.window", c.window)?;
        at_least_one("convergence.max_stalled", c.max_stalled)?;
        at_least_one(
            "convergence.max_approximation_failures",
            c.max_approximation_failures,
        )?;
        positive("convergence.cost_tolerance", c.cost_tolerance)?;
        if !(c.stall_shrink > 0.0 && c.stall_shrink <= 1.0) {
            return Err(ConfigError::invalid("convergence.stall_shrink", "must be in (0, 1]"));
        }

        let i = &self.initialization;
        positive("initialization.init_var", i.init_var)?;
        non_negative("initialization.pos_gains", i.pos_gains)?;
        non_negative("initialization.vel_gains_mult", i.vel_gains_mult)?;

        if let Some(g) = &self.game {
            at_least_one("game.disturbance_dim", g.disturbance_dim)?;
            non_negative("game.gamma", g.gamma)?;
            positive("game.disturbance_penalty", g.disturbance_penalty)?;
            at_least_one("game.iterations_per_turn", g.iterations_per_turn)?;
            at_least_one("game.max_cycles", g.max_cycles)?;
            positive("game.tolerance", g.tolerance)?;
            positive("game.disturbance_init_var", g.disturbance_init_var)?;
        }
        Ok(())
    }

    /// Total KL target of a round for the given step multiplier.
    pub fn kl_target(&self, step_mult: f64) -> f64 {
        self.kl_step_target(step_mult) * self.problem.horizon as f64
    }

    /// KL target of a single step, used by the per-step constraint.
    pub fn kl_step_target(&self, step_mult: f64) -> f64 {
        self.trust_region.base_kl_step * step_mult
    }

    /// Action dimension seen by the recursion: m, or m + d in robust mode.
    pub fn joint_action_dim(&self) -> usize {
        self.problem.action_dim + self.game.as_ref().map_or(0, |g| g.disturbance_dim)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
