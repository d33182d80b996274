//! KL-constrained iterative LQG trajectory optimization.
//!
//! This crate refines a time-varying linear-Gaussian controller around a
//! nominal trajectory by repeating four stages:
//!
//! 1. **Local approximation**: a [`DynamicsModel`] linearizes and a
//!    [`CostModel`] quadratizes along the current trajectory
//! 2. **Backward pass**: a regularized Riccati recursion on the cost
//!    augmented with the previous controller's log-density, weighted by the
//!    dual variable η
//! 3. **Forward pass**: closed-form moment propagation of the new controller
//! 4. **Step-size search**: bracket-then-bisect on η until the KL divergence
//!    from the previous controller hits the trust-region target
//!
//! # Architecture
//!
//! [`Optimizer`] drives the outer loop for one initial condition and
//! returns an [`OptimizationReport`] with a typed [`ConvergenceStatus`].
//! [`GameCoordinator`] runs the robust variant: a zero-sum game between the
//! control input and a γ-scaled disturbance, alternating KL-constrained turns
//! under an explicit [`GamePhase`] state machine. Independent initial
//! conditions are optimized in parallel by [`optimize_conditions`].
//!
//! All matrices are `nalgebra` dynamic matrices; every round produces new
//! immutable [`TrajectoryDistribution`] values.

pub mod backward;
pub mod conditions;
pub mod config;
pub mod cost;
pub mod divergence;
pub mod dynamics;
pub mod error;
pub mod forward;
pub mod game;
pub mod init;
pub mod linalg;
pub mod model;
pub mod optimizer;
pub mod step;
pub mod types;

pub use backward::{BackwardPass, GameLayout, MinimaxSolution, Response};
pub use conditions::{optimize_conditions, solve_games};
pub use config::{
    ConvergenceConfig, GameConfig, InitConfig, InitKind, ProblemConfig, RegularizationConfig,
    Role, StepSizeConfig, TrajOptConfig, TrustRegionConfig,
};
pub use cost::{CompositeCost, DisturbedCost, FiniteDifferenceCost, QuadraticCost};
pub use divergence::{controller_kl_per_step, kl_per_step, step_kl, trajectory_kl};
pub use dynamics::{FiniteDifferenceDynamics, FittedDynamics, LinearDynamics, NiwPrior, Transition};
pub use error::{ApproximationError, ConfigError, SingularControlCostError, TrajOptError};
pub use forward::{ForwardPass, expected_cost, expected_cost_per_step, state_marginals};
pub use game::{GameCoordinator, GamePhase, GameReport, GameState, GameStatus, PerRole, TurnRecord};
pub use init::initial_controller;
pub use model::{CostModel, DynamicsModel, approximate};
pub use optimizer::{CancelFlag, ConvergenceStatus, OptimizationReport, Optimizer};
pub use step::{
    AcceptedStep, Probe, RejectionReason, StepOutcome, StepSizeController, TrustRegionProblem,
};
pub use types::{
    CostQuadratic, DynamicsLinear, InitialState, LinearGaussianController, LinearGaussianStep,
    LocalModel, TrajectoryDistribution,
};
