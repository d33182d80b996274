//! Independent optimization of several initial conditions.
//!
//! Each condition runs its own outer loop on the rayon pool. Conditions
//! share only the read-only configuration and models, so results do not
//! depend on thread count or scheduling order.

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::config::TrajOptConfig;
use crate::error::{ConfigError, TrajOptError};
use crate::game::{GameCoordinator, GameReport};
use crate::model::{CostModel, DynamicsModel};
use crate::optimizer::{CancelFlag, OptimizationReport, Optimizer};
use crate::types::InitialState;

/// Runs one [`Optimizer`] per initial state. Results are in input order.
pub fn optimize_conditions(
    config: &TrajOptConfig,
    dynamics: &dyn DynamicsModel,
    cost: &dyn CostModel,
    conditions: &[InitialState],
    cancel: &CancelFlag,
) -> Result<Vec<Result<OptimizationReport, TrajOptError>>, ConfigError> {
    let optimizer = Optimizer::new(config, dynamics, cost)?;
    Ok(conditions
        .par_iter()
        .map(|x0| optimizer.run(x0, cancel))
        .collect())
}

/// Runs one [`GameCoordinator`] per initial state. Results are in input
/// order.
pub fn solve_games(
    config: &TrajOptConfig,
    dynamics: &dyn DynamicsModel,
    cost: &dyn CostModel,
    conditions: &[InitialState],
    cancel: &CancelFlag,
) -> Result<Vec<Result<GameReport, TrajOptError>>, ConfigError> {
    let coordinator = GameCoordinator::new(config, dynamics, cost)?;
    Ok(conditions
        .par_iter()
        .map(|x0| coordinator.run(x0, cancel))
        .collect())
}
