//! TOML problem files: optimizer settings, a linear system, a quadratic
//! cost and the initial conditions to solve from.

use std::path::Path;

use clankers_trajopt::{ConfigError, InitialState, LinearDynamics, QuadraticCost, TrajOptConfig};
use nalgebra::{DMatrix, DVector};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProblemError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Malformed matrix {field}: {message}")]
    Matrix { field: &'static str, message: String },

    #[error("Problem defines no initial conditions")]
    NoConditions,
}

/// `x_{t+1} = A x + B u + E v + offset + w`, `w ~ N(0, noise)`.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemSpec {
    pub a: Vec<Vec<f64>>,
    pub b: Vec<Vec<f64>>,
    #[serde(default)]
    pub disturbance: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub offset: Option<Vec<f64>>,
    #[serde(default)]
    pub noise: Option<Vec<Vec<f64>>>,
}

/// `½ (x - target)ᵀ Q (x - target) + ½ uᵀ R u`.
#[derive(Debug, Clone, Deserialize)]
pub struct CostSpec {
    pub q: Vec<Vec<f64>>,
    pub r: Vec<Vec<f64>>,
    #[serde(default)]
    pub target: Option<Vec<f64>>,
    #[serde(default)]
    pub final_weight: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionSpec {
    pub mean: Vec<f64>,
    /// Defaults to a point mass.
    #[serde(default)]
    pub covariance: Option<Vec<Vec<f64>>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Problem {
    #[serde(default)]
    pub optimizer: TrajOptConfig,
    pub system: SystemSpec,
    pub cost: CostSpec,
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
}

impl Problem {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProblemError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ProblemError> {
        let problem: Self = toml::from_str(contents)?;
        problem.optimizer.validate()?;
        if problem.conditions.is_empty() {
            return Err(ProblemError::NoConditions);
        }
        Ok(problem)
    }

    /// The nominal system, ignoring any disturbance channel.
    pub fn dynamics(&self) -> Result<LinearDynamics, ProblemError> {
        let s = &self.system;
        let mut dynamics = LinearDynamics::new(matrix("system.a", &s.a)?, matrix("system.b", &s.b)?)?;
        if let Some(offset) = &s.offset {
            dynamics = dynamics.with_offset(DVector::from_column_slice(offset))?;
        }
        if let Some(noise) = &s.noise {
            dynamics = dynamics.with_noise(matrix("system.noise", noise)?)?;
        }
        Ok(dynamics)
    }

    /// The system with the disturbance channel attached when present.
    pub fn disturbed_dynamics(&self) -> Result<LinearDynamics, ProblemError> {
        let dynamics = self.dynamics()?;
        match &self.system.disturbance {
            Some(e) => Ok(dynamics.with_disturbance(matrix("system.disturbance", e)?)?),
            None => Ok(dynamics),
        }
    }

    pub fn cost(&self) -> Result<QuadraticCost, ProblemError> {
        let c = &self.cost;
        let mut cost = QuadraticCost::new(matrix("cost.q", &c.q)?, matrix("cost.r", &c.r)?)?;
        if let Some(target) = &c.target {
            cost = cost.with_target(DVector::from_column_slice(target))?;
        }
        if let Some(weight) = c.final_weight {
            cost = cost.with_final_weight(weight);
        }
        Ok(cost)
    }

    pub fn conditions(&self) -> Result<Vec<InitialState>, ProblemError> {
        self.conditions
            .iter()
            .map(|c| {
                let mean = DVector::from_column_slice(&c.mean);
                let x0 = match &c.covariance {
                    Some(cov) => InitialState::new(mean, matrix("conditions.covariance", cov)?),
                    None => InitialState::deterministic(mean),
                };
                x0.validate(self.optimizer.problem.state_dim)?;
                Ok(x0)
            })
            .collect()
    }
}

/// Row-major nested list to a dense matrix.
fn matrix(field: &'static str, rows: &[Vec<f64>]) -> Result<DMatrix<f64>, ProblemError> {
    let Some(first) = rows.first() else {
        return Err(ProblemError::Matrix {
            field,
            message: "no rows".into(),
        });
    };
    let ncols = first.len();
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != ncols) {
        return Err(ProblemError::Matrix {
            field,
            message: format!("row {i} has {} entries, expected {ncols}", row.len()),
        });
    }
    Ok(DMatrix::from_fn(rows.len(), ncols, |i, j| rows[i][j]))
}
