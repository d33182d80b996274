use thiserror::Error;

/// Top-level error type for clankers-trajopt.
#[derive(Debug, Error)]
pub enum TrajOptError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Approximation error: {0}")]
    Approximation(#[from] ApproximationError),

    #[error("Singular control cost: {0}")]
    SingularControlCost(#[from] SingularControlCostError),
}

/// Configuration errors, detected once at setup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Dimension mismatch for {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        got: usize,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_owned(),
            message: message.into(),
        }
    }
}

/// A dynamics or cost model could not produce a local approximation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApproximationError {
    #[error("Model undefined at t={t}: {reason}")]
    Undefined { t: usize, reason: String },

    #[error("Non-finite {what} at t={t}")]
    NonFinite { t: usize, what: &'static str },

    #[error("Shape mismatch for {what} at t={t}: expected {expected:?}, got {got:?}")]
    DimensionMismatch {
        t: usize,
        what: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("Not enough samples at t={t}: need {required}, got {got}")]
    InsufficientSamples {
        t: usize,
        required: usize,
        got: usize,
    },
}

/// Control block of the Q-function stayed indefinite after every allowed
/// diagonal shift.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("control block at t={t} not definite after {attempts} regularization attempts (last shift {last_shift:.3e})")]
pub struct SingularControlCostError {
    pub t: usize,
    pub attempts: u32,
    pub last_shift: f64,
}
