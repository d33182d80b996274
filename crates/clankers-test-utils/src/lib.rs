//! Shared test fixtures and utilities for Clankers crates.
//!
//! Provides deterministic RNG setup and random matrix generators for
//! exercising the trajectory optimizer on reproducible problems.

pub mod matrices;
pub mod rng;

// ---------------------------------------------------------------------------
// Re-exports for convenience
// ---------------------------------------------------------------------------

pub use matrices::{random_matrix, random_spd, random_stable_dynamics};
pub use rng::{deterministic_vec, seeded_rng};
