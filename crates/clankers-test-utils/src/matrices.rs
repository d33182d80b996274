//! Random matrix generators for optimizer tests.

use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// `rows × cols` matrix with standard normal entries.
pub fn random_matrix(rows: usize, cols: usize, rng: &mut impl Rng) -> DMatrix<f64> {
    DMatrix::from_fn(rows, cols, |_, _| StandardNormal.sample(rng))
}

/// Symmetric positive definite matrix `G Gᵀ / dim + floor · I`.
pub fn random_spd(dim: usize, floor: f64, rng: &mut impl Rng) -> DMatrix<f64> {
    let g = random_matrix(dim, dim, rng);
    let mut m = &g * g.transpose() / dim as f64;
    for i in 0..dim {
        m[(i, i)] += floor;
    }
    m
}

/// Dynamics pair `(A, B)` with `A = I + scale · G`, close to identity so
/// short horizons stay well conditioned.
pub fn random_stable_dynamics(
    state_dim: usize,
    action_dim: usize,
    scale: f64,
    rng: &mut impl Rng,
) -> (DMatrix<f64>, DMatrix<f64>) {
    let a = DMatrix::identity(state_dim, state_dim) + random_matrix(state_dim, state_dim, rng) * scale;
    let b = random_matrix(state_dim, action_dim, rng);
    (a, b)
}
