//! Small dense linear-algebra helpers shared by the passes.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};

use crate::config::RegularizationConfig;

/// `0.5 * (m + mᵀ)`.
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Owned copy of the block starting at `(row, col)` with the given shape.
pub fn block(m: &DMatrix<f64>, row: usize, col: usize, nrows: usize, ncols: usize) -> DMatrix<f64> {
    m.view((row, col), (nrows, ncols)).into_owned()
}

/// Owned copy of `len` entries starting at `start`.
pub fn segment(v: &DVector<f64>, start: usize, len: usize) -> DVector<f64> {
    v.rows(start, len).into_owned()
}

/// Block-diagonal matrix `diag(a, b)`.
pub fn block_diag(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    let n = a.nrows() + b.nrows();
    let m = a.ncols() + b.ncols();
    let mut out = DMatrix::zeros(n, m);
    out.view_mut((0, 0), a.shape()).copy_from(a);
    out.view_mut((a.nrows(), a.ncols()), b.shape()).copy_from(b);
    out
}

/// Stacks two vectors.
pub fn concat(a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
    let mut out = DVector::zeros(a.len() + b.len());
    out.rows_mut(0, a.len()).copy_from(a);
    out.rows_mut(a.len(), b.len()).copy_from(b);
    out
}

/// Gathers the sub-matrix at the given row and column indices.
pub fn select(m: &DMatrix<f64>, rows: &[usize], cols: &[usize]) -> DMatrix<f64> {
    m.select_rows(rows).select_columns(cols)
}

/// Gathers entries of `v` at `idx`.
pub fn select_vec(v: &DVector<f64>, idx: &[usize]) -> DVector<f64> {
    DVector::from_iterator(idx.len(), idx.iter().map(|&i| v[i]))
}

/// Log-determinant from a Cholesky factor.
pub fn log_det(chol: &Cholesky<f64, Dyn>) -> f64 {
    2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// True when every entry is finite.
pub fn all_finite(m: &DMatrix<f64>) -> bool {
    m.iter().all(|v| v.is_finite())
}

/// Projects a symmetric matrix onto `{A : A ⪰ floor·I}` by clamping eigenvalues.
pub fn project_psd(m: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let mut eig = symmetrize(m).symmetric_eigen();
    if eig.eigenvalues.iter().all(|&l| l >= floor) {
        return symmetrize(m);
    }
    for l in eig.eigenvalues.iter_mut() {
        *l = l.max(floor);
    }
    symmetrize(&eig.recompose())
}

/// Cholesky factorization that also rejects zero or non-finite pivots.
pub fn definite_cholesky(m: &DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    let factor = Cholesky::new(m.clone())?;
    factor
        .l_dirty()
        .diagonal()
        .iter()
        .all(|d| d.is_finite() && *d > 0.0)
        .then_some(factor)
}

/// Outcome of a shifted Cholesky factorization.
pub struct ShiftedCholesky {
    pub factor: Cholesky<f64, Dyn>,
    /// The diagonal shift that made the matrix definite (0 if none was needed).
    pub shift: f64,
}

/// Factors `m + shift·I`, trying `shift = 0` first and then growing shifts
/// from the regularization schedule.
///
/// Returns `Err(last_shift)` when every attempt failed.
pub fn shifted_cholesky(
    m: &DMatrix<f64>,
    reg: &RegularizationConfig,
) -> Result<ShiftedCholesky, f64> {
    if let Some(factor) = definite_cholesky(m) {
        return Ok(ShiftedCholesky { factor, shift: 0.0 });
    }
    let n = m.nrows();
    let mut shift = reg.initial_shift;
    let mut last = 0.0;
    for _ in 0..reg.max_attempts {
        let shifted = m + DMatrix::identity(n, n) * shift;
        if let Some(factor) = definite_cholesky(&shifted) {
            return Ok(ShiftedCholesky { factor, shift });
        }
        last = shift;
        shift *= reg.shift_factor;
    }
    Err(last)
}
