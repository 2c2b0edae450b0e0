//! Moore-Penrose pseudoinverse through a thin SVD.

use crate::error::{NumericError, NumericResult};
use crate::matrix::Matrix;
use nalgebra::DMatrix;

/// Relative cut-off for singular values: `RCOND * max(rows, cols) * σ_max`.
pub const RCOND: f64 = 1e-12;

/// Computes `A⁺ = V · Σ⁺ · Uᵀ`.
///
/// Singular values at or below the threshold are treated as zero, so a
/// rank-deficient `A` (placements that are linear combinations of each
/// other) still yields a finite result.
///
/// # Errors
/// [`NumericError::Empty`] for a matrix without rows or columns,
/// [`NumericError::SvdFailed`] if the decomposition does not converge.
pub fn pseudo_inverse(a: &Matrix) -> NumericResult<Matrix> {
    let (rows, cols) = a.shape();
    if rows == 0 || cols == 0 {
        return Err(NumericError::Empty);
    }

    let svd = a
        .inner()
        .clone()
        .try_svd(true, true, f64::EPSILON, 0)
        .ok_or(NumericError::SvdFailed)?;
    let u = svd.u.ok_or(NumericError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(NumericError::SvdFailed)?;
    let sigma = svd.singular_values;

    let sigma_max = sigma.iter().copied().fold(0.0_f64, f64::max);
    let threshold = RCOND * rows.max(cols) as f64 * sigma_max;

    let k = sigma.len();
    let mut sigma_plus = DMatrix::<f64>::zeros(k, k);
    let mut dropped = 0usize;
    for (i, &s) in sigma.iter().enumerate() {
        if s > threshold {
            sigma_plus[(i, i)] = 1.0 / s;
        } else {
            dropped += 1;
        }
    }
    if dropped > 0 {
        tracing::debug!(target: "barcal::numerics", dropped, rank = k - dropped, "rank-deficient system");
    }

    let pinv = v_t.transpose() * sigma_plus * u.transpose();
    if pinv.iter().any(|v| !v.is_finite()) {
        return Err(NumericError::SvdFailed);
    }
    Ok(Matrix::from_inner(pinv))
}
