//! Zero/factor solve for a completed calibration run.
//!
//! With `ad0` the zero reading replicated over every placement row and `adv`
//! the loaded readings, each row `i` of `A = adv − ad0` satisfies
//! `A[i] · factors = w` (the weight sits on the shelf, split somehow between
//! the cells). Stacking the rows gives `A · factors = W` with `W = (w, .., w)`,
//! solved in the least-squares sense as `factors = A⁺ · W`.

use crate::error::{NumericError, NumericResult};
use crate::ieee754;
use crate::matrix::{format_matrix, format_vector, Matrix, Vector};
use crate::pinv::pseudo_inverse;
use tracing::debug;

/// Everything computed by [`solve`], kept for diagnostics.
#[derive(Debug, Clone)]
pub struct Solution {
    /// Zero readings, one identical row per placement.
    pub ad0: Matrix,
    /// Loaded readings, one row per placement.
    pub adv: Matrix,
    /// `adv − ad0`.
    pub diff: Matrix,
    /// Load vector `W`.
    pub load: Vector,
    /// `(adv − ad0)⁺`.
    pub pinv: Matrix,
    /// Per-channel zeros (first row of `ad0`).
    pub zeros: Vector,
    /// Per-channel factors.
    pub factors: Vector,
    /// `(adv − ad0) · factors`, should reproduce `W`.
    pub check: Vector,
    /// `‖check − W‖ / w`.
    pub error: f64,
    /// Frobenius norm of the pseudoinverse.
    pub pinv_norm: f64,
    /// Calibration weight.
    pub weight: f64,
}

/// Solves for zeros and factors.
///
/// # Errors
/// Shape mismatches between `ad0` and `adv`, an empty system, a non-positive
/// weight or SVD failure.
pub fn solve(ad0: &Matrix, adv: &Matrix, weight: f64) -> NumericResult<Solution> {
    if !(weight > 0.0) {
        return Err(NumericError::InvalidWeight(weight));
    }
    let diff = adv.sub(ad0)?;
    if diff.rows() == 0 || diff.cols() == 0 {
        return Err(NumericError::Empty);
    }
    let load = Vector::filled(diff.rows(), weight);
    let pinv = pseudo_inverse(&diff)?;
    let factors = pinv.mul_vector(&load)?;
    let zeros = ad0.row(0)?;
    let check = diff.mul_vector(&factors)?;
    let error = check.sub(&load)?.norm() / weight;
    let pinv_norm = pinv.norm();
    debug!(target: "barcal::numerics", rows = diff.rows(), cols = diff.cols(), error, pinv_norm, "factors solved");

    Ok(Solution {
        ad0: ad0.clone(),
        adv: adv.clone(),
        diff,
        load,
        pinv,
        zeros,
        factors,
        check,
        error,
        pinv_norm,
        weight,
    })
}

impl Solution {
    /// Factors narrowed to the precision the firmware stores.
    pub fn factors_f32(&self) -> Vec<f32> {
        self.factors
            .as_slice()
            .iter()
            .map(|&f| ieee754::to_f32(f))
            .collect()
    }

    /// Zeros as the unsigned baselines the firmware stores (negatives clamp to 0).
    pub fn zeros_u64(&self) -> Vec<u64> {
        self.zeros
            .as_slice()
            .iter()
            .map(|&z| if z > 0.0 { z as u64 } else { 0 })
            .collect()
    }

    /// Text dump of the whole system, capped at `max_rows` × `max_cols`.
    pub fn report(&self, max_rows: usize, max_cols: usize) -> String {
        let mut out = String::new();
        out.push_str(&format_matrix("ad0", &self.ad0, max_rows, max_cols));
        out.push_str(&format_matrix("adv", &self.adv, max_rows, max_cols));
        out.push_str(&format_matrix("adv - ad0", &self.diff, max_rows, max_cols));
        out.push_str(&format_vector("W", &self.load, max_rows));
        out.push_str(&format_matrix("pinv", &self.pinv, max_rows, max_cols));
        out.push_str(&format_vector("zeros", &self.zeros, max_rows));
        out.push_str(&format!("factors ({})\n", self.factors.len()));
        for factor in self.factors_f32().iter().take(max_rows) {
            out.push_str(&format!("{:>16.10}  {}\n", factor, ieee754::to_hex(*factor)));
        }
        out.push_str(&format_vector("check", &self.check, max_rows));
        out.push_str(&format!("error = {:.3e}\n", self.error));
        out.push_str(&format!("|pinv| = {:.6e}\n", self.pinv_norm));
        out
    }
}
