//! Numeric failures.
//!
//! All of them end the current calibration run but leave the session usable:
//! the operator can re-sample and compute again.

use thiserror::Error;

/// Error from a matrix operation or the factor solve.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericError {
    /// Operand shapes are incompatible.
    #[error("shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        /// Operation name.
        op: &'static str,
        /// Left operand (rows, cols); vectors are (len, 1).
        left: (usize, usize),
        /// Right operand (rows, cols).
        right: (usize, usize),
    },

    /// Row index past the end of the matrix.
    #[error("row {row} out of range ({rows} rows)")]
    RowOutOfRange {
        /// Requested row.
        row: usize,
        /// Row count.
        rows: usize,
    },

    /// A matrix with no rows or no columns where data is required.
    #[error("empty matrix")]
    Empty,

    /// SVD did not converge.
    #[error("SVD decomposition failed to converge")]
    SvdFailed,

    /// Calibration weight must be positive.
    #[error("calibration weight must be positive, got {0}")]
    InvalidWeight(f64),
}

/// Result alias for numeric operations.
pub type NumericResult<T> = Result<T, NumericError>;
