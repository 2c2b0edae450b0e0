//! `barcal-numerics`
//!
//! Linear algebra for bar calibration: checked [`Matrix`]/[`Vector`] values,
//! an SVD pseudoinverse that tolerates rank deficiency, the zero/factor
//! [`solve`] with its self-consistency error, and the IEEE-754 encoding the
//! firmware expects.

pub mod error;
pub mod ieee754;
pub mod matrix;
pub mod pinv;
pub mod solve;

pub use error::{NumericError, NumericResult};
pub use matrix::{format_matrix, format_vector, Matrix, Vector};
pub use pinv::pseudo_inverse;
pub use solve::{solve, Solution};
