//! Dense matrix and vector values with checked shapes.
//!
//! Thin wrappers over `nalgebra` dynamic storage. The API is row-oriented
//! because calibration data is: one row per sampling step, one column per
//! channel. Binary operations return [`NumericError::ShapeMismatch`] instead
//! of panicking.

use crate::error::{NumericError, NumericResult};
use nalgebra::{DMatrix, DVector};
use std::fmt;

/// Dense `rows × cols` matrix of `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix(DMatrix<f64>);

/// Dense vector of `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct Vector(DVector<f64>);

impl Matrix {
    /// Zero-filled matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self(DMatrix::zeros(rows, cols))
    }

    /// Builds a matrix from row-major data.
    pub fn from_row_slice(rows: usize, cols: usize, data: &[f64]) -> NumericResult<Self> {
        if data.len() != rows * cols {
            return Err(NumericError::ShapeMismatch {
                op: "from_row_slice",
                left: (rows, cols),
                right: (data.len(), 1),
            });
        }
        Ok(Self(DMatrix::from_row_slice(rows, cols, data)))
    }

    /// Matrix whose every row is `row`.
    pub fn repeat_row(rows: usize, row: &Vector) -> Self {
        Self(DMatrix::from_fn(rows, row.len(), |_, c| row.0[c]))
    }

    /// Wraps an `nalgebra` matrix.
    pub fn from_inner(inner: DMatrix<f64>) -> Self {
        Self(inner)
    }

    /// Borrow the `nalgebra` matrix.
    pub fn inner(&self) -> &DMatrix<f64> {
        &self.0
    }

    /// Row count.
    pub fn rows(&self) -> usize {
        self.0.nrows()
    }

    /// Column count.
    pub fn cols(&self) -> usize {
        self.0.ncols()
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        self.0.shape()
    }

    /// Element at `(r, c)`, `None` out of range.
    pub fn get(&self, r: usize, c: usize) -> Option<f64> {
        self.0.get((r, c)).copied()
    }

    /// Copy of row `r`.
    pub fn row(&self, r: usize) -> NumericResult<Vector> {
        if r >= self.rows() {
            return Err(NumericError::RowOutOfRange {
                row: r,
                rows: self.rows(),
            });
        }
        Ok(Vector(self.0.row(r).transpose()))
    }

    /// Overwrites row `r` with `values`.
    pub fn set_row(&mut self, r: usize, values: &Vector) -> NumericResult<()> {
        if r >= self.rows() {
            return Err(NumericError::RowOutOfRange {
                row: r,
                rows: self.rows(),
            });
        }
        if values.len() != self.cols() {
            return Err(NumericError::ShapeMismatch {
                op: "set_row",
                left: self.shape(),
                right: (values.len(), 1),
            });
        }
        self.0.set_row(r, &values.0.transpose());
        Ok(())
    }

    /// `self − other`.
    pub fn sub(&self, other: &Matrix) -> NumericResult<Matrix> {
        if self.shape() != other.shape() {
            return Err(NumericError::ShapeMismatch {
                op: "sub",
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(Matrix(&self.0 - &other.0))
    }

    /// `self · v`.
    pub fn mul_vector(&self, v: &Vector) -> NumericResult<Vector> {
        if self.cols() != v.len() {
            return Err(NumericError::ShapeMismatch {
                op: "mul_vector",
                left: self.shape(),
                right: (v.len(), 1),
            });
        }
        Ok(Vector(&self.0 * &v.0))
    }

    /// `self · other`.
    pub fn mul(&self, other: &Matrix) -> NumericResult<Matrix> {
        if self.cols() != other.rows() {
            return Err(NumericError::ShapeMismatch {
                op: "mul",
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(Matrix(&self.0 * &other.0))
    }

    /// Frobenius norm.
    pub fn norm(&self) -> f64 {
        self.0.norm()
    }

    /// Rows as nested vectors.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.0
            .row_iter()
            .map(|row| row.iter().copied().collect())
            .collect()
    }

    /// True if every element is finite.
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl Vector {
    /// Zero-filled vector.
    pub fn zeros(len: usize) -> Self {
        Self(DVector::zeros(len))
    }

    /// Vector with every entry `value`.
    pub fn filled(len: usize, value: f64) -> Self {
        Self(DVector::from_element(len, value))
    }

    /// Wraps owned values.
    pub fn from_vec(values: Vec<f64>) -> Self {
        Self(DVector::from_vec(values))
    }

    /// Borrow the `nalgebra` vector.
    pub fn inner(&self) -> &DVector<f64> {
        &self.0
    }

    /// Length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Element `i`, `None` out of range.
    pub fn get(&self, i: usize) -> Option<f64> {
        self.0.get(i).copied()
    }

    /// Values as a slice.
    pub fn as_slice(&self) -> &[f64] {
        self.0.as_slice()
    }

    /// `self − other`.
    pub fn sub(&self, other: &Vector) -> NumericResult<Vector> {
        if self.len() != other.len() {
            return Err(NumericError::ShapeMismatch {
                op: "vector sub",
                left: (self.len(), 1),
                right: (other.len(), 1),
            });
        }
        Ok(Vector(&self.0 - &other.0))
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f64 {
        self.0.norm()
    }
}

/// Fixed-width dump used by the diagnostics report.
///
/// At most `max_rows` rows and `max_cols` columns are printed; elided parts
/// are marked with `...`.
pub fn format_matrix(name: &str, m: &Matrix, max_rows: usize, max_cols: usize) -> String {
    let mut out = format!("{} ({}x{})\n", name, m.rows(), m.cols());
    for r in 0..m.rows().min(max_rows) {
        let mut line = String::new();
        for c in 0..m.cols().min(max_cols) {
            line.push_str(&format!("{:>16.6}", m.0[(r, c)]));
        }
        if m.cols() > max_cols {
            line.push_str("  ...");
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    if m.rows() > max_rows {
        out.push_str("...\n");
    }
    out
}

/// Fixed-width dump of a vector, one value per line.
pub fn format_vector(name: &str, v: &Vector, max_rows: usize) -> String {
    let mut out = format!("{} ({})\n", name, v.len());
    for value in v.as_slice().iter().take(max_rows) {
        out.push_str(&format!("{:>16.6}\n", value));
    }
    if v.len() > max_rows {
        out.push_str("...\n");
    }
    out
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_matrix("matrix", self, usize::MAX, usize::MAX))
    }
}
