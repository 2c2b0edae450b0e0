//! Session-level failures.
//!
//! Device and numeric errors are wrapped unchanged so callers can still tell a
//! timeout from a CRC mismatch; everything else describes why the session
//! refused or abandoned an operation.

use crate::operation::OperationKind;
use barcal_core::{BusError, ConfigError};
use barcal_numerics::NumericError;
use thiserror::Error;

/// Why a session call failed.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No bus is attached.
    #[error("not connected")]
    NotConnected,

    /// Another operation owns the link.
    #[error("busy: {0} in progress")]
    Busy(OperationKind),

    /// Step index outside the plan.
    #[error("invalid stepIndex {index} (plan has {steps} steps)")]
    InvalidStep {
        /// Requested index.
        index: usize,
        /// Plan length.
        steps: usize,
    },

    /// A weight step was requested before the zero step completed.
    #[error("zero step must be sampled first")]
    ZeroStepRequired,

    /// Compute requested before every step was sampled.
    #[error("samples not complete: {received}/{total}")]
    SamplesIncomplete {
        /// Distinct steps sampled so far.
        received: usize,
        /// Steps in the plan.
        total: usize,
    },

    /// Zero or weight matrices were never allocated.
    #[error("missing calibration matrices")]
    MissingMatrices,

    /// Flash or test requested for bars without calibration records.
    #[error("missing calibration factors")]
    MissingFactors,

    /// Test-mode control requested while no test loop runs.
    #[error("test mode not active")]
    TestInactive,

    /// The bus layout cannot produce a calibration plan.
    #[error("calibration needs at least 2 bars with active load cells (got {bars} bars, {channels} channels)")]
    InvalidPlan {
        /// Bars on the bus.
        bars: usize,
        /// Active channels per bar.
        channels: usize,
    },

    /// The descriptor being flashed does not match the attached bus.
    #[error("calibrated layout does not match the bus: {0}")]
    LayoutMismatch(String),

    /// Some bars never answered the per-bar update handshake.
    #[error("not all bars entered update mode: still missing {missing:?}")]
    UpdateModeIncomplete {
        /// Zero-based indices of the silent bars.
        missing: Vec<usize>,
    },

    /// Flash finished but some bars rejected their zeros or factors.
    #[error("flash incomplete: bars {failed:?} failed")]
    FlashIncomplete {
        /// Zero-based indices of the failed bars.
        failed: Vec<usize>,
    },

    /// Neither the configured port nor discovery found the bus.
    #[error("no serial port responded ({} attempts)", trace.len())]
    NoPortResponded {
        /// Discovery trace, one line per attempt.
        trace: Vec<String>,
    },

    /// The operation was stopped or superseded.
    #[error("operation cancelled")]
    Cancelled,

    /// Device round trip failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Factor solve failed.
    #[error(transparent)]
    Numeric(#[from] NumericError),

    /// Descriptor problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Calibrated artifact could not be encoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result alias for session calls.
pub type SessionResult<T> = std::result::Result<T, SessionError>;
