//! `barcal-core`
//!
//! Shared building blocks for the load-cell bar calibration stack: the device
//! descriptor model, the error taxonomy, async serial port plumbing and the
//! retry policy used by device round trips.
//!
//! ## Key Types
//!
//! - [`Parameters`]: device/session descriptor (`config.json`)
//! - [`Bar`] / [`LoadCell`]: bus topology and per-channel calibration
//! - [`BusError`] / [`FrameError`] / [`ConfigError`]: typed failures
//! - [`serial::DynSerial`]: type-erased async serial port

pub mod error;
pub mod error_recovery;
pub mod parameters;
pub mod serial;

pub use error::{hex_dump, BusError, BusResult, ConfigError, FrameError};
pub use error_recovery::RetryPolicy;
pub use parameters::{
    active_channels, Bar, FirmwareVersion, LoadCell, Parameters, SerialSettings, DEFAULT_AVG,
    DEFAULT_IGNORE, MAX_LOAD_CELLS,
};
