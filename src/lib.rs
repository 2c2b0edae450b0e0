//! # barcal
//!
//! Calibration of load-cell bars on a shared RS-485 bus: framed serial
//! protocol, bar driver with port discovery, SVD factor solve, and a session
//! coordinator that samples, computes, flashes and checks weights.
//!
//! ## Crate Structure
//!
//! - **`core`** ([`barcal_core`]): descriptor model, error taxonomy, serial plumbing, retry policy.
//! - **`hardware`** ([`barcal_hardware`]): frame codec, transport, bar driver, discovery, port cache, simulator.
//! - **`numerics`** ([`barcal_numerics`]): matrices, pseudoinverse, zero/factor solve.
//! - **`session`** ([`barcal_session`]): plan, sampler, flash, test loop, [`DeviceSession`].
//! - **`config`**: layered application settings for the binary.
//! - **`logging`**: tracing subscriber setup.

pub mod config;
pub mod logging;

pub use barcal_core as core;
pub use barcal_hardware as hardware;
pub use barcal_numerics as numerics;
pub use barcal_session as session;

pub use barcal_core::{Bar, LoadCell, Parameters};
pub use barcal_session::{DeviceSession, SessionError, SessionEvent};
