//! `barcal-hardware`
//!
//! Everything that touches the bar bus: the frame codec, the request/response
//! transport, the [`BarBus`] driver, port enumeration with auto-detection and
//! the port cache.
//!
//! The driver never decides policy. Retries, update-mode sequencing and
//! averaging live in `barcal-session`; this crate performs single round trips
//! and reports exactly what came back.

pub mod discovery;
pub mod drivers;
pub mod port_cache;
pub mod protocol;
pub mod transport;

pub use discovery::{detect_port, list_ports, DetectOutcome, PortProber, VersionProbe};
pub use drivers::{version_warning, BarBus, BarVersion, BusTimings, SimulatedBus};
pub use port_cache::{config_key, PortCache};
pub use transport::Transport;

#[cfg(feature = "serial")]
pub use discovery::auto_detect;
