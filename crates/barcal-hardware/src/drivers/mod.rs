// Bar bus driver over a framed RS-485 link
pub mod bar_bus;

// Scripted port for byte-exact driver tests
pub mod mock_serial;

// Firmware stand-in answering framed commands
pub mod simulated;

pub use bar_bus::{version_warning, BarBus, BarVersion, BusTimings};
pub use simulated::{SimBar, SimulatedBus};
