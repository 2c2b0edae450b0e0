//! Error taxonomy for the bar bus.
//!
//! Errors are grouped the way the field failures group:
//!
//! - **`FrameError`**: a reply arrived but is not a valid frame (short reply,
//!   wrong address, missing terminator, CRC mismatch, undersized binary payload).
//!   Treated as a corrupted exchange; callers retry a bounded number of times.
//! - **`BusError`**: everything that can go wrong on one round trip, including
//!   transport failures (open, I/O, timeout) and device-state failures (write not
//!   acknowledged, update-mode handshake rejected). Always recoverable by the caller.
//! - **`ConfigError`**: problems discovered before any device I/O (missing
//!   `SERIAL` section, no bars, inconsistent channel counts). These are the only
//!   errors a front end should treat as fatal for the process.
//!
//! Every error that describes a bad reply carries `raw_hex`, a space-separated
//! uppercase hex dump of the bytes actually received, so operators can paste it
//! into a bug report.

use thiserror::Error;

/// Formats bytes as `"0A 1B FF"` for diagnostics.
pub fn hex_dump(raw: &[u8]) -> String {
    raw.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Frame Errors
// =============================================================================

/// A reply that failed frame validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the smallest valid frame.
    #[error("short response: {len} bytes")]
    ShortReply {
        /// Number of bytes received.
        len: usize,
    },

    /// The first two bytes do not echo the command address (or the `|` separator is missing).
    #[error("wrong ID or missing pipe; raw_len={len} raw_hex={raw_hex}")]
    AddressMismatch {
        /// Number of bytes received.
        len: usize,
        /// Hex dump of the reply.
        raw_hex: String,
    },

    /// Neither `\r\n` nor `\n` found, or it sits where no CRC can precede it.
    #[error("no line terminator in response; len={len}")]
    MissingTerminator {
        /// Number of bytes received.
        len: usize,
    },

    /// The two bytes before the terminator are not the CRC of everything before them.
    #[error("CRC mismatch: expected={expected:04X} got={received:04X} raw_hex={raw_hex}")]
    CrcMismatch {
        /// CRC computed over the received bytes.
        expected: u16,
        /// CRC found in the reply.
        received: u16,
        /// Hex dump of the reply.
        raw_hex: String,
    },

    /// Binary payload shorter than `4 * (1 + channels)` bytes.
    #[error("payload too short: got {got}, want {want}")]
    PayloadTooShort {
        /// Payload length received.
        got: usize,
        /// Minimum payload length.
        want: usize,
    },
}

// =============================================================================
// Bus Errors
// =============================================================================

/// Failure of a single device round trip or of a device-state transition.
#[derive(Error, Debug)]
pub enum BusError {
    /// The serial port could not be opened.
    #[error("failed to open serial port {port}: {message}")]
    Open {
        /// Port name that was tried.
        port: String,
        /// Underlying error text.
        message: String,
    },

    /// Read or write on an open port failed.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No line terminator before the deadline; whatever arrived is dumped.
    #[error("read timeout; got {len} bytes; raw_hex={raw_hex}")]
    Timeout {
        /// Bytes received before the deadline.
        len: usize,
        /// Hex dump of the partial reply.
        raw_hex: String,
    },

    /// The device answered with nothing usable.
    #[error("empty response")]
    EmptyReply,

    /// Frame validation failed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A write command was not answered with `OK`.
    #[error("bar {bar}: {command} not acknowledged: {reply:?}")]
    NotAcknowledged {
        /// Zero-based bar index.
        bar: usize,
        /// Command label (`zeros`, `factors`, `reboot`).
        command: &'static str,
        /// Raw reply text, trimmed.
        reply: String,
    },

    /// The update-mode handshake was not answered with `Enter`.
    #[error("no enter: raw_len={len} raw_hex={raw_hex} raw_str={text:?}")]
    HandshakeRejected {
        /// Bytes received.
        len: usize,
        /// Hex dump of the reply.
        raw_hex: String,
        /// Reply as (lossy) text, trimmed.
        text: String,
    },

    /// `V` reply did not contain a parseable `Version X.Y.Z`.
    #[error("invalid version reply: {0:?}")]
    InvalidVersion(String),

    /// Bar index outside the configured bar list.
    #[error("bar index {index} out of range ({bars} bars)")]
    BarIndex {
        /// Requested index.
        index: usize,
        /// Number of configured bars.
        bars: usize,
    },

    /// The descriptor cannot drive a bus (caught before any I/O).
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BusError {
    /// True for transport-level failures where trying another port makes sense.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BusError::Open { .. } | BusError::Io(_) | BusError::Timeout { .. }
        )
    }
}

// =============================================================================
// Configuration Errors
// =============================================================================

/// Configuration problems detected before touching the device.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// `SERIAL` section absent.
    #[error("missing SERIAL section")]
    MissingSerial,

    /// `SERIAL.PORT` empty where a port is required.
    #[error("missing SERIAL.PORT")]
    MissingPort,

    /// `BARS` empty.
    #[error("no BARS configured")]
    NoBars,

    /// A bar has no active load cells or uses bits above the 4 supported slots.
    #[error("bar {bar}: invalid LCS bitmask {lcs:#04x}")]
    InvalidLcsMask {
        /// Zero-based bar index.
        bar: usize,
        /// The offending mask.
        lcs: u8,
    },

    /// Bars disagree on the number of active load cells.
    #[error("number of active load cells per bar must match: bar {bar} has {got}, expected {expected}")]
    ChannelCountMismatch {
        /// Zero-based bar index.
        bar: usize,
        /// Channel count of bar 0.
        expected: usize,
        /// Channel count of this bar.
        got: usize,
    },

    /// The descriptor JSON could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing a configuration file failed.
    #[error("config file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Layered application settings could not be extracted.
    #[error("settings error: {0}")]
    Settings(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Settings(Box::new(err))
    }
}

/// Result alias for bus round trips.
pub type BusResult<T> = std::result::Result<T, BusError>;
