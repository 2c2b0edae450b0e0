//! Async serial port abstractions.
//!
//! The bar bus is a half-duplex RS-485 link, so everything above this module
//! treats the port as an exclusively owned byte stream. Real hardware comes
//! from `tokio-serial`; tests plug in `tokio::io::duplex` or the mock port from
//! `barcal-hardware`.
//!
//! # Types
//!
//! - [`SerialPortIO`]: trait alias combining AsyncRead + AsyncWrite
//! - [`DynSerial`]: type-erased boxed serial port
//!
//! # Utilities
//!
//! - [`open_serial_async`]: open a port with spawn_blocking (8N1, no flow control)
//! - [`drain_serial_buffer`]: discard stale bytes

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - the mock port in `barcal_hardware::drivers::mock_serial`
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// Settings are fixed by the bar firmware: 8 data bits, no parity, one stop
/// bit, no flow control.
///
/// # Errors
///
/// Returns [`BusError::Open`](crate::error::BusError::Open) if the port cannot
/// be opened or the blocking task panics.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> Result<DynSerial, crate::error::BusError> {
    use crate::error::BusError;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    let opened = spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| BusError::Open {
        port: port_path.to_string(),
        message: format!("spawn_blocking for serial port opening failed: {}", e),
    })?;

    match opened {
        Ok(stream) => Ok(Box::new(stream)),
        Err(e) => Err(BusError::Open {
            port: port_path.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until nothing arrives before `timeout_ms` elapses.
/// Used after a reboot or flash, when bootloader chatter may still be queued.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    timeout_ms: u64,
) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break, // quiet line
        }
    }

    if total_discarded > 0 {
        tracing::debug!(target: "barcal::serial", bytes = total_discarded, "drained stale bytes");
    }
    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_drain_serial_buffer() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale data 12345").await.unwrap();

        let discarded = drain_serial_buffer(&mut device, 50).await;
        assert_eq!(discarded, 16);

        let mut buf = [0u8; 1];
        let next = tokio::time::timeout(Duration::from_millis(10), device.read(&mut buf)).await;
        assert!(next.is_err(), "buffer should be empty");
    }

    #[tokio::test]
    async fn test_drain_on_quiet_line_returns_zero() {
        let (_host, mut device) = tokio::io::duplex(64);
        assert_eq!(drain_serial_buffer(&mut device, 20).await, 0);
    }
}
