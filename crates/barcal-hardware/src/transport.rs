//! Request/response plumbing over an exclusively owned serial port.
//!
//! The bus is half duplex and the bars answer only when addressed, so a round
//! trip is: write the frame, give the bar half the timeout to start talking,
//! then collect bytes until the reply is complete or the timeout elapses.

use barcal_core::serial::{drain_serial_buffer, DynSerial};
use barcal_core::{hex_dump, BusError, BusResult};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

/// Poll interval while the port has nothing to read.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// A serial link with deadline-bounded reads.
pub struct Transport {
    port: DynSerial,
    name: String,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("name", &self.name).finish()
    }
}

impl Transport {
    /// Wraps an already opened port.
    pub fn new(port: DynSerial, name: impl Into<String>) -> Self {
        Self {
            port,
            name: name.into(),
        }
    }

    /// Opens `path` at `baud` (8N1, no flow control).
    #[cfg(feature = "serial")]
    pub async fn open(path: &str, baud: u32) -> BusResult<Self> {
        let port = barcal_core::serial::open_serial_async(path, baud).await?;
        Ok(Self::new(port, path))
    }

    /// OS name of the port (or the label given to a test port).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes and flushes `bytes`.
    pub async fn write(&mut self, bytes: &[u8]) -> BusResult<()> {
        self.port.write_all(bytes).await?;
        self.port.flush().await?;
        Ok(())
    }

    /// Reads until `complete` accepts the buffer or `timeout` elapses.
    ///
    /// On timeout the partial reply is reported as [`BusError::Timeout`].
    pub async fn read_until<P>(&mut self, timeout: Duration, complete: P) -> BusResult<Vec<u8>>
    where
        P: Fn(&[u8]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut buf = Vec::with_capacity(64);
        let mut chunk = [0u8; 256];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.port.read(&mut chunk)).await {
                Ok(Ok(0)) => tokio::time::sleep(IDLE_POLL.min(remaining)).await,
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if complete(&buf) {
                        return Ok(buf);
                    }
                }
                Ok(Err(e)) => return Err(BusError::Io(e)),
                Err(_) => break,
            }
        }
        Err(BusError::Timeout {
            len: buf.len(),
            raw_hex: hex_dump(&buf),
        })
    }

    /// One round trip: write, settle for `timeout / 2`, then read until `complete`.
    pub async fn exchange<P>(
        &mut self,
        frame: &[u8],
        timeout: Duration,
        complete: P,
    ) -> BusResult<Vec<u8>>
    where
        P: Fn(&[u8]) -> bool,
    {
        self.write(frame).await?;
        tokio::time::sleep(timeout / 2).await;
        self.read_until(timeout, complete).await
    }

    /// Round trip for line-terminated replies.
    pub async fn send_command(&mut self, frame: &[u8], timeout: Duration) -> BusResult<Vec<u8>> {
        self.exchange(frame, timeout, crate::protocol::has_line_end)
            .await
    }

    /// Discards whatever arrives within `timeout`.
    pub async fn drain(&mut self, timeout: Duration) -> usize {
        drain_serial_buffer(&mut self.port, timeout.as_millis() as u64).await
    }

    /// Shuts the port down; errors are logged, not returned.
    pub async fn close(&mut self) {
        if let Err(e) = self.port.shutdown().await {
            tracing::debug!(target: "barcal::transport", port = %self.name, "shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_serial;

    #[tokio::test(start_paused = true)]
    async fn test_send_command_collects_line() {
        let (port, mut script) = mock_serial::new();
        let mut link = Transport::new(Box::new(port), "mock");

        let device = tokio::spawn(async move {
            script.expect_write(b"01V\r").await;
            script.send_raw(b"01|Ver").unwrap();
            script.send_raw(b"sion\r\n").unwrap();
            script
        });

        let reply = link
            .send_command(b"01V\r", Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(reply, b"01|Version\r\n");
        device.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_partial_bytes() {
        let (port, script) = mock_serial::new();
        let mut link = Transport::new(Box::new(port), "mock");
        script.send_raw(b"01|12").unwrap();

        let err = link
            .read_until(Duration::from_millis(100), crate::protocol::has_line_end)
            .await
            .unwrap_err();
        match err {
            BusError::Timeout { len, raw_hex } => {
                assert_eq!(len, 5);
                assert_eq!(raw_hex, "30 31 7C 31 32");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        drop(script);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_peer_times_out() {
        let (port, script) = mock_serial::new();
        drop(script);
        let mut link = Transport::new(Box::new(port), "mock");
        let err = link
            .read_until(Duration::from_millis(50), |_| true)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { len: 0, .. }));
    }
}
