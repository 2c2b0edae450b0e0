//! Scripted serial port for driver tests.
//!
//! [`MockSerialPort`] goes to the code under test (it is `AsyncRead +
//! AsyncWrite`); [`BusScript`] stays in the test and plays the bars: it
//! asserts on the exact frames written and pushes replies back.
//!
//! Two unbounded channels carry the bytes, one per direction. Dropping the
//! script makes the port read EOF and fail writes with `BrokenPipe`.
//!
//! ```rust,ignore
//! let (port, mut bus) = mock_serial::new();
//! let link = Transport::new(Box::new(port), "mock");
//! // ... start the driver call in a task ...
//! bus.expect_frame(1, b"V").await;
//! bus.reply(1, b"Version 3.1.7");
//! ```

use crate::protocol;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How long a script waits for the driver to write before failing the test.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Port half handed to the driver.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

/// Test half that plays the bars.
#[derive(Debug)]
pub struct BusScript {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    written: Vec<u8>,
}

/// Creates a connected port/script pair.
pub fn new() -> (MockSerialPort, BusScript) {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let (reads_tx, reads_rx) = mpsc::unbounded_channel();
    (
        MockSerialPort {
            writes_tx,
            reads_rx,
            pending: VecDeque::new(),
        },
        BusScript {
            writes_rx,
            reads_tx,
            written: Vec::new(),
        },
    )
}

// =============================================================================
// Port side
// =============================================================================

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.pending.len());
        let chunk: Vec<u8> = self.pending.drain(..n).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.pending.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }
        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.pending.extend(chunk);
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            // script dropped: EOF
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock bus script disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// Script side
// =============================================================================

impl BusScript {
    /// Pushes raw bytes to the port.
    ///
    /// # Errors
    /// Fails if the port half has been dropped.
    pub fn send_raw(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "mock port disconnected")
    }

    /// Sends a well-formed ASCII reply from bar `id`.
    ///
    /// # Panics
    /// Panics if the port half has been dropped.
    pub fn reply(&self, id: u8, payload: &[u8]) {
        #[allow(clippy::expect_used)]
        self.send_raw(&protocol::build_reply(id, payload))
            .expect("reply after port dropped");
    }

    /// Waits for exactly `expected` to be written.
    ///
    /// # Panics
    /// Panics on mismatch or if nothing arrives within the expect timeout.
    #[allow(clippy::panic)]
    pub async fn expect_write(&mut self, expected: &[u8]) {
        while self.written.len() < expected.len() {
            match tokio::time::timeout(EXPECT_TIMEOUT, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.written.extend_from_slice(&chunk),
                Ok(None) => panic!("port closed while expecting {:?}", String::from_utf8_lossy(expected)),
                Err(_) => panic!(
                    "timeout waiting for write: expected {:?}, got {:?}",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.written)
                ),
            }
        }
        let actual: Vec<u8> = self.written.drain(..expected.len()).collect();
        assert_eq!(
            actual,
            expected,
            "unexpected write: expected {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&actual)
        );
    }

    /// Waits for the framed command `payload` addressed to bar `id`.
    pub async fn expect_frame(&mut self, id: u8, payload: &[u8]) {
        self.expect_write(&protocol::build_command(id, payload)).await;
    }

    /// Expects a framed command and answers it with an ASCII reply.
    pub async fn expect_and_reply(&mut self, id: u8, payload: &[u8], reply: &[u8]) {
        self.expect_frame(id, payload).await;
        self.reply(id, reply);
    }

    /// Discards everything written so far (waits briefly for stragglers).
    pub async fn drain_writes(&mut self) {
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_millis(50), self.writes_rx.recv()).await
        {
            self.written.extend_from_slice(&chunk);
        }
        self.written.clear();
    }
}
