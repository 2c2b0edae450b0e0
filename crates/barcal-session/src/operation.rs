//! Operation kinds and the context handed to a running operation.
//!
//! Cancellation is cooperative: the session flips a `watch` flag and the
//! operation notices it at its next suspension point (a sleep or the gap
//! between two round trips). In-flight serial reads are never interrupted;
//! their timeouts bound how long an operation takes to unwind.

use crate::error::{SessionError, SessionResult};
use crate::events::{EventSink, SessionEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// What currently owns the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    /// Sampling one calibration step.
    CalibrationSampling,
    /// Flashing the calibration just computed.
    CalibrationFlash,
    /// Live weight test loop.
    Test,
    /// Flashing a previously saved calibrated descriptor.
    Flash,
}

impl OperationKind {
    /// Kinds during which status polling must be served from the cache.
    pub fn owns_sampling_snapshot(self) -> bool {
        matches!(
            self,
            OperationKind::CalibrationSampling | OperationKind::CalibrationFlash
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::CalibrationSampling => "calibrationSampling",
            OperationKind::CalibrationFlash => "calibrationFlash",
            OperationKind::Test => "test",
            OperationKind::Flash => "flash",
        };
        f.write_str(name)
    }
}

/// Handle used by the session to cancel an operation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Requests cancellation; idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Everything a running operation needs besides the bus.
#[derive(Debug, Clone)]
pub struct OperationContext {
    id: u64,
    kind: OperationKind,
    cancel_rx: watch::Receiver<bool>,
    events: EventSink,
}

impl OperationContext {
    /// Context plus the handle that cancels it.
    pub fn new(id: u64, kind: OperationKind, events: EventSink) -> (Self, CancelHandle) {
        let (tx, cancel_rx) = watch::channel(false);
        (
            Self {
                id,
                kind,
                cancel_rx,
                events,
            },
            CancelHandle { tx },
        )
    }

    /// Session-unique operation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Operation kind.
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Check if cancellation was requested.
    ///
    /// A dropped [`CancelHandle`] counts as cancellation.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow() || self.cancel_rx.has_changed().is_err()
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> SessionResult<()> {
        if self.is_cancelled() {
            Err(SessionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        // Err means the handle is gone, which also ends the operation
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleeps for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> SessionResult<()> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(SessionError::Cancelled),
        }
    }

    /// Publishes an event.
    pub fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }

    /// Publishes an error event for this operation.
    pub fn emit_error(&self, message: impl Into<String>, bar_index: Option<usize>) {
        self.emit(SessionEvent::Error {
            operation: self.kind,
            message: message.into(),
            bar_index,
        });
    }

    /// The sink events go to.
    pub fn events(&self) -> &EventSink {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (OperationContext, CancelHandle) {
        OperationContext::new(1, OperationKind::Test, EventSink::default())
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(OperationKind::CalibrationSampling.to_string(), "calibrationSampling");
        assert_eq!(
            serde_json::to_string(&OperationKind::CalibrationFlash).unwrap(),
            "\"calibrationFlash\""
        );
        assert!(OperationKind::CalibrationFlash.owns_sampling_snapshot());
        assert!(!OperationKind::Test.owns_sampling_snapshot());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_when_not_cancelled() {
        let (ctx, _handle) = ctx();
        assert!(ctx.sleep(Duration::from_millis(100)).await.is_ok());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let (ctx, handle) = ctx();
        let sleeper = ctx.clone();
        let task = tokio::spawn(async move { sleeper.sleep(Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        handle.cancel();
        assert!(matches!(task.await.unwrap(), Err(SessionError::Cancelled)));
        assert!(matches!(ctx.check(), Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_cancelled() {
        let (ctx, handle) = ctx();
        drop(handle);
        assert!(ctx.is_cancelled());
        ctx.cancelled().await;
    }
}
