//! Progress events streamed to observers.
//!
//! Events serialize as `{"type": "...", "data": {...}}` with camelCase names,
//! which is what the web front end consumes. Delivery is best effort: a slow
//! subscriber that falls behind the channel capacity skips events.

use crate::flash::FlashProgress;
use crate::operation::OperationKind;
use crate::sampler::{SampleSnapshot, ZerosProgress};
use crate::test_mode::{BarFactors, BarZeros, TestSnapshot};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default capacity of the event channel.
pub const EVENT_CAPACITY: usize = 1024;

/// Everything a running operation reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum SessionEvent {
    /// One sampler tick.
    Sample(SampleSnapshot),

    /// A calibration step finished sampling.
    #[serde(rename_all = "camelCase")]
    StepDone {
        /// Plan position.
        step_index: usize,
        /// Plan label (`[ZERO]`, `[0001]`, ...).
        label: String,
        /// Distinct steps sampled so far.
        received: usize,
        /// Steps in the plan.
        total: usize,
    },

    /// Every step of the plan has been sampled.
    SamplesDone,

    /// Zeros and factors were computed.
    #[serde(rename_all = "camelCase")]
    Computed {
        /// `‖check − W‖ / w`.
        error: f64,
        /// Number of factors.
        channels: usize,
    },

    /// Flash stage change.
    FlashProgress(FlashProgress),

    /// Factors read back from every bar before test mode.
    FactorsRead {
        /// Per-bar factors.
        bars: Vec<BarFactors>,
    },

    /// Zero collection progress.
    ZerosProgress(ZerosProgress),

    /// Zero collection finished.
    ZerosDone,

    /// Zeros now in use by the test loop.
    ZerosSummary {
        /// Per-bar zeros.
        zeros: Vec<BarZeros>,
    },

    /// One test-mode weight snapshot.
    Snapshot(TestSnapshot),

    /// An operation completed successfully.
    Done {
        /// Which operation.
        operation: OperationKind,
    },

    /// An operation (or one tick of the test loop) failed.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Which operation.
        operation: OperationKind,
        /// Failure text.
        message: String,
        /// Bar concerned, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        bar_index: Option<usize>,
    },

    /// An operation was cancelled or superseded.
    Stopped {
        /// Which operation.
        operation: OperationKind,
    },
}

/// Fan-out sender shared by the session and its operations.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventSink {
    /// Sink with room for `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes `event`; having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// New receiver that sees events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let event = SessionEvent::StepDone {
            step_index: 2,
            label: "[0002]".into(),
            received: 3,
            total: 7,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stepDone");
        assert_eq!(json["data"]["stepIndex"], 2);
        assert_eq!(json["data"]["label"], "[0002]");

        let json = serde_json::to_value(SessionEvent::Stopped {
            operation: OperationKind::Test,
        })
        .unwrap();
        assert_eq!(json["type"], "stopped");
        assert_eq!(json["data"]["operation"], "test");

        let json = serde_json::to_value(SessionEvent::SamplesDone).unwrap();
        assert_eq!(json["type"], "samplesDone");
    }

    #[test]
    fn test_error_omits_missing_bar() {
        let json = serde_json::to_value(SessionEvent::Error {
            operation: OperationKind::Flash,
            message: "boom".into(),
            bar_index: None,
        })
        .unwrap();
        assert!(json["data"].get("barIndex").is_none());
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let sink = EventSink::new(4);
        sink.emit(SessionEvent::ZerosDone);
        let mut rx = sink.subscribe();
        sink.emit(SessionEvent::SamplesDone);
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::SamplesDone);
    }
}
