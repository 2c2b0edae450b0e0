//! Full calibration run against the simulated bus: sample every step,
//! compute, flash, then check weights in test mode.

use barcal_core::Parameters;
use barcal_hardware::{SimulatedBus, Transport};
use barcal_session::{DeviceSession, OperationKind, SessionEvent, TestConfig};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const WEIGHT: f64 = 1000.0;
const ZERO: [u64; 4] = [1000, 2000, 3000, 4000];
const FACTOR: [f64; 4] = [0.5, 0.25, 0.125, 1.0];

/// Load per channel for each placement row; rows 0..4 isolate one cell each.
const LOADS: [[f64; 4]; 6] = [
    [1000.0, 0.0, 0.0, 0.0],
    [0.0, 1000.0, 0.0, 0.0],
    [0.0, 0.0, 1000.0, 0.0],
    [0.0, 0.0, 0.0, 1000.0],
    [500.0, 500.0, 0.0, 0.0],
    [0.0, 0.0, 250.0, 750.0],
];

fn params() -> Parameters {
    Parameters::from_json(
        br#"{"SERIAL":{"PORT":"sim","BAUDRATE":115200,"COMMAND":"A"},
             "WEIGHT":1000,"AVG":4,"IGNORE":2,
             "BARS":[{"ID":1,"LCS":3},{"ID":2,"LCS":3}]}"#,
    )
    .unwrap()
}

fn readings(loads: &[f64; 4]) -> Vec<u64> {
    (0..4)
        .map(|c| ZERO[c] + (loads[c] / FACTOR[c]) as u64)
        .collect()
}

fn apply(sim: &SimulatedBus, values: &[u64]) {
    sim.set_readings(0, values[..2].to_vec());
    sim.set_readings(1, values[2..].to_vec());
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(120), async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event did not arrive")
}

async fn calibrated_session() -> (DeviceSession, SimulatedBus) {
    let p = params();
    let (port, sim) = SimulatedBus::spawn(&p);
    let session = DeviceSession::default();
    session.attach(p, Transport::new(port, "sim")).await.unwrap();

    let plan = session.plan().unwrap();
    assert_eq!(plan.len(), 1 + 3 * 2);
    let mut rx = session.subscribe();
    for step in &plan.steps {
        match step.row {
            None => apply(&sim, &ZERO),
            Some(row) => apply(&sim, &readings(&LOADS[row])),
        }
        session.start_step(step.step_index).await.unwrap();
        session.wait_idle().await;
    }
    wait_for(&mut rx, |e| matches!(e, SessionEvent::SamplesDone)).await;
    (session, sim)
}

#[tokio::test(start_paused = true)]
async fn calibrate_compute_flash_and_test() {
    let (session, sim) = calibrated_session().await;

    let report = session.compute().unwrap();
    assert!(report.error < 1e-6, "error {}", report.error);
    assert_eq!(report.zeros, ZERO.to_vec());
    for (got, want) in report.factors.iter().zip(FACTOR) {
        assert!((f64::from(*got) - want).abs() < 1e-5, "{} vs {}", got, want);
    }
    let p = session.parameters().unwrap();
    assert_eq!(p.bars[1].lc[0].ieee, "3E000000");
    let artifact: serde_json::Value = serde_json::from_str(&session.calibrated_json().unwrap()).unwrap();
    assert_eq!(artifact["BARS"][0]["LC"][1]["ZERO"], 2000);

    // flash what was computed
    let mut rx = session.subscribe();
    session.flash_calibration().await.unwrap();
    session.wait_idle().await;
    let done = wait_for(&mut rx, |e| {
        matches!(e, SessionEvent::Done { .. } | SessionEvent::Error { .. })
    })
    .await;
    assert_eq!(
        done,
        SessionEvent::Done {
            operation: OperationKind::CalibrationFlash
        }
    );
    let bars = sim.bars();
    assert_eq!(bars[0].factors, vec![0.5, 0.25]);
    assert_eq!(bars[1].zeros, vec![3000, 4000]);
    assert!(bars.iter().all(|b| !b.in_update));

    // test mode: empty shelf first, then 100 on the first cell
    apply(&sim, &ZERO);
    let mut rx = session.subscribe();
    session
        .start_test(Some(TestConfig {
            debug: true,
            tick_ms: 20,
            ad_timeout_ms: 0,
        }))
        .await
        .unwrap();
    match wait_for(&mut rx, |e| matches!(e, SessionEvent::ZerosSummary { .. })).await {
        SessionEvent::ZerosSummary { zeros } => assert_eq!(zeros[1].zeros, vec![3000, 4000]),
        other => panic!("unexpected {:?}", other),
    }
    apply(&sim, &readings(&[100.0, 0.0, 0.0, 0.0]));
    let snap = wait_for(&mut rx, |e| {
        matches!(e, SessionEvent::Snapshot(s) if s.grand_total != 0.0)
    })
    .await;
    match snap {
        SessionEvent::Snapshot(s) => {
            assert!((s.grand_total - 100.0).abs() < 1e-3);
            assert_eq!(s.debug.as_ref().map(|d| d.tick_ms), Some(20));
        }
        other => panic!("unexpected {:?}", other),
    }

    // rezero with the weight still on: weights go back to zero
    session.rezero().unwrap();
    wait_for(&mut rx, |e| matches!(e, SessionEvent::ZerosDone)).await;
    wait_for(&mut rx, |e| {
        matches!(e, SessionEvent::Snapshot(s) if s.grand_total == 0.0)
    })
    .await;

    assert_eq!(session.stop().await, Some(OperationKind::Test));
    wait_for(&mut rx, |e| {
        *e == SessionEvent::Stopped {
            operation: OperationKind::Test,
        }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn flash_reports_failed_bar_and_keeps_artifact() {
    let (session, sim) = calibrated_session().await;
    session.compute().unwrap();
    sim.with_bar(1, |b| b.nack_writes = 10);

    let mut rx = session.subscribe();
    session.flash_calibration().await.unwrap();
    let event = wait_for(&mut rx, |e| {
        matches!(e, SessionEvent::Done { .. } | SessionEvent::Error { bar_index: None, .. })
    })
    .await;
    match event {
        SessionEvent::Error { operation, message, .. } => {
            assert_eq!(operation, OperationKind::CalibrationFlash);
            assert!(message.contains("[1]"), "{}", message);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(sim.bars()[0].factors, vec![0.5, 0.25]);
    // the computed calibration is still there for another attempt
    assert!(session.parameters().unwrap().has_factors());
}
