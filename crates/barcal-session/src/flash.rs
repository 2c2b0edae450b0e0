//! Writing zeros and factors into the bars.
//!
//! ```text
//! enter_update ─▶ per-bar handshake ─▶ prime ─▶ [ zeros ─▶ factors ─▶ reboot ] × bars ─▶ done
//! ```
//!
//! The bus-wide handshake is retried once after rebooting every bar. Writes
//! are retried per bar; a bar that still refuses is reported with an `error`
//! stage, rebooted anyway, and the run moves on to the next bar.

use crate::error::{SessionError, SessionResult};
use crate::events::SessionEvent;
use crate::operation::OperationContext;
use barcal_core::{Parameters, RetryPolicy};
use barcal_hardware::{protocol, BarBus};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Stage names consumed by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashStage {
    /// Update-mode handshake.
    EnterUpdate,
    /// Writing zeros.
    Zeros,
    /// Writing factors.
    Factors,
    /// Rebooting the bar.
    Reboot,
    /// Every bar flashed.
    Done,
    /// A bar could not be flashed.
    Error,
}

/// One flash progress report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashProgress {
    /// Stage.
    pub stage: FlashStage,
    /// Bar concerned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bar_index: Option<usize>,
    /// Human-readable text.
    pub message: String,
}

/// Retry and pacing knobs for a flash run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashPolicy {
    /// Attempts per zero/factor write.
    pub write_attempts: u32,
    /// Delay between write attempts.
    pub write_retry_ms: u64,
    /// Rounds of the per-bar handshake.
    pub handshake_attempts: u32,
    /// Delay between handshake rounds.
    pub handshake_gap_ms: u64,
    /// Gap between reboots when recovering from a refused handshake.
    pub reboot_gap_ms: u64,
    /// Wait after those reboots before the second handshake.
    pub recover_wait_ms: u64,
}

impl Default for FlashPolicy {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            write_retry_ms: 200,
            handshake_attempts: 6,
            handshake_gap_ms: 500,
            reboot_gap_ms: 100,
            recover_wait_ms: 1500,
        }
    }
}

impl FlashPolicy {
    /// Retry policy for one write.
    pub fn write_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.write_attempts, Duration::from_millis(self.write_retry_ms))
    }
}

fn progress(ctx: &OperationContext, stage: FlashStage, bar_index: Option<usize>, message: impl Into<String>) {
    ctx.emit(SessionEvent::FlashProgress(FlashProgress {
        stage,
        bar_index,
        message: message.into(),
    }));
}

/// Checks that `params` carries a full calibration for the bars on `bus`.
pub fn check_layout(bus: &BarBus, params: &Parameters) -> SessionResult<()> {
    if !params.has_factors() {
        return Err(SessionError::MissingFactors);
    }
    if params.bars.len() != bus.bar_count() {
        return Err(SessionError::LayoutMismatch(format!(
            "{} bars in the calibration, {} on the bus",
            params.bars.len(),
            bus.bar_count()
        )));
    }
    for (index, (bar, live)) in params.bars.iter().zip(bus.bars()).enumerate() {
        if bar.id != live.id || bar.lcs != live.lcs {
            return Err(SessionError::LayoutMismatch(format!(
                "bar {}: calibration has ID {} LCS {}, bus has ID {} LCS {}",
                index, bar.id, bar.lcs, live.id, live.lcs
            )));
        }
        if bar.lc.len() != bar.channels() {
            return Err(SessionError::LayoutMismatch(format!(
                "bar {}: {} load cells for {} active channels",
                index,
                bar.lc.len(),
                bar.channels()
            )));
        }
    }
    Ok(())
}

/// Puts every bar into update mode.
async fn enter_update(bus: &BarBus, policy: &FlashPolicy, ctx: &OperationContext) -> SessionResult<()> {
    if let Err(e) = bus.enter_update_mode().await {
        warn!(target: "barcal::flash", "update handshake refused, rebooting bars: {}", e);
        bus.reboot_all(Duration::from_millis(policy.reboot_gap_ms)).await;
        ctx.sleep(Duration::from_millis(policy.recover_wait_ms)).await?;
        bus.enter_update_mode().await?;
    }

    // late bars: repeat the handshake addressed to each one
    let mut missing: Vec<usize> = (0..bus.bar_count()).collect();
    for attempt in 1..=policy.handshake_attempts.max(1) {
        ctx.check()?;
        let mut remaining = Vec::new();
        for &index in &missing {
            if bus.enter_update_mode_bar(index).await.is_err() {
                remaining.push(index);
            }
        }
        missing = remaining;
        if missing.is_empty() {
            break;
        }
        if attempt < policy.handshake_attempts {
            ctx.sleep(Duration::from_millis(policy.handshake_gap_ms)).await?;
        }
    }
    if !missing.is_empty() {
        return Err(SessionError::UpdateModeIncomplete { missing });
    }

    bus.prime_bootloaders().await?;
    Ok(())
}

/// Flashes the calibration records of `params` into the bars of `bus`.
///
/// # Errors
/// Layout problems before any write, a refused update handshake,
/// cancellation, or [`SessionError::FlashIncomplete`] listing the bars whose
/// writes were never acknowledged.
#[instrument(skip_all, fields(bars = params.bars.len()), err)]
pub async fn flash_parameters(
    bus: &BarBus,
    params: &Parameters,
    policy: &FlashPolicy,
    ctx: &OperationContext,
) -> SessionResult<()> {
    check_layout(bus, params)?;

    progress(ctx, FlashStage::EnterUpdate, None, "Entering update mode...");
    enter_update(bus, policy, ctx).await?;

    let retry = policy.write_retry();
    let mut failed = Vec::new();
    for (index, bar) in params.bars.iter().enumerate() {
        ctx.check()?;
        let zeros: Vec<f64> = bar.lc.iter().map(|lc| lc.zero as f64).collect();
        let factors: Vec<f64> = bar.lc.iter().map(|lc| lc.factor as f64).collect();
        let total = protocol::zero_total(&zeros, &factors);

        progress(ctx, FlashStage::Zeros, Some(index), "Flashing zeros...");
        let written = retry
            .run("write zeros", |_| bus.write_zeros(index, &zeros, total))
            .await;
        let written = match written {
            Ok(()) => {
                progress(ctx, FlashStage::Factors, Some(index), "Flashing factors...");
                retry
                    .run("write factors", |_| bus.write_factors(index, &factors))
                    .await
                    .map_err(|e| ("factors", e))
            }
            Err(e) => Err(("zeros", e)),
        };
        if let Err((what, e)) = written {
            warn!(target: "barcal::flash", bar = index, "cannot flash {}: {}", what, e);
            progress(
                ctx,
                FlashStage::Error,
                Some(index),
                format!("bar {}: cannot flash {}: {}", index + 1, what, e),
            );
            failed.push(index);
        }

        progress(ctx, FlashStage::Reboot, Some(index), "Rebooting...");
        if let Err(e) = bus.reboot(index).await {
            warn!(target: "barcal::flash", bar = index, "reboot not confirmed: {}", e);
        }
    }

    if !failed.is_empty() {
        return Err(SessionError::FlashIncomplete { failed });
    }
    progress(ctx, FlashStage::Done, None, "Flashing complete");
    info!(target: "barcal::flash", bars = params.bars.len(), "flash complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSink;
    use crate::operation::{CancelHandle, OperationKind};
    use barcal_core::LoadCell;
    use barcal_hardware::{BusTimings, SimulatedBus, Transport};
    use barcal_numerics::ieee754;

    fn calibrated() -> Parameters {
        let mut p = Parameters::from_json(
            br#"{"SERIAL":{"PORT":"sim","BAUDRATE":115200,"COMMAND":"A"},
                 "AVG":4,"BARS":[{"ID":1,"LCS":3},{"ID":2,"LCS":5}]}"#,
        )
        .unwrap();
        for (b, bar) in p.bars.iter_mut().enumerate() {
            bar.lc = (0..2)
                .map(|c| {
                    let factor = 0.01 * (b * 2 + c + 1) as f32;
                    LoadCell {
                        zero: 1_000_000 + (b * 10 + c) as u64,
                        factor,
                        ieee: ieee754::to_hex(factor),
                    }
                })
                .collect();
        }
        p
    }

    fn setup(p: &Parameters) -> (BarBus, SimulatedBus) {
        let (port, sim) = SimulatedBus::spawn(p);
        let bus = BarBus::new(Transport::new(port, "sim"), p, BusTimings::default()).unwrap();
        (bus, sim)
    }

    fn ctx() -> (OperationContext, CancelHandle, tokio::sync::broadcast::Receiver<SessionEvent>) {
        let sink = EventSink::default();
        let rx = sink.subscribe();
        let (ctx, handle) = OperationContext::new(1, OperationKind::Flash, sink);
        (ctx, handle, rx)
    }

    fn stages(rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<(FlashStage, Option<usize>)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::FlashProgress(p) = event {
                out.push((p.stage, p.bar_index));
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_flash_writes_every_bar() {
        let p = calibrated();
        let (bus, sim) = setup(&p);
        let (ctx, _h, mut rx) = ctx();
        flash_parameters(&bus, &p, &FlashPolicy::default(), &ctx)
            .await
            .unwrap();

        let bars = sim.bars();
        assert_eq!(bars[0].zeros, vec![1_000_000, 1_000_001]);
        assert_eq!(bars[1].zeros, vec![1_000_010, 1_000_011]);
        assert!((bars[1].factors[1] - 0.04).abs() < 1e-7);
        assert!(bars.iter().all(|b| !b.in_update), "rebooted");

        use FlashStage::*;
        assert_eq!(
            stages(&mut rx),
            vec![
                (EnterUpdate, None),
                (Zeros, Some(0)),
                (Factors, Some(0)),
                (Reboot, Some(0)),
                (Zeros, Some(1)),
                (Factors, Some(1)),
                (Reboot, Some(1)),
                (Done, None),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_bar_does_not_stop_the_run() {
        let p = calibrated();
        let (bus, sim) = setup(&p);
        sim.with_bar(0, |b| b.nack_writes = 3);
        let (ctx, _h, mut rx) = ctx();
        let result = flash_parameters(&bus, &p, &FlashPolicy::default(), &ctx).await;
        match result {
            Err(SessionError::FlashIncomplete { failed }) => assert_eq!(failed, vec![0]),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(sim.bars()[1].zeros, vec![1_000_010, 1_000_011]);
        let seen = stages(&mut rx);
        assert!(seen.contains(&(FlashStage::Error, Some(0))));
        assert!(seen.contains(&(FlashStage::Reboot, Some(0))));
        assert!(!seen.contains(&(FlashStage::Done, None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_retry_recovers() {
        let p = calibrated();
        let (bus, sim) = setup(&p);
        sim.with_bar(1, |b| b.nack_writes = 2);
        let (ctx, _h, _rx) = ctx();
        flash_parameters(&bus, &p, &FlashPolicy::default(), &ctx)
            .await
            .unwrap();
        assert_eq!(sim.bars()[1].zeros, vec![1_000_010, 1_000_011]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_bar_gets_per_bar_handshake() {
        let p = calibrated();
        let (bus, sim) = setup(&p);
        sim.with_bar(1, |b| b.ignore_handshakes = 2);
        let (ctx, _h, _rx) = ctx();
        flash_parameters(&bus, &p, &FlashPolicy::default(), &ctx)
            .await
            .unwrap();
        let euler = sim.commands().iter().filter(|c| c.as_str() == "02EULER").count();
        assert_eq!(euler, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_bar_blocks_update_mode() {
        let p = calibrated();
        let (bus, sim) = setup(&p);
        sim.with_bar(1, |b| b.ignore_handshakes = 100);
        let (ctx, _h, _rx) = ctx();
        let policy = FlashPolicy {
            handshake_attempts: 2,
            ..FlashPolicy::default()
        };
        match flash_parameters(&bus, &p, &policy, &ctx).await {
            Err(SessionError::UpdateModeIncomplete { missing }) => assert_eq!(missing, vec![1]),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(sim.bars()[0].zeros.iter().all(|z| *z == 0), "nothing written");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_handshake_reboots_and_retries() {
        let p = calibrated();
        let (bus, sim) = setup(&p);
        // nobody answers the bus-wide handshake until the bars come back
        sim.with_bar(0, |b| b.silent = true);
        sim.with_bar(1, |b| b.silent = true);
        let (ctx, _h, _rx) = ctx();
        let policy = FlashPolicy::default();
        let flashing = flash_parameters(&bus, &p, &policy, &ctx);
        let (result, _) = tokio::join!(flashing, async {
            // after the first handshake was swallowed, before its timeout
            tokio::time::sleep(Duration::from_millis(1200)).await;
            sim.with_bar(0, |b| b.silent = false);
            sim.with_bar(1, |b| b.silent = false);
        });
        result.unwrap();
        let euler = sim.commands().iter().filter(|c| c.as_str() == "*EULER").count();
        assert_eq!(euler, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_factors_rejected_before_io() {
        let mut p = calibrated();
        p.bars[1].lc.clear();
        let (bus, sim) = setup(&p);
        let (ctx, _h, _rx) = ctx();
        assert!(matches!(
            flash_parameters(&bus, &p, &FlashPolicy::default(), &ctx).await,
            Err(SessionError::MissingFactors)
        ));
        assert!(sim.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_layout_mismatch_rejected() {
        let p = calibrated();
        let (bus, _sim) = setup(&p);
        let mut other = p.clone();
        other.bars[0].id = 7;
        let (ctx, _h, _rx) = ctx();
        assert!(matches!(
            flash_parameters(&bus, &other, &FlashPolicy::default(), &ctx).await,
            Err(SessionError::LayoutMismatch(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_between_bars() {
        let p = calibrated();
        let (bus, sim) = setup(&p);
        let (ctx, handle, mut rx) = ctx();
        let policy = FlashPolicy::default();
        let flashing = flash_parameters(&bus, &p, &policy, &ctx);
        let (result, _) = tokio::join!(flashing, async {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::FlashProgress(p)) if p.stage == FlashStage::Reboot => {
                        handle.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert!(sim.bars()[1].zeros.iter().all(|z| *z == 0));
    }
}
