//! Live weight check against the factors stored in the bars.
//!
//! Before polling starts the bars get time to settle after a flash, stale
//! bytes are drained, the factors are read back from every bar and fresh
//! zeros are averaged. The loop then turns strict ADC reads into weights,
//! `(adc − zero) × factor`, at a tick that can be changed while it runs.
//!
//! Re-zeroing is requested through [`TestControl`] and runs inside the loop
//! task, so it owns the bus like every other tick and is cancelled with it.
//! The collected vector goes through a single-slot `watch` channel; only the
//! latest zeros are ever applied.

use crate::error::{SessionError, SessionResult};
use crate::events::SessionEvent;
use crate::operation::OperationContext;
use crate::sampler::{collect_averaged_zeros, zero_warmup, SamplingTargets, DEFAULT_SAMPLE_TICK};
use barcal_core::{LoadCell, Parameters};
use barcal_hardware::BarBus;
use barcal_numerics::ieee754;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Tick used when none is configured.
pub const DEFAULT_TICK_MS: u64 = 50;
/// Fastest allowed tick.
pub const MIN_TICK_MS: u64 = 10;
/// Slowest allowed tick.
pub const MAX_TICK_MS: u64 = 1000;
/// Strict ADC read timeout used when none is configured.
pub const DEFAULT_AD_TIMEOUT_MS: u64 = 200;

const SETTLE: Duration = Duration::from_millis(450);
const DRAIN_ROUNDS: usize = 3;
const DRAIN_WINDOW: Duration = Duration::from_millis(25);
const FACTOR_ATTEMPTS: u32 = 3;
const FACTOR_GAP: Duration = Duration::from_millis(350);

/// Tick in milliseconds: 0 means the default, anything else is clamped.
pub fn clamp_tick(ms: u64) -> u64 {
    if ms == 0 {
        DEFAULT_TICK_MS
    } else {
        ms.clamp(MIN_TICK_MS, MAX_TICK_MS)
    }
}

/// Loop settings, adjustable while running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConfig {
    /// Attach debug details to every snapshot.
    pub debug: bool,
    /// Tick in ms (0 = default).
    pub tick_ms: u64,
    /// Strict ADC read timeout in ms (0 = default).
    pub ad_timeout_ms: u64,
}

/// Shared state between the session and a running test loop.
#[derive(Debug)]
pub struct TestControl {
    tick_ms: AtomicU64,
    ad_timeout_ms: AtomicU64,
    debug: AtomicBool,
    zeroing: AtomicBool,
    rezero: Notify,
    zeros_tx: watch::Sender<Vec<u64>>,
}

impl TestControl {
    /// Control initialised from `config`.
    pub fn new(config: TestConfig) -> Self {
        let (zeros_tx, _) = watch::channel(Vec::new());
        let control = Self {
            tick_ms: AtomicU64::new(0),
            ad_timeout_ms: AtomicU64::new(0),
            debug: AtomicBool::new(false),
            zeroing: AtomicBool::new(false),
            rezero: Notify::new(),
            zeros_tx,
        };
        control.apply(config);
        control
    }

    /// Replaces tick, timeout and debug flag.
    pub fn apply(&self, config: TestConfig) {
        self.tick_ms.store(config.tick_ms, Ordering::Relaxed);
        self.ad_timeout_ms.store(config.ad_timeout_ms, Ordering::Relaxed);
        self.debug.store(config.debug, Ordering::Relaxed);
    }

    /// Current tick in ms, clamped.
    pub fn tick_ms(&self) -> u64 {
        clamp_tick(self.tick_ms.load(Ordering::Relaxed))
    }

    /// Current strict read timeout in ms.
    pub fn ad_timeout_ms(&self) -> u64 {
        match self.ad_timeout_ms.load(Ordering::Relaxed) {
            0 => DEFAULT_AD_TIMEOUT_MS,
            ms => ms,
        }
    }

    /// Debug details requested.
    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Zero collection requested or in progress; the loop does not poll.
    pub fn is_zeroing(&self) -> bool {
        self.zeroing.load(Ordering::Acquire)
    }

    /// Asks the loop to re-collect zeros.
    ///
    /// Returns false, and queues nothing, when a collection is already
    /// requested or running.
    pub fn request_rezero(&self) -> bool {
        if self.zeroing.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.rezero.notify_one();
        true
    }

    async fn rezero_requested(&self) {
        self.rezero.notified().await;
    }

    fn set_zeroing(&self, on: bool) {
        self.zeroing.store(on, Ordering::Release);
    }

    /// Hands new zeros to the loop, replacing any not yet picked up.
    pub fn publish_zeros(&self, zeros: Vec<u64>) {
        self.zeros_tx.send_replace(zeros);
    }

    /// Receiver for published zeros.
    pub fn subscribe_zeros(&self) -> watch::Receiver<Vec<u64>> {
        self.zeros_tx.subscribe()
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// One channel of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelWeight {
    /// Raw reading.
    pub adc: u64,
    /// Zero in use.
    pub zero: u64,
    /// Factor in use.
    pub factor: f32,
    /// `(adc − zero) × factor`.
    pub weight: f64,
}

/// One bar of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BarSnapshot {
    /// Zero-based bar index.
    pub bar: usize,
    /// Bus address.
    pub id: u8,
    /// Per-channel weights (empty when the read failed).
    pub channels: Vec<ChannelWeight>,
    /// Sum of the channel weights.
    pub total: f64,
    /// Read failure for this tick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Extra fields attached in debug mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDebug {
    /// Tick in effect.
    pub tick_ms: u64,
    /// Read timeout in effect.
    pub ad_timeout_ms: u64,
    /// Zeros in effect, bar-major.
    pub zeros: Vec<u64>,
}

/// Weights of every bar at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSnapshot {
    /// Per-bar results.
    pub bars: Vec<BarSnapshot>,
    /// Sum of the bar totals.
    pub grand_total: f64,
    /// When the reads finished.
    pub updated_at: DateTime<Utc>,
    /// Present in debug mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<SnapshotDebug>,
}

/// Factors read back from one bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarFactors {
    /// Zero-based bar index.
    pub bar: usize,
    /// One per active channel.
    pub factors: Vec<f32>,
}

/// Zeros of one bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarZeros {
    /// Zero-based bar index.
    pub bar: usize,
    /// One per active channel.
    pub zeros: Vec<u64>,
}

/// Splits bar-major zeros into per-bar groups.
pub fn bar_zeros(zeros: &[u64], bars: usize, channels: usize) -> Vec<BarZeros> {
    (0..bars)
        .map(|bar| BarZeros {
            bar,
            zeros: (0..channels)
                .map(|lc| zeros.get(bar * channels + lc).copied().unwrap_or(0))
                .collect(),
        })
        .collect()
}

/// Reads every bar strictly and converts the readings to weights.
///
/// Zeros come from `zeros` (bar-major) and fall back to the bar's stored
/// records; factors come from the records and default to 1. A bar whose read
/// fails is reported with its error; the snapshot fails only when every bar
/// failed.
pub async fn compute_snapshot(
    bus: &BarBus,
    params: &Parameters,
    zeros: &[u64],
    ad_timeout: Duration,
) -> SessionResult<TestSnapshot> {
    let channels = bus.channels();
    let mut bars = Vec::with_capacity(bus.bar_count());
    let mut first_error = None;
    for (index, live) in bus.bars().iter().enumerate() {
        let records = params.bars.get(index).map(|b| b.lc.as_slice()).unwrap_or(&[]);
        match bus.read_channels_strict(index, ad_timeout).await {
            Ok(values) => {
                let channel_weights: Vec<ChannelWeight> = (0..channels)
                    .map(|lc| {
                        let adc = values.get(lc).copied().unwrap_or(0);
                        let zero = zeros
                            .get(index * channels + lc)
                            .copied()
                            .or_else(|| records.get(lc).map(|r| r.zero))
                            .unwrap_or(0);
                        let factor = records.get(lc).map(|r| r.factor).unwrap_or(1.0);
                        ChannelWeight {
                            adc,
                            zero,
                            factor,
                            weight: (adc as f64 - zero as f64) * factor as f64,
                        }
                    })
                    .collect();
                bars.push(BarSnapshot {
                    bar: index,
                    id: live.id,
                    total: channel_weights.iter().map(|c| c.weight).sum(),
                    channels: channel_weights,
                    error: None,
                });
            }
            Err(e) => {
                debug!(target: "barcal::test", bar = index, "snapshot read failed: {}", e);
                bars.push(BarSnapshot {
                    bar: index,
                    id: live.id,
                    channels: Vec::new(),
                    total: 0.0,
                    error: Some(e.to_string()),
                });
                first_error.get_or_insert(e);
            }
        }
    }
    if bars.iter().all(|b| b.error.is_some()) {
        if let Some(e) = first_error {
            return Err(e.into());
        }
    }
    Ok(TestSnapshot {
        grand_total: bars.iter().map(|b| b.total).sum(),
        bars,
        updated_at: Utc::now(),
        debug: None,
    })
}

impl TestSnapshot {
    /// Raw readings per bar; empty for a bar whose read failed.
    pub fn readings(&self) -> Vec<Vec<u64>> {
        self.bars
            .iter()
            .map(|bar| bar.channels.iter().map(|c| c.adc).collect())
            .collect()
    }
}

// =============================================================================
// Preparation
// =============================================================================

/// Reads every bar's factors into `params` (zeros reset to 0).
pub async fn read_factors_into(bus: &BarBus, params: &mut Parameters) -> SessionResult<Vec<BarFactors>> {
    let mut summary = Vec::with_capacity(bus.bar_count());
    for index in 0..bus.bar_count() {
        let factors = bus.read_factors(index).await?;
        if let Some(bar) = params.bars.get_mut(index) {
            bar.lc = factors
                .iter()
                .map(|&factor| LoadCell {
                    zero: 0,
                    factor,
                    ieee: ieee754::to_hex(factor),
                })
                .collect();
        }
        summary.push(BarFactors { bar: index, factors });
    }
    Ok(summary)
}

/// Settles, drains, and loads the device factors into `params`.
///
/// The factor read is repeated a few times because a freshly rebooted bar can
/// answer with stale values; the last attempt decides.
pub async fn prepare(bus: &BarBus, params: &mut Parameters, ctx: &OperationContext) -> SessionResult<()> {
    ctx.sleep(SETTLE).await?;
    for _ in 0..DRAIN_ROUNDS {
        bus.drain(DRAIN_WINDOW).await;
    }

    let mut last = Err(SessionError::MissingFactors);
    for attempt in 1..=FACTOR_ATTEMPTS {
        ctx.check()?;
        last = read_factors_into(bus, params).await;
        if let Err(e) = &last {
            debug!(target: "barcal::test", attempt, "factor read failed: {}", e);
        }
        if attempt < FACTOR_ATTEMPTS {
            ctx.sleep(FACTOR_GAP).await?;
        }
    }
    let summary = last?;
    if !params.has_factors() {
        return Err(SessionError::MissingFactors);
    }
    info!(target: "barcal::test", bars = summary.len(), "factors read back");
    ctx.emit(SessionEvent::FactorsRead { bars: summary });
    Ok(())
}

/// Averages fresh zeros, reporting progress and the result as events.
pub async fn collect_zeros(bus: &BarBus, params: &Parameters, ctx: &OperationContext) -> SessionResult<Vec<u64>> {
    let samples = SamplingTargets::from_parameters(params).avg;
    let zeros = collect_averaged_zeros(
        bus,
        ctx,
        zero_warmup(params),
        samples,
        DEFAULT_SAMPLE_TICK,
        |progress| ctx.emit(SessionEvent::ZerosProgress(progress)),
    )
    .await?;
    ctx.emit(SessionEvent::ZerosDone);
    ctx.emit(SessionEvent::ZerosSummary {
        zeros: bar_zeros(&zeros, bus.bar_count(), bus.channels()),
    });
    Ok(zeros)
}

/// Re-collects zeros and hands them to the loop.
///
/// Failures other than cancellation are reported as an error event; the
/// zeros in use stay unchanged.
pub async fn rezero(bus: &BarBus, params: &Parameters, control: &TestControl, ctx: &OperationContext) -> SessionResult<()> {
    control.set_zeroing(true);
    let result = collect_zeros(bus, params, ctx).await;
    control.set_zeroing(false);
    match result {
        Ok(zeros) => {
            control.publish_zeros(zeros);
            Ok(())
        }
        Err(SessionError::Cancelled) => Err(SessionError::Cancelled),
        Err(e) => {
            ctx.emit_error(format!("zero collection failed: {}", e), None);
            Err(e)
        }
    }
}

// =============================================================================
// Loop
// =============================================================================

/// Full test operation: prepare, zero, then snapshot until cancelled.
///
/// `params` is updated with the factors read from the device. Snapshot
/// failures are reported as error events and polling continues. Every
/// snapshot's raw readings go to `on_readings`, one vector per bar, empty for
/// a bar whose read failed.
pub async fn run_test(
    bus: &BarBus,
    params: &mut Parameters,
    control: &TestControl,
    ctx: &OperationContext,
    mut on_readings: impl FnMut(Vec<Vec<u64>>) + Send,
) -> SessionResult<()> {
    prepare(bus, params, ctx).await?;
    let zeros = collect_zeros(bus, params, ctx).await?;
    control.publish_zeros(zeros);

    let mut zeros_rx = control.subscribe_zeros();
    let mut zeros = zeros_rx.borrow_and_update().clone();
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return Err(SessionError::Cancelled),
            changed = zeros_rx.changed() => {
                if changed.is_ok() {
                    zeros = zeros_rx.borrow_and_update().clone();
                    debug!(target: "barcal::test", "zeros replaced");
                }
            }
            _ = control.rezero_requested() => {
                if let Err(SessionError::Cancelled) = rezero(bus, params, control, ctx).await {
                    return Err(SessionError::Cancelled);
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(control.tick_ms())) => {
                let timeout = control.ad_timeout_ms();
                match compute_snapshot(bus, params, &zeros, Duration::from_millis(timeout)).await {
                    Ok(mut snapshot) => {
                        on_readings(snapshot.readings());
                        if control.debug() {
                            snapshot.debug = Some(SnapshotDebug {
                                tick_ms: control.tick_ms(),
                                ad_timeout_ms: timeout,
                                zeros: zeros.clone(),
                            });
                        }
                        ctx.emit(SessionEvent::Snapshot(snapshot));
                    }
                    Err(e) => {
                        warn!(target: "barcal::test", "snapshot failed: {}", e);
                        ctx.emit_error(e.to_string(), None);
                    }
                }
            }
        }
    }
}
