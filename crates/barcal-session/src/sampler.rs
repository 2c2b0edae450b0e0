//! Warm-up and averaging sampler for one calibration step.
//!
//! ```text
//!  Live ──go──▶ Ignoring ──ignore target──▶ Averaging ──avg target──▶ Finished
//!    └───────────────── cancelled at any suspension point ─────────────────┘
//! ```
//!
//! Every tick reads each bar once and reports a [`SampleSnapshot`]. A failed
//! read keeps the bar's previous values in `current`, so observers never see
//! a bar drop to zero because of one lost frame. Averages are per bar over the
//! ticks where that bar answered.

use crate::error::SessionResult;
use crate::operation::OperationContext;
use async_trait::async_trait;
use barcal_core::{BusResult, Parameters, DEFAULT_AVG, DEFAULT_IGNORE};
use barcal_hardware::BarBus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Delay between sampler ticks.
pub const DEFAULT_SAMPLE_TICK: Duration = Duration::from_millis(5);

/// Warm-up reads before zero collection when `IGNORE` is unset.
pub const ZERO_WARMUP_FALLBACK: u32 = 5;

/// Anything that yields one reading vector per bar.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Number of bars.
    fn bar_count(&self) -> usize;

    /// Channels per bar.
    fn channels(&self) -> usize;

    /// Reads bar `index`; an empty vector means "no data this time".
    async fn read_bar(&self, index: usize) -> BusResult<Vec<u64>>;
}

#[async_trait]
impl ChannelSource for BarBus {
    fn bar_count(&self) -> usize {
        BarBus::bar_count(self)
    }

    fn channels(&self) -> usize {
        BarBus::channels(self)
    }

    async fn read_bar(&self, index: usize) -> BusResult<Vec<u64>> {
        self.read_channels(index).await
    }
}

// =============================================================================
// Phase and snapshot
// =============================================================================

/// Sampler state, reported verbatim to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SamplingPhase {
    /// Showing readings, waiting for the go signal.
    Live,
    /// Discarding warm-up reads.
    Ignoring,
    /// Accumulating reads.
    Averaging,
    /// Averages are final.
    Finished,
}

impl fmt::Display for SamplingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SamplingPhase::Live => "live",
            SamplingPhase::Ignoring => "ignoring",
            SamplingPhase::Averaging => "averaging",
            SamplingPhase::Finished => "finished",
        })
    }
}

/// Warm-up and averaging tick counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingTargets {
    /// Ticks discarded before averaging.
    pub ignore: u32,
    /// Ticks averaged.
    pub avg: u32,
}

impl SamplingTargets {
    /// Explicit targets.
    pub fn new(ignore: u32, avg: u32) -> Self {
        Self { ignore, avg }
    }

    /// `IGNORE`/`AVG` from the descriptor, with the usual fallbacks.
    pub fn from_parameters(params: &Parameters) -> Self {
        let avg = if params.avg > 0 { params.avg } else { DEFAULT_AVG };
        let ignore = if params.ignore > 0 {
            params.ignore
        } else if params.avg > 0 {
            params.avg
        } else {
            DEFAULT_IGNORE
        };
        Self { ignore, avg }
    }
}

/// What one sampler tick looked like.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleSnapshot {
    /// Phase after this tick.
    pub phase: SamplingPhase,
    /// Warm-up ticks done.
    pub ignore_done: u32,
    /// Warm-up target.
    pub ignore_target: u32,
    /// Averaging ticks done.
    pub avg_done: u32,
    /// Averaging target.
    pub avg_target: u32,
    /// Latest good reading per bar.
    pub current: Vec<Vec<u64>>,
    /// Final averages (only once finished).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub averaged: Option<Vec<Vec<u64>>>,
    /// When this snapshot was taken.
    pub updated_at: DateTime<Utc>,
}

impl SampleSnapshot {
    /// Live snapshot with the given readings and no sampling progress.
    pub fn live(current: Vec<Vec<u64>>) -> Self {
        Self {
            phase: SamplingPhase::Live,
            ignore_done: 0,
            ignore_target: 0,
            avg_done: 0,
            avg_target: 0,
            current,
            averaged: None,
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// Go signal
// =============================================================================

/// Starts sampling a step that was started in the live phase.
#[derive(Debug)]
pub struct GoHandle(oneshot::Sender<()>);

impl GoHandle {
    /// Leaves the live phase; a no-op if the step is already gone.
    pub fn go(self) {
        let _ = self.0.send(());
    }
}

/// How the sampler leaves the live phase.
#[derive(Debug)]
pub enum GoTrigger {
    /// Start warming up immediately.
    Now,
    /// Stay live until the paired [`GoHandle`] fires; dropping it cancels.
    Wait(oneshot::Receiver<()>),
}

/// Paired handle and trigger for an operator-started step.
pub fn go_trigger() -> (GoHandle, GoTrigger) {
    let (tx, rx) = oneshot::channel();
    (GoHandle(tx), GoTrigger::Wait(rx))
}

// =============================================================================
// Sampler
// =============================================================================

/// Runs one step against a [`ChannelSource`].
pub struct Sampler<'a, S: ChannelSource + ?Sized> {
    source: &'a S,
    targets: SamplingTargets,
    tick: Duration,
}

impl<'a, S: ChannelSource + ?Sized> Sampler<'a, S> {
    /// Sampler with the default tick.
    pub fn new(source: &'a S, targets: SamplingTargets) -> Self {
        Self {
            source,
            targets,
            tick: DEFAULT_SAMPLE_TICK,
        }
    }

    /// Overrides the delay between ticks.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Reads every bar once; updates `current` where the read succeeded.
    async fn read_tick(&self, current: &mut [Vec<u64>]) -> Vec<bool> {
        let channels = self.source.channels();
        let mut ok = Vec::with_capacity(current.len());
        for (index, slot) in current.iter_mut().enumerate() {
            match self.source.read_bar(index).await {
                Ok(mut values) if !values.is_empty() => {
                    values.resize(channels, 0);
                    *slot = values;
                    ok.push(true);
                }
                Ok(_) => ok.push(false),
                Err(e) => {
                    debug!(target: "barcal::sampler", bar = index, "read failed: {}", e);
                    ok.push(false);
                }
            }
        }
        ok
    }

    /// Samples one step and returns the averages flattened bar-major.
    ///
    /// `on_tick` sees every snapshot, including the final one carrying
    /// `averaged`.
    ///
    /// # Errors
    /// [`SessionError::Cancelled`](crate::SessionError::Cancelled) when the
    /// context is cancelled or the go handle is dropped.
    pub async fn run(
        &self,
        ctx: &OperationContext,
        go: GoTrigger,
        mut on_tick: impl FnMut(&SampleSnapshot) + Send,
    ) -> SessionResult<Vec<u64>> {
        let bars = self.source.bar_count();
        let channels = self.source.channels();
        let mut current = vec![vec![0u64; channels]; bars];
        let mut sums = vec![vec![0u64; channels]; bars];
        let mut counts = vec![0u64; bars];
        let mut ignore_done = 0u32;
        let mut avg_done = 0u32;

        let mut phase = SamplingPhase::Live;
        let mut waiting = match go {
            GoTrigger::Now => {
                phase = SamplingPhase::Ignoring;
                None
            }
            GoTrigger::Wait(rx) => Some(rx),
        };
        if phase == SamplingPhase::Ignoring && self.targets.ignore == 0 {
            phase = SamplingPhase::Averaging;
        }

        loop {
            ctx.check()?;
            let ok = self.read_tick(&mut current).await;

            match phase {
                SamplingPhase::Live => {
                    if let Some(rx) = waiting.as_mut() {
                        match rx.try_recv() {
                            Ok(()) => {
                                waiting = None;
                                phase = if self.targets.ignore == 0 {
                                    SamplingPhase::Averaging
                                } else {
                                    SamplingPhase::Ignoring
                                };
                                debug!(target: "barcal::sampler", "go received");
                            }
                            Err(oneshot::error::TryRecvError::Empty) => {}
                            Err(oneshot::error::TryRecvError::Closed) => {
                                return Err(crate::SessionError::Cancelled);
                            }
                        }
                    }
                }
                SamplingPhase::Ignoring => {
                    ignore_done += 1;
                    if ignore_done >= self.targets.ignore {
                        phase = SamplingPhase::Averaging;
                    }
                }
                SamplingPhase::Averaging => {
                    avg_done += 1;
                    for (bar, good) in ok.iter().enumerate() {
                        if *good {
                            for (sum, value) in sums[bar].iter_mut().zip(&current[bar]) {
                                *sum += *value;
                            }
                            counts[bar] += 1;
                        }
                    }
                    if avg_done >= self.targets.avg {
                        phase = SamplingPhase::Finished;
                    }
                }
                SamplingPhase::Finished => {}
            }

            if phase == SamplingPhase::Finished {
                let averaged = self.finish(&sums, &counts, &mut current).await;
                on_tick(&SampleSnapshot {
                    phase,
                    ignore_done,
                    ignore_target: self.targets.ignore,
                    avg_done,
                    avg_target: self.targets.avg,
                    current: current.clone(),
                    averaged: Some(averaged.clone()),
                    updated_at: Utc::now(),
                });
                return Ok(averaged.into_iter().flatten().collect());
            }

            on_tick(&SampleSnapshot {
                phase,
                ignore_done,
                ignore_target: self.targets.ignore,
                avg_done,
                avg_target: self.targets.avg,
                current: current.clone(),
                averaged: None,
                updated_at: Utc::now(),
            });
            ctx.sleep(self.tick).await?;
        }
    }

    /// Per-bar averages; a bar that never answered gets one last direct read.
    async fn finish(
        &self,
        sums: &[Vec<u64>],
        counts: &[u64],
        current: &mut [Vec<u64>],
    ) -> Vec<Vec<u64>> {
        let channels = self.source.channels();
        let mut averaged = Vec::with_capacity(sums.len());
        for (bar, (bar_sums, &count)) in sums.iter().zip(counts).enumerate() {
            if count > 0 {
                averaged.push(bar_sums.iter().map(|s| s / count).collect());
                continue;
            }
            match self.source.read_bar(bar).await {
                Ok(mut values) if !values.is_empty() => {
                    values.resize(channels, 0);
                    current[bar] = values.clone();
                    averaged.push(values);
                }
                _ => {
                    warn!(target: "barcal::sampler", bar, "no valid samples; averaging to zero");
                    averaged.push(vec![0; channels]);
                }
            }
        }
        averaged
    }
}

// =============================================================================
// Zero collection
// =============================================================================

/// Stage of a zero collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ZeroPhase {
    /// Discarded warm-up reads.
    Warmup,
    /// Reads being averaged.
    Averaging,
}

/// Zero collection progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZerosProgress {
    /// Stage.
    pub phase: ZeroPhase,
    /// Ticks done in this stage.
    pub done: u32,
    /// Ticks in this stage.
    pub target: u32,
}

/// Warm-up length for zero collection: `IGNORE`, or 5 when unset.
pub fn zero_warmup(params: &Parameters) -> u32 {
    if params.ignore > 0 {
        params.ignore
    } else {
        ZERO_WARMUP_FALLBACK
    }
}

/// Averages `samples` ticks of readings into one zero per channel, bar-major.
///
/// A tick counts when at least one bar answered; bars that did not answer add
/// nothing to that tick. With no counted tick at all, a single direct read
/// fills the zeros (bars that still do not answer stay 0).
pub async fn collect_averaged_zeros<S: ChannelSource + ?Sized>(
    source: &S,
    ctx: &OperationContext,
    warmup: u32,
    samples: u32,
    tick: Duration,
    mut on_progress: impl FnMut(ZerosProgress) + Send,
) -> SessionResult<Vec<u64>> {
    let bars = source.bar_count();
    let channels = source.channels();

    for done in 1..=warmup {
        ctx.check()?;
        for bar in 0..bars {
            let _ = source.read_bar(bar).await;
        }
        on_progress(ZerosProgress {
            phase: ZeroPhase::Warmup,
            done,
            target: warmup,
        });
        ctx.sleep(tick).await?;
    }

    let mut sums = vec![0u64; bars * channels];
    let mut count = 0u64;
    for done in 1..=samples {
        ctx.check()?;
        let mut got_any = false;
        for bar in 0..bars {
            match source.read_bar(bar).await {
                Ok(values) if !values.is_empty() => {
                    got_any = true;
                    for (lc, value) in values.iter().take(channels).enumerate() {
                        sums[bar * channels + lc] += *value;
                    }
                }
                _ => {}
            }
        }
        if got_any {
            count += 1;
        }
        on_progress(ZerosProgress {
            phase: ZeroPhase::Averaging,
            done,
            target: samples,
        });
        ctx.sleep(tick).await?;
    }

    if count > 0 {
        return Ok(sums.into_iter().map(|s| s / count).collect());
    }

    debug!(target: "barcal::sampler", "no valid zero samples; one-shot read");
    let mut zeros = vec![0u64; bars * channels];
    for bar in 0..bars {
        if let Ok(values) = source.read_bar(bar).await {
            for (lc, value) in values.iter().take(channels).enumerate() {
                zeros[bar * channels + lc] = *value;
            }
        }
    }
    Ok(zeros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSink;
    use crate::operation::OperationKind;
    use crate::SessionError;
    use barcal_core::BusError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type ReadFn = dyn Fn(usize, usize) -> BusResult<Vec<u64>> + Send + Sync;

    /// Answers through a closure of `(bar, nth call for that bar)`.
    struct FakeSource {
        channels: usize,
        calls: Vec<AtomicUsize>,
        read: Box<ReadFn>,
    }

    impl FakeSource {
        fn new(
            bars: usize,
            channels: usize,
            read: impl Fn(usize, usize) -> BusResult<Vec<u64>> + Send + Sync + 'static,
        ) -> Self {
            Self {
                channels,
                calls: (0..bars).map(|_| AtomicUsize::new(0)).collect(),
                read: Box::new(read),
            }
        }
    }

    #[async_trait]
    impl ChannelSource for FakeSource {
        fn bar_count(&self) -> usize {
            self.calls.len()
        }

        fn channels(&self) -> usize {
            self.channels
        }

        async fn read_bar(&self, index: usize) -> BusResult<Vec<u64>> {
            let n = self.calls[index].fetch_add(1, Ordering::SeqCst);
            (self.read)(index, n)
        }
    }

    fn ctx() -> (OperationContext, crate::operation::CancelHandle) {
        OperationContext::new(1, OperationKind::CalibrationSampling, EventSink::default())
    }

    fn timeout() -> BusError {
        BusError::Timeout {
            len: 0,
            raw_hex: String::new(),
        }
    }

    #[test]
    fn test_targets_from_parameters() {
        let mut p = Parameters::from_json(br#"{"AVG":20,"BARS":[]}"#).unwrap();
        assert_eq!(SamplingTargets::from_parameters(&p), SamplingTargets::new(20, 20));
        p.ignore = 7;
        assert_eq!(SamplingTargets::from_parameters(&p), SamplingTargets::new(7, 20));
        p.avg = 0;
        p.ignore = 0;
        assert_eq!(
            SamplingTargets::from_parameters(&p),
            SamplingTargets::new(DEFAULT_IGNORE, DEFAULT_AVG)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_reading_averages_to_itself() {
        let source = FakeSource::new(2, 2, |bar, _| Ok(vec![1000 + bar as u64, 2000]));
        let (ctx, _h) = ctx();
        let mut phases = Vec::new();
        let flat = Sampler::new(&source, SamplingTargets::new(3, 10))
            .run(&ctx, GoTrigger::Now, |s| phases.push(s.phase))
            .await
            .unwrap();
        assert_eq!(flat, vec![1000, 2000, 1001, 2000]);
        assert_eq!(phases.iter().filter(|p| **p == SamplingPhase::Ignoring).count(), 2);
        assert_eq!(*phases.last().unwrap(), SamplingPhase::Finished);
        assert!(!phases.contains(&SamplingPhase::Live));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ticks_excluded_from_average() {
        // every other read fails; good reads alternate 10 and 30
        let source = FakeSource::new(1, 1, |_, n| match n % 4 {
            0 => Ok(vec![10]),
            2 => Ok(vec![30]),
            1 => Err(timeout()),
            _ => Ok(Vec::new()),
        });
        let (ctx, _h) = ctx();
        let flat = Sampler::new(&source, SamplingTargets::new(0, 8))
            .run(&ctx, GoTrigger::Now, |_| {})
            .await
            .unwrap();
        assert_eq!(flat, vec![20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reads_keep_last_current_and_average_nothing() {
        let source = FakeSource::new(1, 2, |_, n| {
            if n == 0 {
                Ok(vec![5, 6])
            } else {
                Err(timeout())
            }
        });
        let (ctx, _h) = ctx();
        let mut seen = Vec::new();
        let flat = Sampler::new(&source, SamplingTargets::new(1, 2))
            .run(&ctx, GoTrigger::Now, |s| seen.push(s.current.clone()))
            .await
            .unwrap();
        // every tick after the first good read still shows it in `current`
        assert!(seen.len() > 1);
        assert!(seen.iter().all(|c| c == &vec![vec![5, 6]]));
        // the single good read happened while ignoring; no averaging tick and
        // the one-shot fallback both fail, so the averages are zero
        assert_eq!(flat, vec![0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fallback_when_no_tick_answered() {
        let source = FakeSource::new(1, 1, |_, n| if n < 3 { Err(timeout()) } else { Ok(vec![77]) });
        let (ctx, _h) = ctx();
        let flat = Sampler::new(&source, SamplingTargets::new(0, 3))
            .run(&ctx, GoTrigger::Now, |_| {})
            .await
            .unwrap();
        assert_eq!(flat, vec![77]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_until_go() {
        let source = FakeSource::new(1, 1, |_, _| Ok(vec![42]));
        let (ctx, _h) = ctx();
        let (handle, trigger) = go_trigger();
        let mut phases = Vec::new();
        let sampler = Sampler::new(&source, SamplingTargets::new(2, 2));
        let (flat, _) = tokio::join!(sampler.run(&ctx, trigger, |s| phases.push(s.phase)), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.go();
        });
        assert_eq!(flat.unwrap(), vec![42]);
        let live = phases.iter().take_while(|p| **p == SamplingPhase::Live).count();
        assert!(live >= 5, "stayed live for {live} ticks");
        assert_eq!(*phases.last().unwrap(), SamplingPhase::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_go_handle_cancels() {
        let source = FakeSource::new(1, 1, |_, _| Ok(vec![1]));
        let (ctx, _h) = ctx();
        let (handle, trigger) = go_trigger();
        drop(handle);
        let result = Sampler::new(&source, SamplingTargets::new(1, 1))
            .run(&ctx, trigger, |_| {})
            .await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_sampling() {
        let source = FakeSource::new(1, 1, |_, _| Ok(vec![1]));
        let (ctx, handle) = ctx();
        let mut ticks = 0;
        let result = Sampler::new(&source, SamplingTargets::new(1000, 1000))
            .run(&ctx, GoTrigger::Now, |_| {
                ticks += 1;
                if ticks == 10 {
                    handle.cancel();
                }
            })
            .await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert_eq!(ticks, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_collection_counts_ticks_with_any_answer() {
        // bar 1 never answers; its zeros stay 0 while bar 0 averages normally
        let source = FakeSource::new(2, 1, |bar, n| {
            if bar == 1 {
                Err(timeout())
            } else {
                Ok(vec![100 + (n as u64 % 2) * 10])
            }
        });
        let (ctx, _h) = ctx();
        let mut progress = Vec::new();
        let zeros = collect_averaged_zeros(&source, &ctx, 2, 4, DEFAULT_SAMPLE_TICK, |p| {
            progress.push(p)
        })
        .await
        .unwrap();
        assert_eq!(zeros, vec![105, 0]);
        assert_eq!(progress.len(), 6);
        assert_eq!(progress[1].phase, ZeroPhase::Warmup);
        assert_eq!(
            progress[5],
            ZerosProgress {
                phase: ZeroPhase::Averaging,
                done: 4,
                target: 4
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_collection_one_shot_fallback() {
        let source = FakeSource::new(1, 2, |_, n| if n < 3 { Ok(Vec::new()) } else { Ok(vec![9, 8]) });
        let (ctx, _h) = ctx();
        let zeros = collect_averaged_zeros(&source, &ctx, 1, 2, DEFAULT_SAMPLE_TICK, |_| {})
            .await
            .unwrap();
        assert_eq!(zeros, vec![9, 8]);
    }

    #[test]
    fn test_zero_warmup_fallback() {
        let mut p = Parameters::from_json(br#"{"BARS":[]}"#).unwrap();
        p.ignore = 0;
        assert_eq!(zero_warmup(&p), ZERO_WARMUP_FALLBACK);
        p.ignore = 12;
        assert_eq!(zero_warmup(&p), 12);
    }
}
