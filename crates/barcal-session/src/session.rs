//! Device session: the single owner of one bar bus.
//!
//! Every operation that talks to the bus (sampling a calibration step,
//! flashing, the test loop) runs as a background task registered in one
//! `active` slot. Starting an operation cancels and joins whatever held the
//! slot before, so two operations never observe themselves as running at the
//! same time. Starts, stops and connects are serialized by an async gate;
//! everything else only takes short synchronous locks.
//!
//! Results travel over the [`EventSink`]: every task ends with exactly one of
//! `done`, `error` or `stopped` for its kind.

use crate::error::{SessionError, SessionResult};
use crate::events::{EventSink, SessionEvent};
use crate::flash::{check_layout, flash_parameters, FlashPolicy};
use crate::operation::{CancelHandle, OperationContext, OperationKind};
use crate::plan::{build_plan, CalibrationPlan, CalibrationStep, StepKind};
use crate::sampler::{go_trigger, GoHandle, GoTrigger, SampleSnapshot, Sampler, SamplingTargets, DEFAULT_SAMPLE_TICK};
use crate::test_mode::{self, BarFactors, TestConfig, TestControl};
use barcal_core::{LoadCell, Parameters};
use barcal_hardware::{BarBus, BarVersion, BusTimings, PortCache, Transport};
use barcal_numerics::{ieee754, solve, Matrix, Solution, Vector};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Row cap of the diagnostic text report.
const REPORT_MAX_ROWS: usize = 200;
/// Column cap of the diagnostic text report.
const REPORT_MAX_COLS: usize = 64;

/// Knobs the session applies to everything it starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Per-command bus timeouts.
    pub timings: BusTimings,
    /// Flash retry and pacing.
    pub flash: FlashPolicy,
    /// Delay between sampler ticks in ms (0 = default).
    pub sample_tick_ms: u64,
    /// Test loop settings used when a start request carries none.
    pub test: TestConfig,
    /// Port cache file; no cache when unset.
    pub port_cache: Option<PathBuf>,
}

impl SessionSettings {
    fn sample_tick(&self) -> Duration {
        match self.sample_tick_ms {
            0 => DEFAULT_SAMPLE_TICK,
            ms => Duration::from_millis(ms),
        }
    }
}

/// Outcome of [`DeviceSession::connect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectReport {
    /// Always true for a returned report.
    pub connected: bool,
    /// Port in use.
    pub port: String,
    /// Bars on the bus.
    pub bars: usize,
    /// Active channels per bar.
    pub lcs: usize,
    /// Firmware mismatch against the configured version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Discovery steps, empty when the configured port answered.
    pub discovery_trace: Vec<String>,
    /// `SERIAL.PORT` differs from what was passed in.
    pub port_updated: bool,
}

/// Outcome of [`DeviceSession::compute`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeReport {
    /// `‖check − W‖ / w`.
    pub error: f64,
    /// Number of factors.
    pub channels: usize,
    /// Zeros, bar-major.
    pub zeros: Vec<u64>,
    /// Factors, bar-major.
    pub factors: Vec<f32>,
    /// Factor bit patterns.
    pub ieee: Vec<String>,
}

/// One factor with its bit pattern.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactorEntry {
    /// Factor as stored by the firmware.
    pub value: f32,
    /// IEEE-754 hex.
    pub ieee: String,
}

/// Read-only diagnostic view of the calibration system.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationMatrices {
    /// Zero readings, one row per placement.
    pub ad0: Vec<Vec<f64>>,
    /// Loaded readings.
    pub adv: Vec<Vec<f64>>,
    /// `adv − ad0`.
    pub diff: Vec<Vec<f64>>,
    /// Load vector.
    pub load: Vec<f64>,
    /// Per-channel zeros.
    pub zeros: Vec<f64>,
    /// Per-channel factors.
    pub factors: Vec<FactorEntry>,
    /// `(adv − ad0) · factors`.
    pub check: Vec<f64>,
    /// Relative residual.
    pub error: f64,
    /// Frobenius norm of the pseudoinverse.
    pub pinv_norm: f64,
    /// Fixed-width text dump.
    pub report: String,
}

impl From<&Solution> for CalibrationMatrices {
    fn from(s: &Solution) -> Self {
        Self {
            ad0: s.ad0.to_rows(),
            adv: s.adv.to_rows(),
            diff: s.diff.to_rows(),
            load: s.load.as_slice().to_vec(),
            zeros: s.zeros.as_slice().to_vec(),
            factors: s
                .factors_f32()
                .into_iter()
                .map(|value| FactorEntry {
                    value,
                    ieee: ieee754::to_hex(value),
                })
                .collect(),
            check: s.check.as_slice().to_vec(),
            error: s.error,
            pinv_norm: s.pinv_norm,
            report: s.report(REPORT_MAX_ROWS, REPORT_MAX_COLS),
        }
    }
}

// =============================================================================
// Internal state
// =============================================================================

struct Link {
    bus: Arc<BarBus>,
    params: Parameters,
}

struct ActiveOperation {
    ctx: OperationContext,
    cancel: CancelHandle,
    task: JoinHandle<()>,
    test: Option<Arc<TestControl>>,
}

#[derive(Default)]
struct Calibration {
    plan: Option<CalibrationPlan>,
    ad0: Option<Matrix>,
    adv: Option<Matrix>,
    received: BTreeSet<usize>,
    solution: Option<Solution>,
}

struct Inner {
    settings: SessionSettings,
    link: Mutex<Option<Link>>,
    active: Mutex<Option<ActiveOperation>>,
    gate: tokio::sync::Mutex<()>,
    calibration: Mutex<Calibration>,
    last_sample: Mutex<Option<SampleSnapshot>>,
    events: EventSink,
    next_id: AtomicU64,
    state_tx: watch::Sender<Option<OperationKind>>,
    port_cache: Option<PortCache>,
}

impl Inner {
    /// Clears the slot if `id` still owns it.
    fn release(&self, id: u64) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|op| op.ctx.id() == id) {
            *active = None;
            self.state_tx.send_replace(None);
        }
    }

    fn record_step(&self, plan: &CalibrationPlan, step: &CalibrationStep, readings: &[u64]) -> SessionResult<usize> {
        let row = Vector::from_vec(readings.iter().map(|&v| v as f64).collect());
        let mut cal = self.calibration.lock();
        match (step.kind, step.row) {
            (StepKind::Weight, Some(r)) => {
                cal.adv
                    .as_mut()
                    .ok_or(SessionError::MissingMatrices)?
                    .set_row(r, &row)?;
            }
            _ => {
                cal.ad0 = Some(Matrix::repeat_row(plan.rows, &row));
                cal.adv = Some(Matrix::zeros(plan.rows, plan.columns));
                cal.received.clear();
            }
        }
        cal.received.insert(step.step_index);
        cal.solution = None;
        Ok(cal.received.len())
    }

    /// Stores test-loop readings for status polling; failed bars keep their last values.
    fn hold_readings(&self, fresh: Vec<Vec<u64>>) {
        let mut last = self.last_sample.lock();
        let previous = last.as_ref().map(|s| s.current.as_slice()).unwrap_or(&[]);
        let current = fresh
            .into_iter()
            .enumerate()
            .map(|(bar, values)| {
                if values.is_empty() {
                    previous.get(bar).cloned().unwrap_or_default()
                } else {
                    values
                }
            })
            .collect();
        *last = Some(SampleSnapshot::live(current));
    }
}

/// Cheap-to-clone handle to one device session.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Inner>,
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self::new(SessionSettings::default())
    }
}

impl DeviceSession {
    /// Session without a bus attached.
    pub fn new(settings: SessionSettings) -> Self {
        let port_cache = settings.port_cache.clone().map(PortCache::load);
        let (state_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                settings,
                link: Mutex::new(None),
                active: Mutex::new(None),
                gate: tokio::sync::Mutex::new(()),
                calibration: Mutex::new(Calibration::default()),
                last_sample: Mutex::new(None),
                events: EventSink::default(),
                next_id: AtomicU64::new(1),
                state_tx,
                port_cache,
            }),
        }
    }

    /// Receiver for every event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Kind of the operation holding the bus, if any.
    pub fn active_operation(&self) -> Option<OperationKind> {
        self.inner.active.lock().as_ref().map(|op| op.ctx.kind())
    }

    /// Resolves once no operation holds the bus.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.state_tx.subscribe();
        let _ = rx.wait_for(|kind| kind.is_none()).await;
    }

    /// Copy of the descriptor in use.
    pub fn parameters(&self) -> SessionResult<Parameters> {
        Ok(self.link()?.1)
    }

    /// Calibrated artifact for the descriptor in use.
    pub fn calibrated_json(&self) -> SessionResult<String> {
        Ok(self.parameters()?.calibrated_json()?)
    }

    fn link(&self) -> SessionResult<(Arc<BarBus>, Parameters)> {
        self.inner
            .link
            .lock()
            .as_ref()
            .map(|l| (Arc::clone(&l.bus), l.params.clone()))
            .ok_or(SessionError::NotConnected)
    }

    fn ensure_idle(&self) -> SessionResult<()> {
        match self.active_operation() {
            Some(kind) => Err(SessionError::Busy(kind)),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Operation slot
    // =========================================================================

    /// Cancels the running operation and waits for its task to finish.
    ///
    /// Must be called with the gate held.
    async fn supersede(&self) -> Option<OperationKind> {
        let op = self.inner.active.lock().take()?;
        self.inner.state_tx.send_replace(None);
        let kind = op.ctx.kind();
        debug!(target: "barcal::session", id = op.ctx.id(), %kind, "cancelling operation");
        op.cancel.cancel();
        if let Err(e) = op.task.await {
            warn!(target: "barcal::session", %kind, "operation task failed: {}", e);
        }
        Some(kind)
    }

    /// Registers and spawns `body` as the new owner of the bus.
    async fn begin<F, Fut>(
        &self,
        kind: OperationKind,
        exclusive: bool,
        test: Option<Arc<TestControl>>,
        body: F,
    ) -> SessionResult<u64>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = SessionResult<()>> + Send + 'static,
    {
        let _gate = self.inner.gate.lock().await;
        if exclusive {
            self.ensure_idle()?;
        }
        self.supersede().await;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (ctx, cancel) = OperationContext::new(id, kind, self.inner.events.clone());
        let work = body(ctx.clone());
        let inner = Arc::clone(&self.inner);
        let task_ctx = ctx.clone();

        // the slot stays locked until the entry is in place, so the task
        // cannot release it before it is registered
        let mut slot = self.inner.active.lock();
        let task = tokio::spawn(async move {
            let result = work.await;
            match result {
                Ok(()) => {
                    info!(target: "barcal::session", id, %kind, "operation done");
                    task_ctx.emit(SessionEvent::Done { operation: kind });
                }
                Err(SessionError::Cancelled) => {
                    info!(target: "barcal::session", id, %kind, "operation stopped");
                    task_ctx.emit(SessionEvent::Stopped { operation: kind });
                }
                Err(e) => {
                    warn!(target: "barcal::session", id, %kind, "operation failed: {}", e);
                    task_ctx.emit_error(e.to_string(), None);
                }
            }
            inner.release(id);
        });
        *slot = Some(ActiveOperation {
            ctx,
            cancel,
            task,
            test,
        });
        self.inner.state_tx.send_replace(Some(kind));
        debug!(target: "barcal::session", id, %kind, "operation started");
        Ok(id)
    }

    /// Cancels whatever is running; returns its kind.
    pub async fn stop(&self) -> Option<OperationKind> {
        let _gate = self.inner.gate.lock().await;
        self.supersede().await
    }

    // =========================================================================
    // Connection
    // =========================================================================

    async fn install(&self, bus: BarBus, params: Parameters) {
        let old = self.inner.link.lock().replace(Link {
            bus: Arc::new(bus),
            params,
        });
        if let Some(old) = old {
            old.bus.close().await;
        }
        *self.inner.calibration.lock() = Calibration::default();
        *self.inner.last_sample.lock() = None;
    }

    /// Attaches an already open link (simulators, tests, custom transports).
    pub async fn attach(&self, params: Parameters, link: Transport) -> SessionResult<()> {
        let _gate = self.inner.gate.lock().await;
        self.supersede().await;
        let bus = BarBus::new(link, &params, self.inner.settings.timings.clone())?;
        self.install(bus, params).await;
        Ok(())
    }

    /// Opens the configured (or cached, or discovered) port and probes the bus.
    ///
    /// Any running operation is cancelled and a previous link is closed first.
    /// When the configured port does not answer, discovery picks one and
    /// `SERIAL.PORT` is updated. The working port is recorded in the cache.
    #[cfg(feature = "serial")]
    #[instrument(skip_all, err)]
    pub async fn connect(&self, mut params: Parameters) -> SessionResult<ConnectReport> {
        let _gate = self.inner.gate.lock().await;
        self.supersede().await;
        self.disconnect_locked().await;
        params.validate()?;

        let configured = params.port().to_string();
        if configured.is_empty() {
            if let Some(cached) = self.inner.port_cache.as_ref().and_then(|c| c.lookup(&params)) {
                debug!(target: "barcal::session", port = %cached, "using cached port");
                params.set_port(cached);
            }
        }

        let mut trace = Vec::new();
        let (bus, device) = match self.open_and_probe(&params).await {
            Ok(found) => found,
            Err(e) => {
                warn!(target: "barcal::session", port = params.port(), "configured port failed: {}", e);
                if !params.port().is_empty() {
                    trace.push(format!("{}: {}", params.port(), e));
                }
                let outcome = barcal_hardware::auto_detect(&params).await;
                trace.extend(outcome.trace);
                let Some(port) = outcome.port else {
                    return Err(SessionError::NoPortResponded { trace });
                };
                params.set_port(port);
                self.open_and_probe(&params).await?
            }
        };

        // the cache key includes the version, so remember before recording one
        if let Some(cache) = &self.inner.port_cache {
            cache.remember(&params);
        }
        let warning = barcal_hardware::version_warning(device, params.version);
        if params.version.map_or(true, |v| v.is_unset()) {
            params.version = Some(device);
        }

        let report = ConnectReport {
            connected: true,
            port: params.port().to_string(),
            bars: bus.bar_count(),
            lcs: bus.channels(),
            warning,
            discovery_trace: trace,
            port_updated: !params.port().eq_ignore_ascii_case(&configured),
        };
        info!(target: "barcal::session", port = %report.port, bars = report.bars, "connected");
        self.install(bus, params).await;
        Ok(report)
    }

    #[cfg(feature = "serial")]
    async fn open_and_probe(&self, params: &Parameters) -> SessionResult<(BarBus, barcal_core::FirmwareVersion)> {
        let bus = BarBus::open(params, self.inner.settings.timings.clone()).await?;
        match bus.read_version(0).await {
            Ok(version) => Ok((bus, version)),
            Err(e) => {
                bus.close().await;
                Err(e.into())
            }
        }
    }

    async fn disconnect_locked(&self) {
        let old = self.inner.link.lock().take();
        if let Some(old) = old {
            old.bus.close().await;
            info!(target: "barcal::session", port = old.bus.port_name(), "disconnected");
        }
    }

    /// Cancels any operation and closes the link.
    pub async fn disconnect(&self) {
        let _gate = self.inner.gate.lock().await;
        self.supersede().await;
        self.disconnect_locked().await;
    }

    /// Per-bar firmware versions; records the first one found when none is configured.
    pub async fn check_versions(&self) -> SessionResult<Vec<BarVersion>> {
        let _gate = self.inner.gate.lock().await;
        self.ensure_idle()?;
        let (bus, params) = self.link()?;
        let report = bus.check_versions(params.version).await;
        if params.version.map_or(true, |v| v.is_unset()) {
            if let Some(found) = report.iter().find_map(|r| r.version) {
                if let Some(link) = self.inner.link.lock().as_mut() {
                    link.params.version = Some(found);
                }
            }
        }
        Ok(report)
    }

    /// Factors currently stored in every bar.
    pub async fn read_factors(&self) -> SessionResult<Vec<BarFactors>> {
        let _gate = self.inner.gate.lock().await;
        self.ensure_idle()?;
        let (bus, mut params) = self.link()?;
        test_mode::read_factors_into(&bus, &mut params).await
    }

    // =========================================================================
    // Calibration
    // =========================================================================

    /// The calibration plan for the attached bus.
    pub fn plan(&self) -> SessionResult<CalibrationPlan> {
        let (bus, params) = self.link()?;
        let mut cal = self.inner.calibration.lock();
        if let Some(plan) = &cal.plan {
            return Ok(plan.clone());
        }
        let plan = build_plan(bus.bar_count(), bus.channels(), params.weight)?;
        cal.plan = Some(plan.clone());
        Ok(plan)
    }

    /// Samples step `index` immediately.
    pub async fn start_step(&self, index: usize) -> SessionResult<u64> {
        self.start_step_with(index, GoTrigger::Now).await
    }

    /// Starts step `index` in the live phase; sampling begins on [`GoHandle::go`].
    pub async fn start_step_live(&self, index: usize) -> SessionResult<(u64, GoHandle)> {
        let (handle, trigger) = go_trigger();
        let id = self.start_step_with(index, trigger).await?;
        Ok((id, handle))
    }

    async fn start_step_with(&self, index: usize, go: GoTrigger) -> SessionResult<u64> {
        let (bus, params) = self.link()?;
        let plan = self.plan()?;
        let step = plan.step(index)?.clone();
        if step.kind == StepKind::Weight && !self.inner.calibration.lock().received.contains(&0) {
            return Err(SessionError::ZeroStepRequired);
        }
        let targets = SamplingTargets::from_parameters(&params);
        let tick = self.inner.settings.sample_tick();
        let inner = Arc::clone(&self.inner);
        info!(target: "barcal::session", step = index, label = %step.label, "sampling step");

        self.begin(OperationKind::CalibrationSampling, false, None, move |ctx| async move {
            let sampler = Sampler::new(bus.as_ref(), targets).with_tick(tick);
            let readings = sampler
                .run(&ctx, go, |snapshot| {
                    *inner.last_sample.lock() = Some(snapshot.clone());
                    ctx.emit(SessionEvent::Sample(snapshot.clone()));
                })
                .await?;
            let received = inner.record_step(&plan, &step, &readings)?;
            ctx.emit(SessionEvent::StepDone {
                step_index: step.step_index,
                label: step.label.clone(),
                received,
                total: plan.len(),
            });
            if received == plan.len() {
                ctx.emit(SessionEvent::SamplesDone);
            }
            Ok(())
        })
        .await
    }

    /// Latest readings for status polling.
    ///
    /// While any operation owns the bus this is the last buffered snapshot
    /// (sampler progress, or the test loop's raw readings) and the bus is not
    /// touched. When idle every bar is read once with the tolerant read and
    /// failed bars show zeros.
    pub async fn adc_snapshot(&self) -> SessionResult<SampleSnapshot> {
        if self.active_operation().is_some() {
            let cached = self.inner.last_sample.lock().clone();
            return Ok(cached.unwrap_or_else(|| SampleSnapshot::live(Vec::new())));
        }
        let (bus, _) = self.link()?;
        let mut current = Vec::with_capacity(bus.bar_count());
        for index in 0..bus.bar_count() {
            let mut values = bus.read_channels(index).await.unwrap_or_default();
            values.resize(bus.channels(), 0);
            current.push(values);
        }
        Ok(SampleSnapshot::live(current))
    }

    fn solve_current(&self, params: &Parameters) -> SessionResult<Solution> {
        let cal = self.inner.calibration.lock();
        let (Some(ad0), Some(adv)) = (&cal.ad0, &cal.adv) else {
            return Err(SessionError::MissingMatrices);
        };
        Ok(solve(ad0, adv, f64::from(params.weight))?)
    }

    /// Solves zeros and factors and writes them into the descriptor's records.
    #[instrument(skip(self), err)]
    pub fn compute(&self) -> SessionResult<ComputeReport> {
        if let Some(kind) = self.active_operation().filter(|k| k.owns_sampling_snapshot()) {
            return Err(SessionError::Busy(kind));
        }
        let (_, params) = self.link()?;
        {
            let cal = self.inner.calibration.lock();
            let total = cal.plan.as_ref().map(|p| p.len()).ok_or(SessionError::MissingMatrices)?;
            if cal.received.len() != total {
                return Err(SessionError::SamplesIncomplete {
                    received: cal.received.len(),
                    total,
                });
            }
        }

        let solution = self.solve_current(&params)?;
        let zeros = solution.zeros_u64();
        let factors = solution.factors_f32();
        let ieee: Vec<String> = factors.iter().map(|&f| ieee754::to_hex(f)).collect();

        {
            let mut link = self.inner.link.lock();
            let link = link.as_mut().ok_or(SessionError::NotConnected)?;
            let channels = link.bus.channels();
            for (index, bar) in link.params.bars.iter_mut().enumerate() {
                bar.lc = (0..channels)
                    .map(|lc| {
                        let k = index * channels + lc;
                        LoadCell {
                            zero: zeros.get(k).copied().unwrap_or(0),
                            factor: factors.get(k).copied().unwrap_or(1.0),
                            ieee: ieee.get(k).cloned().unwrap_or_default(),
                        }
                    })
                    .collect();
            }
        }

        let report = ComputeReport {
            error: solution.error,
            channels: factors.len(),
            zeros,
            factors,
            ieee,
        };
        info!(target: "barcal::session", error = report.error, channels = report.channels, "calibration computed");
        self.inner.calibration.lock().solution = Some(solution);
        self.inner.events.emit(SessionEvent::Computed {
            error: report.error,
            channels: report.channels,
        });
        Ok(report)
    }

    /// Diagnostic matrices for the data collected so far; changes nothing.
    pub fn matrices(&self) -> SessionResult<CalibrationMatrices> {
        let (_, params) = self.link()?;
        let solution = self.solve_current(&params)?;
        Ok(CalibrationMatrices::from(&solution))
    }

    // =========================================================================
    // Flash
    // =========================================================================

    /// Flashes the calibration computed in this session.
    ///
    /// Refused while any operation is running.
    pub async fn flash_calibration(&self) -> SessionResult<u64> {
        let (bus, params) = self.link()?;
        check_layout(&bus, &params)?;
        let policy = self.inner.settings.flash.clone();
        self.begin(OperationKind::CalibrationFlash, true, None, move |ctx| async move {
            flash_parameters(&bus, &params, &policy, &ctx).await
        })
        .await
    }

    /// Flashes a calibrated descriptor, superseding any running operation.
    pub async fn flash(&self, params: Parameters) -> SessionResult<u64> {
        let (bus, _) = self.link()?;
        check_layout(&bus, &params)?;
        let policy = self.inner.settings.flash.clone();
        self.begin(OperationKind::Flash, false, None, move |ctx| async move {
            flash_parameters(&bus, &params, &policy, &ctx).await
        })
        .await
    }

    // =========================================================================
    // Test mode
    // =========================================================================

    /// Starts the live weight loop; `None` uses the configured defaults.
    pub async fn start_test(&self, config: Option<TestConfig>) -> SessionResult<u64> {
        let (bus, mut params) = self.link()?;
        let config = config.unwrap_or(self.inner.settings.test);
        let control = Arc::new(TestControl::new(config));
        let loop_control = Arc::clone(&control);
        let inner = Arc::clone(&self.inner);
        self.begin(OperationKind::Test, false, Some(control), move |ctx| async move {
            test_mode::run_test(&bus, &mut params, &loop_control, &ctx, |readings| {
                inner.hold_readings(readings)
            })
            .await
        })
        .await
    }

    fn running_test(&self) -> SessionResult<Arc<TestControl>> {
        self.inner
            .active
            .lock()
            .as_ref()
            .and_then(|op| op.test.as_ref().map(Arc::clone))
            .ok_or(SessionError::TestInactive)
    }

    /// Changes tick, read timeout and debug flag of the running test.
    pub fn reconfigure_test(&self, config: TestConfig) -> SessionResult<()> {
        let control = self.running_test()?;
        control.apply(config);
        debug!(target: "barcal::session", ?config, "test reconfigured");
        Ok(())
    }

    /// Asks the running test to re-collect zeros.
    ///
    /// The collection runs inside the test task, so stopping the test stops
    /// it too. A request while zeros are already being collected is ignored.
    pub fn rezero(&self) -> SessionResult<()> {
        let control = self.running_test()?;
        if !control.request_rezero() {
            debug!(target: "barcal::session", "rezero already pending");
        }
        Ok(())
    }
}
