//! Driver for a chain of load-cell bars on one RS-485 link.
//!
//! Every operation is one framed round trip to one bar (or, for the raw
//! update-mode handshake, to the whole bus). The link is held by an async
//! mutex for the duration of a round trip, so callers on different tasks
//! never interleave frames.
//!
//! ## Timing
//!
//! Timeouts follow what the firmware needs, see [`BusTimings`]. Each round
//! trip waits `timeout / 2` after writing before it starts reading.

use crate::protocol::{self, EULER_HANDSHAKE};
use crate::transport::Transport;
use barcal_core::{
    hex_dump, Bar, BusError, BusResult, ConfigError, FirmwareVersion, Parameters,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Per-command timeouts in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusTimings {
    /// ADC read (tolerant path).
    pub adc_ms: u64,
    /// `V` query.
    pub version_ms: u64,
    /// `O` / `X` writes.
    pub write_ms: u64,
    /// Factor read-back.
    pub factors_ms: u64,
    /// Raw bus-wide update handshake.
    pub handshake_ms: u64,
    /// Framed per-bar update handshake.
    pub bar_handshake_ms: u64,
    /// `R` reboot.
    pub reboot_ms: u64,
    /// Quiet period after priming the bootloaders.
    pub prime_ms: u64,
}

impl Default for BusTimings {
    fn default() -> Self {
        Self {
            adc_ms: 200,
            version_ms: 200,
            write_ms: 200,
            factors_ms: 300,
            handshake_ms: 1000,
            bar_handshake_ms: 400,
            reboot_ms: 200,
            prime_ms: 50,
        }
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// Outcome of a per-bar version query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarVersion {
    /// Zero-based bar index.
    pub bar: usize,
    /// Bus address.
    pub id: u8,
    /// Reported version, if the query succeeded.
    pub version: Option<FirmwareVersion>,
    /// Query failure, if any.
    pub error: Option<String>,
    /// Product ID differs from the configured one (error).
    pub id_mismatch: bool,
    /// Major or minor differs (warning).
    pub revision_mismatch: bool,
}

impl BarVersion {
    /// Usable: answered and the product ID matches.
    pub fn is_ok(&self) -> bool {
        self.version.is_some() && !self.id_mismatch
    }
}

/// A validated bus: topology from the descriptor plus the open link.
#[derive(Debug)]
pub struct BarBus {
    link: Mutex<Transport>,
    port: String,
    bars: Vec<Bar>,
    channels: usize,
    adc_command: Vec<u8>,
    timings: BusTimings,
}

impl BarBus {
    /// Builds a driver over an open link.
    ///
    /// # Errors
    /// Any [`ConfigError`] from [`Parameters::validate`].
    pub fn new(link: Transport, params: &Parameters, timings: BusTimings) -> Result<Self, ConfigError> {
        let channels = params.validate()?;
        let adc_command = params.serial()?.command.as_bytes().to_vec();
        let bars = params
            .bars
            .iter()
            .map(|b| Bar::new(b.id, b.lcs))
            .collect();
        Ok(Self {
            port: link.name().to_string(),
            link: Mutex::new(link),
            bars,
            channels,
            adc_command,
            timings,
        })
    }

    /// Validates `params`, then opens `SERIAL.PORT`.
    #[cfg(feature = "serial")]
    pub async fn open(params: &Parameters, timings: BusTimings) -> BusResult<Self> {
        params.validate()?;
        let serial = params.serial()?;
        let port = params.port();
        if port.is_empty() {
            return Err(ConfigError::MissingPort.into());
        }
        let link = Transport::open(port, serial.baudrate).await?;
        debug!(target: "barcal::bus", port, baud = serial.baudrate, bars = params.bars.len(), "bus opened");
        Ok(Self::new(link, params, timings)?)
    }

    /// Port name the link was opened on.
    pub fn port_name(&self) -> &str {
        &self.port
    }

    /// Number of bars.
    pub fn bar_count(&self) -> usize {
        self.bars.len()
    }

    /// Active channels per bar.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Bus topology (no calibration records).
    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    /// Configured timeouts.
    pub fn timings(&self) -> &BusTimings {
        &self.timings
    }

    fn bar(&self, index: usize) -> BusResult<&Bar> {
        self.bars.get(index).ok_or(BusError::BarIndex {
            index,
            bars: self.bars.len(),
        })
    }

    /// Framed round trip for an ASCII reply; returns `(command, raw reply)`.
    async fn round_trip(
        &self,
        index: usize,
        payload: &[u8],
        timeout: Duration,
    ) -> BusResult<(Vec<u8>, Vec<u8>)> {
        let bar = self.bar(index)?;
        let command = protocol::build_command(bar.id, payload);
        let raw = self.link.lock().await.send_command(&command, timeout).await?;
        Ok((command, raw))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Raw readings of bar `index`, one per active channel.
    ///
    /// Transport failures propagate; a reply that fails validation yields an
    /// empty vector so polling loops can treat it as "no data this tick".
    #[instrument(skip(self), level = "trace")]
    pub async fn read_channels(&self, index: usize) -> BusResult<Vec<u64>> {
        let lcs = self.bar(index)?.lcs;
        let (command, raw) = self
            .round_trip(index, &self.adc_command, ms(self.timings.adc_ms))
            .await?;
        match protocol::validate_reply(&raw, &command) {
            Ok(payload) => Ok(protocol::parse_channels(&payload, lcs)),
            Err(e) => {
                debug!(target: "barcal::bus", bar = index, "ADC reply dropped: {}", e);
                Ok(Vec::new())
            }
        }
    }

    /// Like [`read_channels`](Self::read_channels) but every failure is an error.
    #[instrument(skip(self), level = "trace")]
    pub async fn read_channels_strict(&self, index: usize, timeout: Duration) -> BusResult<Vec<u64>> {
        let lcs = self.bar(index)?.lcs;
        let (command, raw) = self.round_trip(index, &self.adc_command, timeout).await?;
        if raw.is_empty() {
            return Err(BusError::EmptyReply);
        }
        let payload = protocol::validate_reply(&raw, &command)?;
        let values = protocol::parse_channels(&payload, lcs);
        if values.is_empty() {
            return Err(BusError::EmptyReply);
        }
        Ok(values)
    }

    /// Firmware version of bar `index`.
    #[instrument(skip(self), level = "debug", err)]
    pub async fn read_version(&self, index: usize) -> BusResult<FirmwareVersion> {
        let (command, raw) = self
            .round_trip(index, protocol::CMD_VERSION, ms(self.timings.version_ms))
            .await?;
        let payload = protocol::validate_reply(&raw, &command)?;
        protocol::parse_version(&payload).ok_or(BusError::InvalidVersion(payload))
    }

    /// Reads bar 0's version and compares it with `expected`.
    ///
    /// Returns a warning text on mismatch; an unset expectation never warns.
    pub async fn check_version(&self, expected: Option<FirmwareVersion>) -> BusResult<Option<String>> {
        let device = self.read_version(0).await?;
        Ok(version_warning(device, expected))
    }

    /// Reads every bar's version and compares it with `expected`.
    ///
    /// A product ID mismatch is an error for that bar; major/minor
    /// differences are reported as warnings. A zero component of `expected`
    /// is unspecified and matches anything. Read failures are recorded, not
    /// returned.
    pub async fn check_versions(&self, expected: Option<FirmwareVersion>) -> Vec<BarVersion> {
        let expected = expected.filter(|v| !v.is_unset());
        let mut report = Vec::with_capacity(self.bars.len());
        for (index, bar) in self.bars.iter().enumerate() {
            let mut entry = BarVersion {
                bar: index,
                id: bar.id,
                version: None,
                error: None,
                id_mismatch: false,
                revision_mismatch: false,
            };
            match self.read_version(index).await {
                Ok(v) => {
                    if let Some(want) = expected {
                        let differs = |want: i32, got: i32| want != 0 && want != got;
                        entry.id_mismatch = differs(want.id, v.id);
                        entry.revision_mismatch = differs(want.major, v.major) || differs(want.minor, v.minor);
                    }
                    entry.version = Some(v);
                }
                Err(e) => entry.error = Some(e.to_string()),
            }
            if entry.revision_mismatch && !entry.id_mismatch {
                warn!(target: "barcal::bus", bar = index, "firmware revision differs from configuration");
            }
            report.push(entry);
        }
        report
    }

    /// Factors stored on bar `index`, one per active channel.
    ///
    /// The reply is binary, so completion is decided by CRC and not by the
    /// first newline.
    #[instrument(skip(self), level = "debug", err)]
    pub async fn read_factors(&self, index: usize) -> BusResult<Vec<f32>> {
        let bar = self.bar(index)?;
        let channels = bar.channels();
        let command = protocol::build_command(bar.id, protocol::CMD_READ_FACTORS);
        let timeout = ms(self.timings.factors_ms);
        let result = self
            .link
            .lock()
            .await
            .exchange(&command, timeout, |buf| {
                protocol::binary_reply_complete(buf, channels)
            })
            .await;
        let raw = match result {
            Ok(raw) => raw,
            // a CRC-bad reply never completes; decode what arrived for the diagnostics
            Err(BusError::Timeout { len, raw_hex }) if len > 0 => {
                return Err(match decode_hex(&raw_hex) {
                    Some(raw) => match protocol::decode_factor_reply(&raw, &command, channels) {
                        Err(e) => e.into(),
                        Ok(_) => BusError::Timeout { len, raw_hex },
                    },
                    None => BusError::Timeout { len, raw_hex },
                });
            }
            Err(e) => return Err(e),
        };
        Ok(protocol::decode_factor_reply(&raw, &command, channels)?)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    async fn acknowledged(
        &self,
        index: usize,
        payload: &[u8],
        timeout: Duration,
        token: &str,
        command: &'static str,
    ) -> BusResult<()> {
        let (_, raw) = self.round_trip(index, payload, timeout).await?;
        let text = String::from_utf8_lossy(&raw);
        if text.contains(token) {
            Ok(())
        } else {
            Err(BusError::NotAcknowledged {
                bar: index,
                command,
                reply: text.trim().to_string(),
            })
        }
    }

    /// Writes zeros and the bar total (`O`), requires `OK`.
    #[instrument(skip(self, zeros), level = "debug", err)]
    pub async fn write_zeros(&self, index: usize, zeros: &[f64], total: u64) -> BusResult<()> {
        let payload = protocol::zeros_payload(self.bar(index)?, zeros, total);
        self.acknowledged(index, &payload, ms(self.timings.write_ms), "OK", "zeros")
            .await
    }

    /// Writes scale factors (`X` with arguments), requires `OK`.
    #[instrument(skip(self, factors), level = "debug", err)]
    pub async fn write_factors(&self, index: usize, factors: &[f64]) -> BusResult<()> {
        let payload = protocol::factors_payload(self.bar(index)?, factors);
        self.acknowledged(index, &payload, ms(self.timings.write_ms), "OK", "factors")
            .await
    }

    /// Reboots bar `index` (`R`), requires `Rebooting`.
    #[instrument(skip(self), level = "debug", err)]
    pub async fn reboot(&self, index: usize) -> BusResult<()> {
        self.acknowledged(
            index,
            protocol::CMD_REBOOT,
            ms(self.timings.reboot_ms),
            "Rebooting",
            "reboot",
        )
        .await
    }

    /// Reboots every bar, `gap` apart; failures are logged and skipped.
    pub async fn reboot_all(&self, gap: Duration) {
        for index in 0..self.bars.len() {
            if let Err(e) = self.reboot(index).await {
                warn!(target: "barcal::bus", bar = index, "reboot failed: {}", e);
            }
            tokio::time::sleep(gap).await;
        }
    }

    // =========================================================================
    // Update mode
    // =========================================================================

    /// Sends the raw handshake to the whole bus; some bar must answer `Enter`.
    #[instrument(skip(self), level = "debug", err)]
    pub async fn enter_update_mode(&self) -> BusResult<()> {
        let raw = self
            .link
            .lock()
            .await
            .send_command(EULER_HANDSHAKE, ms(self.timings.handshake_ms))
            .await?;
        expect_enter(&raw)
    }

    /// Sends the framed handshake to bar `index`; it must answer `Enter`.
    #[instrument(skip(self), level = "debug", err)]
    pub async fn enter_update_mode_bar(&self, index: usize) -> BusResult<()> {
        let (_, raw) = self
            .round_trip(index, EULER_HANDSHAKE, ms(self.timings.bar_handshake_ms))
            .await?;
        expect_enter(&raw)
    }

    /// Primes the bootloaders with a lone `0x0D` and swallows any chatter.
    pub async fn prime_bootloaders(&self) -> BusResult<()> {
        let mut link = self.link.lock().await;
        link.write(&[protocol::BOOTLOADER_PRIME]).await?;
        let flushed = link.drain(ms(self.timings.prime_ms)).await;
        debug!(target: "barcal::bus", bytes = flushed, "bootloaders primed");
        Ok(())
    }

    /// Discards pending input for `timeout`.
    pub async fn drain(&self, timeout: Duration) -> usize {
        self.link.lock().await.drain(timeout).await
    }

    /// Shuts the link down.
    pub async fn close(&self) {
        self.link.lock().await.close().await;
    }
}

fn expect_enter(raw: &[u8]) -> BusResult<()> {
    let text = String::from_utf8_lossy(raw);
    if text.contains("Enter") {
        Ok(())
    } else {
        Err(BusError::HandshakeRejected {
            len: raw.len(),
            raw_hex: hex_dump(raw),
            text: text.trim().to_string(),
        })
    }
}

fn decode_hex(dump: &str) -> Option<Vec<u8>> {
    dump.split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).ok())
        .collect()
}

/// Mismatch warning between the device and the configured version.
pub fn version_warning(device: FirmwareVersion, expected: Option<FirmwareVersion>) -> Option<String> {
    let expected = expected.filter(|v| !v.is_unset())?;
    (device != expected).then(|| {
        format!(
            "Version mismatch: device {}, config {}",
            device, expected
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mock_serial;
    use crate::drivers::simulated::SimulatedBus;
    use barcal_core::{FrameError, SerialSettings};

    fn params(bars: &[(u8, u8)]) -> Parameters {
        Parameters {
            serial: Some(SerialSettings {
                port: "sim".into(),
                baudrate: 115_200,
                command: "A".into(),
            }),
            version: None,
            weight: 1000,
            avg: 4,
            ignore: 2,
            debug: false,
            bars: bars.iter().map(|&(id, lcs)| Bar::new(id, lcs)).collect(),
        }
    }

    fn simulated(bars: &[(u8, u8)]) -> (BarBus, SimulatedBus) {
        let p = params(bars);
        let (port, sim) = SimulatedBus::spawn(&p);
        let bus = BarBus::new(Transport::new(port, "sim"), &p, BusTimings::default()).unwrap();
        (bus, sim)
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_channels_exact_frames() {
        let p = params(&[(1, 0b0011)]);
        let (port, mut script) = mock_serial::new();
        let bus = BarBus::new(Transport::new(Box::new(port), "mock"), &p, BusTimings::default())
            .unwrap();

        let device = tokio::spawn(async move {
            script.expect_and_reply(1, b"A", b"8000100|7999900|0|0").await;
            script
        });
        assert_eq!(bus.read_channels(0).await.unwrap(), vec![8_000_100, 7_999_900]);
        device.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerant_and_strict_reads_on_corrupt_reply() {
        let (bus, sim) = simulated(&[(1, 0b0011)]);
        sim.set_readings(0, vec![10, 20]);

        sim.with_bar(0, |b| b.corrupt_replies = 1);
        assert!(bus.read_channels(0).await.unwrap().is_empty());

        sim.with_bar(0, |b| b.corrupt_replies = 1);
        let err = bus
            .read_channels_strict(0, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Frame(FrameError::CrcMismatch { .. })));

        assert_eq!(
            bus.read_channels_strict(0, Duration::from_millis(200)).await.unwrap(),
            vec![10, 20]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_bar_times_out() {
        let (bus, sim) = simulated(&[(1, 0b0001), (2, 0b0001)]);
        sim.with_bar(1, |b| b.silent = true);
        let err = bus.read_channels(1).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout { len: 0, .. }));
        assert!(err.is_transport());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bar_index_checked() {
        let (bus, _sim) = simulated(&[(1, 0b0001)]);
        assert!(matches!(
            bus.read_channels(3).await,
            Err(BusError::BarIndex { index: 3, bars: 1 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_and_mismatch_warning() {
        let (bus, sim) = simulated(&[(1, 0b0001)]);
        sim.with_bar(0, |b| {
            b.version = FirmwareVersion { id: 3, major: 1, minor: 7 }
        });
        let v = bus.read_version(0).await.unwrap();
        assert_eq!(v.to_string(), "3.1.7");

        let expected = FirmwareVersion { id: 3, major: 2, minor: 0 };
        let warning = bus.check_version(Some(expected)).await.unwrap().unwrap();
        assert_eq!(warning, "Version mismatch: device 3.1.7, config 3.2.0");
        assert!(bus.check_version(Some(v)).await.unwrap().is_none());
        assert!(bus.check_version(None).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_versions_per_bar() {
        let (bus, sim) = simulated(&[(1, 0b0001), (2, 0b0001), (3, 0b0001)]);
        sim.with_bar(0, |b| b.version = FirmwareVersion { id: 3, major: 1, minor: 7 });
        sim.with_bar(1, |b| b.version = FirmwareVersion { id: 3, major: 1, minor: 8 });
        sim.with_bar(2, |b| b.silent = true);

        let report = bus
            .check_versions(Some(FirmwareVersion { id: 3, major: 1, minor: 7 }))
            .await;
        assert!(report[0].is_ok() && !report[0].revision_mismatch);
        assert!(report[1].is_ok() && report[1].revision_mismatch);
        assert!(!report[2].is_ok());
        assert!(report[2].error.as_deref().unwrap().contains("timeout"));

        let report = bus
            .check_versions(Some(FirmwareVersion { id: 4, major: 1, minor: 7 }))
            .await;
        assert!(report[0].id_mismatch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_versions_zero_component_matches_any() {
        let (bus, sim) = simulated(&[(1, 0b0001), (2, 0b0001)]);
        sim.with_bar(0, |b| b.version = FirmwareVersion { id: 3, major: 2, minor: 4 });
        sim.with_bar(1, |b| b.version = FirmwareVersion { id: 3, major: 1, minor: 9 });

        let report = bus
            .check_versions(Some(FirmwareVersion { id: 3, major: 2, minor: 0 }))
            .await;
        assert!(!report[0].revision_mismatch && !report[0].id_mismatch);
        assert!(report[1].revision_mismatch);

        let report = bus
            .check_versions(Some(FirmwareVersion { id: 0, major: 0, minor: 9 }))
            .await;
        assert!(report[0].revision_mismatch && !report[0].id_mismatch);
        assert!(!report[1].revision_mismatch && !report[1].id_mismatch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_need_update_mode() {
        let (bus, sim) = simulated(&[(1, 0b0011), (2, 0b0011)]);
        let err = bus.write_factors(0, &[0.5, 0.25]).await.unwrap_err();
        assert!(matches!(err, BusError::NotAcknowledged { command: "factors", .. }));

        bus.enter_update_mode().await.unwrap();
        bus.enter_update_mode_bar(1).await.unwrap();
        bus.prime_bootloaders().await.unwrap();
        bus.write_zeros(0, &[8_000_000.0, 7_000_000.0], 42).await.unwrap();
        bus.write_factors(0, &[0.5, 0.25]).await.unwrap();

        let state = &sim.bars()[0];
        assert_eq!(state.zeros, vec![8_000_000, 7_000_000]);
        assert_eq!(state.total, 42);
        assert_eq!(state.factors, vec![0.5, 0.25]);

        bus.reboot(0).await.unwrap();
        assert!(!sim.bars()[0].in_update);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_rejected_when_nobody_answers() {
        let (bus, sim) = simulated(&[(1, 0b0001)]);
        sim.with_bar(0, |b| b.silent = true);
        assert!(bus.enter_update_mode().await.is_err());

        let p = params(&[(1, 0b0001)]);
        let (port, mut script) = mock_serial::new();
        let bus = BarBus::new(Transport::new(Box::new(port), "mock"), &p, BusTimings::default())
            .unwrap();
        let device = tokio::spawn(async move {
            script.expect_write(EULER_HANDSHAKE).await;
            script.send_raw(b"Nope\r\n").unwrap();
            script
        });
        match bus.enter_update_mode().await {
            Err(BusError::HandshakeRejected { len, text, .. }) => {
                assert_eq!(len, 6);
                assert_eq!(text, "Nope");
            }
            other => panic!("unexpected: {other:?}"),
        }
        device.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_factors_round_trip() {
        let (bus, sim) = simulated(&[(1, 0b0101), (2, 0b0101)]);
        sim.with_bar(1, |b| b.factors = vec![0.0123, f32::from_bits(0x0A0A_0D0A)]);
        let factors = bus.read_factors(1).await.unwrap();
        assert_eq!(factors[0], 0.0123);
        assert_eq!(factors[1].to_bits(), 0x0A0A_0D0A);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_factors_reports_crc_mismatch() {
        let (bus, sim) = simulated(&[(1, 0b0001)]);
        sim.with_bar(0, |b| b.corrupt_replies = 1);
        let err = bus.read_factors(0).await.unwrap_err();
        assert!(
            matches!(err, BusError::Frame(FrameError::CrcMismatch { .. })),
            "got {err:?}"
        );
    }

    #[test]
    fn test_invalid_topology_rejected() {
        let p = params(&[(1, 0b0011), (2, 0b0001)]);
        let (port, _script) = mock_serial::new();
        let err = BarBus::new(Transport::new(Box::new(port), "mock"), &p, BusTimings::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::ChannelCountMismatch { .. }));
    }
}
