//! Serial port enumeration and bar-bus auto-detection.
//!
//! Detection probes ports in a fixed order and stops at the first one where
//! bar 0 answers a version query:
//!
//! 1. the configured (preferred) port,
//! 2. every enumerated port except the preferred one,
//! 3. only when enumeration found nothing and only on Windows, `COM1`..`COM64`.
//!
//! Every step is recorded in a human-readable trace that front ends show when
//! nothing responded.

use async_trait::async_trait;
use barcal_core::Parameters;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Highest COM port number tried by the legacy scan.
pub const LEGACY_COM_PORTS: u32 = 64;

// =============================================================================
// Enumeration
// =============================================================================

/// Device-node prefixes tried when the OS enumerator returns nothing.
pub fn fallback_prefixes() -> &'static [&'static str] {
    if cfg!(target_os = "macos") {
        &["cu.", "tty."]
    } else if cfg!(target_os = "linux") {
        &["ttyUSB", "ttyACM", "tty."]
    } else {
        &[]
    }
}

/// Entries of `dir` whose file name starts with one of `prefixes`, as full paths.
pub fn scan_device_nodes(dir: &Path, prefixes: &[&str]) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            prefixes.iter().any(|p| name.starts_with(p))
        })
        .map(|e| e.path().to_string_lossy().into_owned())
        .collect()
}

fn enumerate_os_ports() -> Vec<String> {
    #[cfg(feature = "serial")]
    {
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                debug!(target: "barcal::discovery", "port enumeration failed: {}", e);
                Vec::new()
            }
        }
    }
    #[cfg(not(feature = "serial"))]
    {
        Vec::new()
    }
}

/// Serial ports present on this machine, sorted and deduplicated.
pub fn list_ports() -> Vec<String> {
    let mut ports = enumerate_os_ports();
    if ports.is_empty() {
        ports = scan_device_nodes(Path::new("/dev"), fallback_prefixes());
    }
    ports.sort();
    ports.dedup();
    ports
}

// =============================================================================
// Probing
// =============================================================================

/// Decides whether a bar bus answers on a port.
#[async_trait]
pub trait PortProber: Send + Sync {
    /// `Ok(())` when the bus answered; otherwise a short reason for the trace.
    async fn probe(&self, port: &str) -> Result<(), String>;
}

/// Probes by asking the first bar for its version.
#[derive(Debug, Clone)]
pub struct VersionProbe {
    /// Address of the bar queried.
    pub bar_id: u8,
    /// Baud rate to open with.
    pub baud: u32,
    /// Pause between opening and the first query.
    pub settle: Duration,
    /// Queries per port.
    pub attempts: u32,
    /// Timeout per query.
    pub timeout: Duration,
    /// Pause between queries.
    pub gap: Duration,
}

impl VersionProbe {
    /// Probe for the first bar of `params`.
    pub fn for_parameters(params: &Parameters) -> Option<Self> {
        let serial = params.serial.as_ref()?;
        let bar = params.bars.first()?;
        Some(Self {
            bar_id: bar.id,
            baud: serial.baudrate,
            settle: Duration::from_millis(40),
            attempts: 2,
            timeout: Duration::from_millis(350),
            gap: Duration::from_millis(80),
        })
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl PortProber for VersionProbe {
    async fn probe(&self, port: &str) -> Result<(), String> {
        use crate::protocol;
        use crate::transport::Transport;

        let mut link = Transport::open(port, self.baud)
            .await
            .map_err(|e| e.to_string())?;
        tokio::time::sleep(self.settle).await;

        let command = protocol::build_command(self.bar_id, protocol::CMD_VERSION);
        let mut last = String::from("no attempts");
        for attempt in 1..=self.attempts.max(1) {
            match link.send_command(&command, self.timeout).await {
                Ok(raw) => match protocol::validate_reply(&raw, &command) {
                    Ok(payload) if payload.contains("Version") => {
                        link.close().await;
                        return Ok(());
                    }
                    Ok(payload) => last = format!("unexpected reply {:?}", payload),
                    Err(e) => last = e.to_string(),
                },
                Err(e) => last = e.to_string(),
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.gap).await;
            }
        }
        link.close().await;
        Err(last)
    }
}

// =============================================================================
// Detection
// =============================================================================

/// Result of a detection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectOutcome {
    /// First port that answered.
    pub port: Option<String>,
    /// One line per step taken.
    pub trace: Vec<String>,
}

/// Probes `preferred`, then `enumerated`, then (if allowed) the legacy COM range.
pub async fn detect_port(
    prober: &dyn PortProber,
    preferred: &str,
    enumerated: &[String],
    legacy_scan: bool,
) -> DetectOutcome {
    let mut outcome = DetectOutcome::default();
    let preferred = preferred.trim();

    if !preferred.is_empty() && try_port(prober, preferred, &mut outcome).await {
        return outcome;
    }

    if enumerated.is_empty() {
        outcome.trace.push("enumeration: no ports".to_string());
    } else {
        outcome
            .trace
            .push(format!("enumeration: {}", enumerated.join(", ")));
    }
    for port in enumerated {
        if port.eq_ignore_ascii_case(preferred) {
            continue;
        }
        if try_port(prober, port, &mut outcome).await {
            return outcome;
        }
    }

    if enumerated.is_empty() && legacy_scan {
        outcome
            .trace
            .push(format!("legacy scan: COM1..COM{}", LEGACY_COM_PORTS));
        for n in 1..=LEGACY_COM_PORTS {
            let port = format!("COM{}", n);
            if port.eq_ignore_ascii_case(preferred) {
                continue;
            }
            if try_port(prober, &port, &mut outcome).await {
                return outcome;
            }
        }
    }

    outcome.trace.push("no port responded".to_string());
    outcome
}

async fn try_port(prober: &dyn PortProber, port: &str, outcome: &mut DetectOutcome) -> bool {
    match prober.probe(port).await {
        Ok(()) => {
            info!(target: "barcal::discovery", port, "bar bus found");
            outcome.trace.push(format!("{}: ok", port));
            outcome.port = Some(port.to_string());
            true
        }
        Err(reason) => {
            debug!(target: "barcal::discovery", port, "probe failed: {}", reason);
            outcome.trace.push(format!("{}: {}", port, reason));
            false
        }
    }
}

/// Detection for a descriptor on this machine.
///
/// Returns an empty outcome when the descriptor has no `SERIAL` section or no bars.
#[cfg(feature = "serial")]
pub async fn auto_detect(params: &Parameters) -> DetectOutcome {
    let Some(probe) = VersionProbe::for_parameters(params) else {
        return DetectOutcome::default();
    };
    let ports = list_ports();
    detect_port(&probe, params.port(), &ports, cfg!(windows)).await
}
