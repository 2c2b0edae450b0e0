//! In-process bar bus for tests and dry runs.
//!
//! [`SimulatedBus::spawn`] returns a port that behaves like the RS-485 link
//! with the configured bars on it: ADC, version, zero/factor writes, factor
//! read-back, reboot and both update-mode handshakes are answered the way the
//! firmware answers them. Readings and failure injection are driven through
//! [`SimulatedBus::with_bar`] while the driver is running.

use crate::protocol::{self, EULER_HANDSHAKE};
use barcal_core::serial::DynSerial;
use barcal_core::{Bar, FirmwareVersion, Parameters, MAX_LOAD_CELLS};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

/// Longest unparsed input kept before the simulator resynchronises.
const MAX_PENDING: usize = 512;

/// State of one simulated bar.
#[derive(Debug, Clone)]
pub struct SimBar {
    /// Bus address.
    pub id: u8,
    /// Active slot mask.
    pub lcs: u8,
    /// Current raw reading per active channel.
    pub readings: Vec<u64>,
    /// Firmware version reported by `V`.
    pub version: FirmwareVersion,
    /// Zeros last written with `O` (per active channel).
    pub zeros: Vec<u64>,
    /// Total last written with `O`.
    pub total: u64,
    /// Factors held in flash (per active channel).
    pub factors: Vec<f32>,
    /// Bootloader active (handshake accepted, no reboot since).
    pub in_update: bool,
    /// Never answers anything.
    pub silent: bool,
    /// Number of upcoming ADC reads to leave unanswered.
    pub drop_reads: u32,
    /// Number of upcoming writes to answer with `ERR`.
    pub nack_writes: u32,
    /// Number of upcoming replies sent with a corrupted CRC.
    pub corrupt_replies: u32,
    /// Number of upcoming per-bar handshakes to ignore.
    pub ignore_handshakes: u32,
}

impl SimBar {
    fn from_bar(bar: &Bar) -> Self {
        let channels = bar.channels();
        Self {
            id: bar.id,
            lcs: bar.lcs,
            readings: vec![0; channels],
            version: FirmwareVersion::default(),
            zeros: vec![0; channels],
            total: 0,
            factors: vec![1.0; channels],
            in_update: false,
            silent: false,
            drop_reads: 0,
            nack_writes: 0,
            corrupt_replies: 0,
            ignore_handshakes: 0,
        }
    }

    fn adc_payload(&self) -> Vec<u8> {
        let mut active = self.readings.iter();
        let fields: Vec<String> = (0..MAX_LOAD_CELLS)
            .map(|slot| {
                if self.lcs & (1 << slot) != 0 {
                    active.next().copied().unwrap_or(0).to_string()
                } else {
                    "0".to_string()
                }
            })
            .collect();
        fields.join("|").into_bytes()
    }

    /// Active-slot fields of an `O`/`X` write payload.
    fn active_fields<'a>(&self, fields: &'a str) -> Vec<&'a str> {
        fields
            .split('|')
            .take(MAX_LOAD_CELLS)
            .enumerate()
            .filter(|(slot, _)| self.lcs & (1 << slot) != 0)
            .map(|(_, f)| f)
            .collect()
    }
}

#[derive(Debug)]
struct SimState {
    bars: Vec<SimBar>,
    adc_command: Vec<u8>,
    commands: Vec<String>,
}

/// Handle to a running simulated bus.
#[derive(Debug)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
    task: JoinHandle<()>,
}

impl SimulatedBus {
    /// Spawns the simulator for the bars in `params` and returns the driver-side port.
    pub fn spawn(params: &Parameters) -> (DynSerial, SimulatedBus) {
        let adc_command = params
            .serial
            .as_ref()
            .map(|s| s.command.as_bytes().to_vec())
            .unwrap_or_else(|| b"A".to_vec());
        let state = Arc::new(Mutex::new(SimState {
            bars: params.bars.iter().map(SimBar::from_bar).collect(),
            adc_command,
            commands: Vec::new(),
        }));
        let (host, device) = tokio::io::duplex(4096);
        let task = tokio::spawn(run_device(device, Arc::clone(&state)));
        (Box::new(host), SimulatedBus { state, task })
    }

    /// Runs `f` against bar `index` (panics on a bad index, test use only).
    pub fn with_bar<R>(&self, index: usize, f: impl FnOnce(&mut SimBar) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state.bars[index])
    }

    /// Sets the raw readings of bar `index`.
    pub fn set_readings(&self, index: usize, readings: Vec<u64>) {
        self.with_bar(index, |bar| bar.readings = readings);
    }

    /// Snapshot of every bar.
    pub fn bars(&self) -> Vec<SimBar> {
        self.state.lock().bars.clone()
    }

    /// Every command the simulator has parsed, as lossy text (`"01V"`, `"*EULER"`, ...).
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }
}

impl Drop for SimulatedBus {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Device loop
// =============================================================================

async fn run_device(mut port: DuplexStream, state: Arc<Mutex<SimState>>) {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = match port.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&chunk[..n]);

        while let Some((consumed, reply)) = next_request(&pending, &state) {
            pending.drain(..consumed);
            if let Some(reply) = reply {
                if port.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
        if pending.len() > MAX_PENDING {
            pending.clear();
        }
    }
}

/// Finds the first complete request in `pending`; returns bytes consumed and the reply.
fn next_request(pending: &[u8], state: &Mutex<SimState>) -> Option<(usize, Option<Vec<u8>>)> {
    for (i, &b) in pending.iter().enumerate() {
        if b != b'\r' {
            continue;
        }
        let candidate = &pending[..=i];
        if candidate == EULER_HANDSHAKE {
            return Some((i + 1, broadcast_handshake(&mut state.lock())));
        }
        if i >= 4 {
            let body = &pending[..i - 2];
            let crc = u16::from_be_bytes([pending[i - 2], pending[i - 1]]);
            if body[0] == b'0' && protocol::crc16(body) == crc {
                let id = body[1].wrapping_sub(b'0');
                let reply = handle_frame(&mut state.lock(), id, &body[2..]);
                return Some((i + 1, reply));
            }
        }
        if i == 0 {
            // bootloader prime or line noise
            return Some((1, None));
        }
    }
    None
}

fn broadcast_handshake(state: &mut SimState) -> Option<Vec<u8>> {
    state.commands.push("*EULER".to_string());
    let mut answered = false;
    for bar in state.bars.iter_mut().filter(|b| !b.silent) {
        bar.in_update = true;
        answered = true;
    }
    answered.then(|| b"Enter\r\n".to_vec())
}

fn handle_frame(state: &mut SimState, id: u8, payload: &[u8]) -> Option<Vec<u8>> {
    let label = if payload.starts_with(&EULER_HANDSHAKE[..8]) {
        "EULER".to_string()
    } else {
        String::from_utf8_lossy(payload).into_owned()
    };
    state.commands.push(format!("{:02}{}", id, label));

    let is_adc = payload == state.adc_command.as_slice();
    let bar = state.bars.iter_mut().find(|b| b.id == id)?;
    if bar.silent {
        return None;
    }

    let answer: Vec<u8> = if is_adc {
        if bar.drop_reads > 0 {
            bar.drop_reads -= 1;
            return None;
        }
        bar.adc_payload()
    } else if payload == protocol::CMD_VERSION {
        format!("Version {}", bar.version).into_bytes()
    } else if payload == protocol::CMD_READ_FACTORS {
        let total = bar.total as f32;
        let mut reply = protocol::build_factor_reply(id, total, &bar.factors);
        corrupt_if_requested(bar, &mut reply);
        return Some(reply);
    } else if payload == protocol::CMD_REBOOT {
        bar.in_update = false;
        b"Rebooting".to_vec()
    } else if payload.starts_with(&EULER_HANDSHAKE[..8]) {
        if bar.ignore_handshakes > 0 {
            bar.ignore_handshakes -= 1;
            return None;
        }
        bar.in_update = true;
        b"Enter".to_vec()
    } else if let Some(rest) = payload.strip_prefix(b"O") {
        acknowledge_write(bar, |bar| {
            let text = String::from_utf8_lossy(rest);
            let fields: Vec<&str> = text.split('|').collect();
            bar.zeros = bar
                .active_fields(&text)
                .iter()
                .map(|f| f.parse().unwrap_or(0))
                .collect();
            bar.total = fields
                .get(MAX_LOAD_CELLS)
                .and_then(|f| f.parse().ok())
                .unwrap_or(0);
        })
    } else if let Some(rest) = payload.strip_prefix(b"X") {
        acknowledge_write(bar, |bar| {
            let text = String::from_utf8_lossy(rest);
            bar.factors = bar
                .active_fields(&text)
                .iter()
                .map(|f| f.parse().unwrap_or(1.0))
                .collect();
        })
    } else {
        b"ERR".to_vec()
    };

    let mut reply = protocol::build_reply(id, &answer);
    corrupt_if_requested(bar, &mut reply);
    Some(reply)
}

fn acknowledge_write(bar: &mut SimBar, apply: impl FnOnce(&mut SimBar)) -> Vec<u8> {
    if !bar.in_update {
        return b"ERR locked".to_vec();
    }
    if bar.nack_writes > 0 {
        bar.nack_writes -= 1;
        return b"ERR".to_vec();
    }
    apply(bar);
    b"OK".to_vec()
}

fn corrupt_if_requested(bar: &mut SimBar, reply: &mut [u8]) {
    if bar.corrupt_replies > 0 && reply.len() >= 4 {
        bar.corrupt_replies -= 1;
        let n = reply.len();
        // last CRC byte sits before "\r\n"
        reply[n - 3] ^= 0x5A;
    }
}
