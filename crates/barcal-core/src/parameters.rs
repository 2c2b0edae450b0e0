//! Device/session descriptor (`config.json`) and calibrated artifact.
//!
//! The JSON schema is shared with existing tooling, hence the UPPERCASE keys:
//!
//! ```json
//! {
//!   "SERIAL": { "PORT": "/dev/ttyUSB0", "BAUDRATE": 115200, "COMMAND": "A" },
//!   "VERSION": { "ID": 3, "MAJOR": 1, "MINOR": 7 },
//!   "WEIGHT": 1000, "AVG": 100, "IGNORE": 50, "DEBUG": false,
//!   "BARS": [ { "ID": 1, "LCS": 3 }, { "ID": 2, "LCS": 3 } ]
//! }
//! ```
//!
//! A calibrated artifact is the same document with `LC` arrays populated and
//! only `SERIAL`, `BARS`, `AVG`, `IGNORE` and `DEBUG` retained.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Highest number of load-cell slots a bar exposes on the wire.
pub const MAX_LOAD_CELLS: usize = 4;

/// Averaging sample count used when `AVG` is unset.
pub const DEFAULT_AVG: u32 = 100;

/// Warm-up sample count used when neither `IGNORE` nor `AVG` is set.
pub const DEFAULT_IGNORE: u32 = 50;

/// Number of set bits in an `LCS` bitmask.
pub fn active_channels(lcs: u8) -> usize {
    lcs.count_ones() as usize
}

/// Full device/session descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct Parameters {
    /// Transport settings.
    #[serde(default)]
    pub serial: Option<SerialSettings>,
    /// Expected firmware version, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<FirmwareVersion>,
    /// Calibration weight magnitude.
    #[serde(default)]
    pub weight: u32,
    /// Averaging sample count.
    #[serde(default)]
    pub avg: u32,
    /// Warm-up sample count (falls back to `avg`).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ignore: u32,
    /// Verbose diagnostics.
    #[serde(default)]
    pub debug: bool,
    /// Bars on the bus, in calibration order.
    #[serde(default)]
    pub bars: Vec<Bar>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

/// Transport settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct SerialSettings {
    /// OS port name; may be blank (auto-detect).
    #[serde(default)]
    pub port: String,
    /// Baud rate.
    pub baudrate: u32,
    /// ADC read command payload.
    pub command: String,
}

/// Firmware version triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct FirmwareVersion {
    /// Product ID.
    pub id: i32,
    /// Major revision.
    pub major: i32,
    /// Minor revision.
    pub minor: i32,
}

impl FirmwareVersion {
    /// All fields zero, i.e. nothing expected.
    pub fn is_unset(&self) -> bool {
        self.id == 0 && self.major == 0 && self.minor == 0
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.id, self.major, self.minor)
    }
}

/// One physical bar on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct Bar {
    /// Bus address (0-9 in practice).
    pub id: u8,
    /// Active load-cell bitmask, bit `i` = slot `i`.
    pub lcs: u8,
    /// Calibration records, one per active channel, once computed or read back.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lc: Vec<LoadCell>,
}

impl Bar {
    /// Bar with no calibration records.
    pub fn new(id: u8, lcs: u8) -> Self {
        Self {
            id,
            lcs,
            lc: Vec::new(),
        }
    }

    /// Number of active channels.
    pub fn channels(&self) -> usize {
        active_channels(self.lcs)
    }

    /// Whether wire slot `slot` (0..4) is active.
    pub fn slot_active(&self, slot: usize) -> bool {
        slot < 8 && self.lcs & (1 << slot) != 0
    }
}

/// Per-channel calibration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct LoadCell {
    /// Baseline ADC reading with no load.
    pub zero: u64,
    /// Scale factor, `(raw - zero) * factor` = weight.
    pub factor: f32,
    /// `factor` as 8 uppercase hex digits of its IEEE-754 bit pattern.
    pub ieee: String,
}

impl Parameters {
    /// Parses a descriptor and applies [`Parameters::normalize`].
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut params: Parameters = serde_json::from_slice(raw)?;
        params.normalize();
        Ok(params)
    }

    /// Reads and parses a descriptor file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path.as_ref())?;
        Self::from_json(&raw)
    }

    /// `AVG` falls back to [`DEFAULT_AVG`], then `IGNORE` to `AVG`.
    pub fn normalize(&mut self) {
        if self.avg == 0 {
            self.avg = DEFAULT_AVG;
        }
        if self.ignore == 0 {
            self.ignore = self.avg;
        }
    }

    /// Checks everything that must hold before the bus is opened.
    ///
    /// Returns the common number of active channels per bar.
    pub fn validate(&self) -> Result<usize, ConfigError> {
        self.serial()?;
        let first = self.bars.first().ok_or(ConfigError::NoBars)?;
        let expected = first.channels();
        for (index, bar) in self.bars.iter().enumerate() {
            if bar.lcs == 0 || bar.lcs >> MAX_LOAD_CELLS != 0 {
                return Err(ConfigError::InvalidLcsMask {
                    bar: index,
                    lcs: bar.lcs,
                });
            }
            if bar.channels() != expected {
                return Err(ConfigError::ChannelCountMismatch {
                    bar: index,
                    expected,
                    got: bar.channels(),
                });
            }
        }
        Ok(expected)
    }

    /// The `SERIAL` section.
    pub fn serial(&self) -> Result<&SerialSettings, ConfigError> {
        self.serial.as_ref().ok_or(ConfigError::MissingSerial)
    }

    /// Configured port name, trimmed; empty when unset.
    pub fn port(&self) -> &str {
        self.serial.as_ref().map(|s| s.port.trim()).unwrap_or("")
    }

    /// Replaces `SERIAL.PORT`.
    pub fn set_port(&mut self, port: impl Into<String>) {
        if let Some(serial) = self.serial.as_mut() {
            serial.port = port.into();
        }
    }

    /// Whether every bar carries calibration records.
    pub fn has_factors(&self) -> bool {
        !self.bars.is_empty() && self.bars.iter().all(|b| !b.lc.is_empty())
    }

    /// Serializes the calibrated artifact (pretty JSON).
    pub fn calibrated_json(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "UPPERCASE")]
        struct Calibrated<'a> {
            serial: &'a Option<SerialSettings>,
            bars: &'a [Bar],
            avg: u32,
            ignore: u32,
            debug: bool,
        }
        serde_json::to_string_pretty(&Calibrated {
            serial: &self.serial,
            bars: &self.bars,
            avg: self.avg,
            ignore: self.ignore,
            debug: self.debug,
        })
    }
}

/// Rewrites `SERIAL.PORT` inside a raw descriptor, leaving every other key as written.
pub fn rewrite_serial_port(raw: &[u8], port: &str) -> Result<Vec<u8>, ConfigError> {
    let mut doc: serde_json::Value = serde_json::from_slice(raw)?;
    let serial = doc
        .get_mut("SERIAL")
        .and_then(|s| s.as_object_mut())
        .ok_or(ConfigError::MissingSerial)?;
    serial.insert("PORT".into(), serde_json::Value::String(port.to_string()));
    Ok(serde_json::to_vec_pretty(&doc)?)
}

/// Name of the calibrated artifact written next to `config`: `foo.json` -> `foo_calibrated.json`.
pub fn calibrated_file_name(config: &Path) -> String {
    let stem = config
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "config".to_string());
    format!("{}_calibrated.json", stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "SERIAL": { "PORT": "COM4", "BAUDRATE": 115200, "COMMAND": "A" },
        "VERSION": { "ID": 3, "MAJOR": 1, "MINOR": 7 },
        "WEIGHT": 1000,
        "AVG": 20,
        "DEBUG": true,
        "BARS": [ { "ID": 1, "LCS": 3 }, { "ID": 2, "LCS": 12 } ]
    }"#;

    #[test]
    fn test_parse_and_normalize() {
        let p = Parameters::from_json(SAMPLE.as_bytes()).unwrap();
        assert_eq!(p.ignore, 20, "IGNORE falls back to AVG");
        assert_eq!(p.port(), "COM4");
        assert_eq!(p.version.unwrap().to_string(), "3.1.7");
        assert_eq!(p.validate().unwrap(), 2);
    }

    #[test]
    fn test_avg_defaults_when_unset() {
        let p = Parameters::from_json(br#"{"BARS":[]}"#).unwrap();
        assert_eq!((p.avg, p.ignore), (DEFAULT_AVG, DEFAULT_AVG));
    }

    #[test]
    fn test_channel_count_mismatch_rejected() {
        let mut p = Parameters::from_json(SAMPLE.as_bytes()).unwrap();
        p.bars[1].lcs = 0b0111;
        match p.validate() {
            Err(ConfigError::ChannelCountMismatch { bar, expected, got }) => {
                assert_eq!((bar, expected, got), (1, 2, 3));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_missing_sections() {
        let p = Parameters::from_json(br#"{"BARS":[{"ID":1,"LCS":1}]}"#).unwrap();
        assert!(matches!(p.validate(), Err(ConfigError::MissingSerial)));

        let p = Parameters::from_json(br#"{"SERIAL":{"BAUDRATE":9600,"COMMAND":"A"}}"#).unwrap();
        assert!(matches!(p.validate(), Err(ConfigError::NoBars)));

        let p = Parameters::from_json(
            br#"{"SERIAL":{"BAUDRATE":9600,"COMMAND":"A"},"BARS":[{"ID":1,"LCS":16}]}"#,
        )
        .unwrap();
        assert!(matches!(
            p.validate(),
            Err(ConfigError::InvalidLcsMask { bar: 0, lcs: 16 })
        ));
    }

    #[test]
    fn test_calibrated_json_keeps_only_artifact_keys() {
        let mut p = Parameters::from_json(SAMPLE.as_bytes()).unwrap();
        p.bars[0].lc = vec![LoadCell {
            zero: 8_000_000,
            factor: 0.5,
            ieee: "3F000000".into(),
        }];
        let doc: serde_json::Value = serde_json::from_str(&p.calibrated_json().unwrap()).unwrap();
        let keys: Vec<_> = doc.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 5);
        for key in ["SERIAL", "BARS", "AVG", "IGNORE", "DEBUG"] {
            assert!(doc.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(doc["BARS"][0]["LC"][0]["IEEE"], "3F000000");
        assert!(doc["BARS"][1].get("LC").is_none());
    }

    #[test]
    fn test_rewrite_serial_port_preserves_other_keys() {
        let out = rewrite_serial_port(SAMPLE.as_bytes(), "/dev/ttyUSB1").unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(doc["SERIAL"]["PORT"], "/dev/ttyUSB1");
        assert_eq!(doc["SERIAL"]["BAUDRATE"], 115200);
        assert_eq!(doc["WEIGHT"], 1000);
    }

    #[test]
    fn test_calibrated_file_name() {
        assert_eq!(
            calibrated_file_name(Path::new("/tmp/shelf.json")),
            "shelf_calibrated.json"
        );
    }

    #[test]
    fn test_slot_activity() {
        let bar = Bar::new(1, 0b1010);
        assert_eq!(bar.channels(), 2);
        assert!(!bar.slot_active(0));
        assert!(bar.slot_active(1));
        assert!(bar.slot_active(3));
    }
}
