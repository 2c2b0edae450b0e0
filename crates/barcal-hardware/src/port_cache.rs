//! Remembers which port a given bus layout was last found on.
//!
//! Keys are SHA-256 digests of the bus identity (expected version, baud rate,
//! ADC command and bar ids/masks), so two descriptors for the same shelf share
//! an entry even when they live in different files. The cache is advisory:
//! a missing or corrupt file reads as empty and save failures are only logged.

use barcal_core::{ConfigError, Parameters};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Digest identifying a bus layout; `None` without a `SERIAL` section or bars.
pub fn config_key(params: &Parameters) -> Option<String> {
    #[derive(Serialize)]
    struct BarKey {
        id: u8,
        lcs: u8,
    }

    #[derive(Serialize)]
    struct Identity<'a> {
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        baud: u32,
        #[serde(skip_serializing_if = "str::is_empty")]
        command: &'a str,
        bars: Vec<BarKey>,
    }

    let serial = params.serial.as_ref()?;
    if params.bars.is_empty() {
        return None;
    }
    let identity = Identity {
        version: params
            .version
            .filter(|v| !v.is_unset())
            .map(|v| v.to_string()),
        baud: serial.baudrate,
        command: serial.command.trim(),
        bars: params
            .bars
            .iter()
            .map(|b| BarKey { id: b.id, lcs: b.lcs })
            .collect(),
    };
    let encoded = serde_json::to_vec(&identity).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Some(format!("{:x}", hasher.finalize()))
}

/// JSON-backed map from [`config_key`] to port name.
#[derive(Debug)]
pub struct PortCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl PortCache {
    /// Loads `path`; unreadable or malformed files give an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(target: "barcal::port_cache", path = %path.display(), "ignoring corrupt cache: {}", e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached port for `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    /// Cached port for the layout in `params`.
    pub fn lookup(&self, params: &Parameters) -> Option<String> {
        config_key(params).and_then(|k| self.get(&k))
    }

    /// Records `port` for `key` and rewrites the file.
    ///
    /// Empty keys or ports are ignored, as is a port equal (ignoring case) to
    /// the stored one. Returns whether the file was written.
    pub fn set(&self, key: &str, port: &str) -> Result<bool, ConfigError> {
        let port = port.trim();
        if key.is_empty() || port.is_empty() {
            return Ok(false);
        }
        let snapshot = {
            let mut entries = self.entries.lock();
            if entries
                .get(key)
                .is_some_and(|old| old.eq_ignore_ascii_case(port))
            {
                return Ok(false);
            }
            entries.insert(key.to_string(), port.to_string());
            entries.clone()
        };
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(&snapshot)?)?;
        debug!(target: "barcal::port_cache", key, port, "port cached");
        Ok(true)
    }

    /// Records the port of `params` (no-op when the layout has no key).
    pub fn remember(&self, params: &Parameters) {
        let Some(key) = config_key(params) else {
            return;
        };
        if let Err(e) = self.set(&key, params.port()) {
            warn!(target: "barcal::port_cache", path = %self.path.display(), "failed to save port cache: {}", e);
        }
    }
}
