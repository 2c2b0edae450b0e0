//! Application settings, layered with figment.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. `barcal.toml` (or the file given with `--settings`)
//! 3. environment variables prefixed `BARCAL_`, nested keys separated by
//!    `__` (e.g. `BARCAL_LOG__LEVEL=debug`, `BARCAL_SESSION__FLASH__WRITE_ATTEMPTS=5`)
//!
//! The device descriptor (`config.json`) is separate and is loaded by
//! [`barcal_core::Parameters::load`].

use crate::logging::{self, LogConfig, LogFormat};
use barcal_session::SessionSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default settings file name, looked up in the working directory.
pub const SETTINGS_FILE: &str = "barcal.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BARCAL_";

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Logging.
    pub log: LogSettings,
    /// Session knobs (timeouts, flash policy, test defaults, port cache).
    pub session: SessionSettings,
}

/// Logging section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// trace, debug, info, warn or error.
    pub level: String,
    /// pretty, compact or json.
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl AppConfig {
    /// Loads `barcal.toml` from the working directory plus the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(SETTINGS_FILE)
    }

    /// Loads a specific settings file plus the environment; a missing file is fine.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Checks values figment cannot check by type.
    pub fn validate(&self) -> Result<(), String> {
        logging::parse_level(&self.log.level)?;
        if self.session.flash.write_attempts == 0 {
            return Err("session.flash.write_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    /// Logging config derived from the `log` section.
    pub fn log_config(&self) -> Result<LogConfig, String> {
        Ok(LogConfig::new(logging::parse_level(&self.log.level)?).with_format(self.log.format))
    }

    /// Session settings with the port cache defaulted to the user config directory.
    pub fn session_settings(&self) -> SessionSettings {
        let mut settings = self.session.clone();
        if settings.port_cache.is_none() {
            settings.port_cache = default_port_cache();
        }
        settings
    }
}

/// `<config dir>/barcal/ports.json`, when the platform has a config directory.
pub fn default_port_cache() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("barcal").join("ports.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_defaults_without_file() {
        let cfg = AppConfig::load_from("/nonexistent/barcal.toml").unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.session.flash.write_attempts, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[log]\nlevel = \"debug\"\nformat = \"json\"\n\n[session]\nsample_tick_ms = 10\n\n[session.flash]\nwrite_attempts = 5\n\n[session.test]\ntickMs = 100"
        )
        .unwrap();
        let cfg = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.session.sample_tick_ms, 10);
        assert_eq!(cfg.session.flash.write_attempts, 5);
        assert_eq!(cfg.session.flash.write_retry_ms, 200);
        assert_eq!(cfg.session.test.tick_ms, 100);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        std::env::set_var("BARCAL_LOG__LEVEL", "warn");
        let cfg = AppConfig::load_from("/nonexistent/barcal.toml");
        std::env::remove_var("BARCAL_LOG__LEVEL");
        assert_eq!(cfg.unwrap().log.level, "warn");
    }

    #[test]
    fn test_validate_rejects_bad_level() {
        let mut cfg = AppConfig::default();
        cfg.log.level = "chatty".into();
        assert!(cfg.validate().is_err());
        assert!(cfg.log_config().is_err());
    }

    #[test]
    fn test_explicit_port_cache_kept() {
        let mut cfg = AppConfig::default();
        cfg.session.port_cache = Some(PathBuf::from("/tmp/ports.json"));
        assert_eq!(
            cfg.session_settings().port_cache,
            Some(PathBuf::from("/tmp/ports.json"))
        );
    }
}
