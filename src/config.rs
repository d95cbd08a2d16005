//! Connection configuration.
//!
//! Loaded from `config.json` in the config directory when present, then
//! overridden by `XBDM_*` environment variables.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{CONNECT_TIMEOUT, DEFAULT_PORT, POLL_INTERVAL, READ_TIMEOUT};

/// Settings for a console connection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Console host name or IP address.
    pub host: String,
    /// Debug monitor TCP port.
    pub port: u16,
    /// Longest a read may wait without receiving a byte before the
    /// connection is closed.
    pub read_timeout_ms: u64,
    /// TCP connect timeout.
    pub connect_timeout_ms: u64,
    /// Socket poll slice for cancellation checks inside blocking reads.
    pub poll_interval_ms: u64,
    /// Treat console memory as little-endian. Retail consoles are big-endian.
    pub little_endian: bool,
    /// Name announced when the event channel attaches as a debugger.
    pub debugger_name: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            read_timeout_ms: READ_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            little_endian: false,
            debugger_name: "xbdm-link".to_string(),
        }
    }
}

impl ConsoleConfig {
    /// Config for `host` with every other setting at its default.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `XBDM_CONFIG_DIR` takes priority over the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = match std::env::var("XBDM_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("xbdm-link"),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::load_from_file() {
            Ok(config) => config,
            Err(e) => {
                log::debug!("[xbdm] using default config: {e:#}");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if !config_path.exists() {
            anyhow::bail!("Config file not found");
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("read {}", config_path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parse {}", config_path.display()))
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("write {}", config_path.display()))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("XBDM_HOST") {
            self.host = host;
        }
        if let Some(port) = env_number("XBDM_PORT") {
            self.port = port;
        }
        if let Some(ms) = env_number("XBDM_READ_TIMEOUT_MS") {
            self.read_timeout_ms = ms;
        }
        if let Some(ms) = env_number("XBDM_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = env_number("XBDM_POLL_INTERVAL_MS") {
            self.poll_interval_ms = ms;
        }
        if let Ok(flag) = std::env::var("XBDM_LITTLE_ENDIAN") {
            self.little_endian = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Ok(name) = std::env::var("XBDM_DEBUGGER_NAME") {
            self.debugger_name = name;
        }
    }

    /// `host:port`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Read ceiling as a [`Duration`], never zero.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    /// Connect timeout as a [`Duration`], never zero.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// Poll slice as a [`Duration`], never zero.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("[xbdm] ignoring {key}={raw:?}: not a number");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConsoleConfig::default();
        assert_eq!(config.port, 730);
        assert_eq!(config.read_timeout(), Duration::from_secs(5));
        assert!(!config.little_endian);
        assert_eq!(config.endpoint(), "127.0.0.1:730");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ConsoleConfig =
            serde_json::from_str(r#"{"host": "192.168.1.50", "read_timeout_ms": 2500}"#).unwrap();
        assert_eq!(config.host, "192.168.1.50");
        assert_eq!(config.read_timeout_ms, 2500);
        assert_eq!(config.port, 730);
        assert_eq!(config.debugger_name, "xbdm-link");
    }

    #[test]
    fn test_poll_interval_never_zero() {
        let config = ConsoleConfig {
            poll_interval_ms: 0,
            ..ConsoleConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_zero_timeouts_are_clamped() {
        let config = ConsoleConfig {
            read_timeout_ms: 0,
            connect_timeout_ms: 0,
            ..ConsoleConfig::default()
        };
        assert_eq!(config.read_timeout(), Duration::from_millis(1));
        assert_eq!(config.connect_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("XBDM_CONFIG_DIR", dir.path());
        let config = ConsoleConfig {
            host: "10.0.0.7".to_string(),
            little_endian: true,
            ..ConsoleConfig::default()
        };
        config.save().unwrap();
        let loaded = ConsoleConfig::load_from_file().unwrap();
        std::env::remove_var("XBDM_CONFIG_DIR");
        assert_eq!(loaded, config);
    }
}
