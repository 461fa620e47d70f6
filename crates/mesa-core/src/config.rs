//! TOML configuration shared by the client and server hosts.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration.  Example:
//!
//! ```toml
//! [network]
//! default_host = "localhost"
//! game_port = 11223
//! announce_port = 11224
//!
//! [timing]
//! tick_interval_ms = 30
//! discovery_timeout_ms = 3000
//!
//! [limits]
//! max_frame_len = 52428800
//! reject_oversized_frames = false
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::address::{DEFAULT_ANNOUNCE_PORT, DEFAULT_GAME_PORT, DEFAULT_HOST};
use crate::protocol::codec::{OversizePolicy, DEFAULT_MAX_FRAME_LEN};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level network configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Ports and hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Host used when a `Connect` carries no address.
    #[serde(default = "default_host")]
    pub default_host: String,
    /// TCP port the server listens on and clients connect to.
    #[serde(default = "default_game_port")]
    pub game_port: u16,
    /// UDP port for announcements / discovery.
    #[serde(default = "default_announce_port")]
    pub announce_port: u16,
    /// Address the server listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Tick-driven timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// Interval between `TimerTick` notifications.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Discovery gives up after this many milliseconds worth of ticks.
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Server announcement period.
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
}

/// Frame size policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Drop peers that declare frames above `max_frame_len` instead of
    /// only warning.
    #[serde(default)]
    pub reject_oversized_frames: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_game_port() -> u16 {
    DEFAULT_GAME_PORT
}
fn default_announce_port() -> u16 {
    DEFAULT_ANNOUNCE_PORT
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_tick_interval_ms() -> u64 {
    30
}
fn default_discovery_timeout_ms() -> u64 {
    3000
}
fn default_announce_interval_ms() -> u64 {
    1000
}
fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_host: default_host(),
            game_port: default_game_port(),
            announce_port: default_announce_port(),
            bind_address: default_bind_address(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            announce_interval_ms: default_announce_interval_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
            reject_oversized_frames: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl LimitsConfig {
    pub fn oversize_policy(&self) -> OversizePolicy {
        if self.reject_oversized_frames {
            OversizePolicy::Reject
        } else {
            OversizePolicy::Warn
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads a [`NetConfig`] from `path`, returning the defaults if the file does
/// not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<NetConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NetConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &NetConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("mesa-config-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[test]
    fn test_default_config_has_legacy_ports() {
        let cfg = NetConfig::default();
        assert_eq!(cfg.network.game_port, 11223);
        assert_eq!(cfg.network.announce_port, 11224);
        assert_eq!(cfg.network.default_host, "localhost");
    }

    #[test]
    fn test_default_timing_and_limits() {
        let cfg = NetConfig::default();
        assert_eq!(cfg.timing.tick_interval_ms, 30);
        assert_eq!(cfg.timing.discovery_timeout_ms, 3000);
        assert_eq!(cfg.limits.max_frame_len, 50 * 1024 * 1024);
        assert_eq!(cfg.limits.oversize_policy(), OversizePolicy::Warn);
    }

    #[test]
    fn test_partial_toml_fills_missing_fields_with_defaults() {
        // Arrange
        let text = "[network]\ngame_port = 4000\n\n[limits]\nreject_oversized_frames = true\n";

        // Act
        let cfg: NetConfig = toml::from_str(text).expect("parse");

        // Assert
        assert_eq!(cfg.network.game_port, 4000);
        assert_eq!(cfg.network.announce_port, 11224);
        assert_eq!(cfg.timing, TimingConfig::default());
        assert_eq!(cfg.limits.oversize_policy(), OversizePolicy::Reject);
    }

    #[test]
    fn test_empty_toml_is_the_default_config() {
        let cfg: NetConfig = toml::from_str("").expect("parse");
        assert_eq!(cfg, NetConfig::default());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let cfg = load_config(&scratch_path("absent.toml")).expect("load");
        assert_eq!(cfg, NetConfig::default());
    }

    #[test]
    fn test_save_then_load_preserves_values() {
        // Arrange
        let path = scratch_path("nested/mesa.toml");
        let mut cfg = NetConfig::default();
        cfg.timing.tick_interval_ms = 15;
        cfg.logging.log_level = "debug".to_string();

        // Act
        save_config(&path, &cfg).expect("save");
        let restored = load_config(&path).expect("load");

        // Assert
        assert_eq!(restored, cfg);
        let _ = std::fs::remove_dir_all(path.parent().and_then(Path::parent).unwrap_or(&path));
    }

    #[test]
    fn test_load_malformed_toml_is_a_parse_error() {
        let path = scratch_path("broken.toml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[network\ngame_port = ").unwrap();

        let err = load_config(&path).unwrap_err();

        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
