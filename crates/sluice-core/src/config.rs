//! Configuration system for Sluice.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SLUICE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/sluice/config.toml
//!   3. ~/.config/sluice/config.toml
//!
//! The scheduler never reads this struct directly. Values that may change
//! at runtime are copied into `LiveSettings` and `RateGroup`s, which the
//! scheduler threads read on every tick.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub limits: LimitsConfig,
    pub scheduler: SchedulerConfig,
    pub api: ApiConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Global upload limit in bytes/sec. 0 = unlimited, negative = disabled.
    pub upload_bytes_per_sec: i64,
    /// Global download limit in bytes/sec. 0 = unlimited, negative = disabled.
    pub download_bytes_per_sec: i64,
    /// Charge protocol overhead against the upload limit.
    pub up_includes_protocol: bool,
    /// Charge protocol overhead against the download limit.
    pub down_includes_protocol: bool,
    /// Exempt LAN-local connections from group limits.
    pub lan_rate_enabled: bool,
    /// Named groups shared across connections.
    pub groups: Vec<GroupLimit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLimit {
    pub name: String,
    #[serde(default)]
    pub upload_bytes_per_sec: i64,
    #[serde(default)]
    pub download_bytes_per_sec: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Read loop sleep when a pass made no progress but connections exist.
    pub read_idle_sleep_ms: u64,
    /// Write loop sleep when a pass made no progress but connections exist.
    pub write_idle_sleep_ms: u64,
    /// Sleep for either loop when no connections are registered at all.
    pub no_connection_sleep_ms: u64,
    /// Keep trying other read entities before sleeping on a no-progress pass.
    pub aggressive_read: bool,
    /// Keep trying other write entities before sleeping on a no-progress pass.
    pub aggressive_write: bool,
    /// Upload slack lent to normal connections per second while boosted
    /// connections are active, in KiB.
    pub booster_gift_kib: u64,
    /// Smallest packet size; every bucket's burst is at least this.
    pub min_mss: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Local HTTP status port. 0 = disabled.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of simulated peers to drive. 0 = simulation off.
    pub peers: u32,
    /// How many of those peers get upgraded to dedicated entities.
    pub upgraded: u32,
    /// Capacity of each simulated link, per direction.
    pub link_bytes_per_sec: u64,
    /// Packet size of simulated links.
    pub mss: usize,
    /// Optional group every simulated peer joins.
    pub group: Option<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            upload_bytes_per_sec: 0,
            download_bytes_per_sec: 0,
            up_includes_protocol: false,
            down_includes_protocol: false,
            lan_rate_enabled: true,
            groups: Vec::new(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            read_idle_sleep_ms: 50,
            write_idle_sleep_ms: 50,
            no_connection_sleep_ms: 1000,
            aggressive_read: false,
            aggressive_write: false,
            booster_gift_kib: 5,
            min_mss: 1460,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            peers: 0,
            upgraded: 0,
            link_bytes_per_sec: 1_048_576, // 1 MiB/s
            mss: 1460,
            group: None,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("sluice")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SluiceConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, still honouring env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::parse(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            SluiceConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SLUICE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SluiceConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply SLUICE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("SLUICE_LIMITS__UPLOAD_BYTES_PER_SEC") {
            self.limits.upload_bytes_per_sec = v;
        }
        if let Some(v) = env_parse("SLUICE_LIMITS__DOWNLOAD_BYTES_PER_SEC") {
            self.limits.download_bytes_per_sec = v;
        }
        if let Some(v) = env_parse("SLUICE_API__PORT") {
            self.api.port = v;
        }
        if let Some(v) = env_parse("SLUICE_SIMULATION__PEERS") {
            self.simulation.peers = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
