//! Configuration system for Winenet.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $WINENET_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/winenet/config.toml
//!   3. ~/.config/winenet/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Largest accepted `packets_per_frame`.
pub const MAX_PACKETS_PER_FRAME: usize = 64;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WinenetConfig {
    pub protocol: ProtocolConfig,
    pub simulation: SimulationConfig,
}

/// Tunables of the protocol engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Data packets per frame. One acknowledgment covers a whole frame.
    pub packets_per_frame: usize,
    /// How long a sender waits for an acknowledgment.
    pub ack_timeout_ms: u64,
    /// How long a listener stays quiet before polling for state again.
    pub listener_timeout_ms: u64,
    /// Retransmissions of a beacon or frame before the target is invalidated.
    pub retries_max: u32,
    /// Seed for the election random numbers. Unset = seeded from entropy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,
}

/// Settings of the `wnet-sim` harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of simulated smart objects.
    pub nodes: usize,
    /// Percentage of datagrams the medium drops (0-100).
    pub loss_percent: u8,
    /// Frames each node sends during one speaker turn.
    pub frames_per_turn: usize,
    /// Payload bytes per data packet.
    pub payload_size: usize,
    /// Run time in seconds. 0 = until Ctrl-C.
    pub run_secs: u64,
    /// Delay between two nodes joining the medium.
    pub join_interval_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            packets_per_frame: 8,
            ack_timeout_ms: 800,
            listener_timeout_ms: 800,
            retries_max: 3,
            rng_seed: None,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            loss_percent: 0,
            frames_per_turn: 2,
            payload_size: 64,
            run_secs: 10,
            join_interval_ms: 200,
        }
    }
}

impl ProtocolConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn listener_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_timeout_ms)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packets_per_frame == 0 || self.packets_per_frame > MAX_PACKETS_PER_FRAME {
            return Err(ConfigError::Invalid("protocol.packets_per_frame must be within 1..=64"));
        }
        if self.ack_timeout_ms == 0 || self.listener_timeout_ms == 0 {
            return Err(ConfigError::Invalid("protocol timeouts must be non-zero"));
        }
        Ok(())
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("winenet")
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
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl WinenetConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            WinenetConfig::default()
        };
        config.apply_env_overrides();
        config.protocol.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("WINENET_CONFIG")
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
            let text = toml::to_string_pretty(&WinenetConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply WINENET_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|s| s.trim().parse().ok())
        }

        let p = &mut self.protocol;
        if let Some(v) = parse(lookup("WINENET_PROTOCOL__PACKETS_PER_FRAME")) {
            p.packets_per_frame = v;
        }
        if let Some(v) = parse(lookup("WINENET_PROTOCOL__ACK_TIMEOUT_MS")) {
            p.ack_timeout_ms = v;
        }
        if let Some(v) = parse(lookup("WINENET_PROTOCOL__LISTENER_TIMEOUT_MS")) {
            p.listener_timeout_ms = v;
        }
        if let Some(v) = parse(lookup("WINENET_PROTOCOL__RETRIES_MAX")) {
            p.retries_max = v;
        }
        if let Some(v) = parse(lookup("WINENET_PROTOCOL__RNG_SEED")) {
            p.rng_seed = Some(v);
        }

        let s = &mut self.simulation;
        if let Some(v) = parse(lookup("WINENET_SIMULATION__NODES")) {
            s.nodes = v;
        }
        if let Some(v) = parse::<u8>(lookup("WINENET_SIMULATION__LOSS_PERCENT")) {
            s.loss_percent = v.min(100);
        }
        if let Some(v) = parse(lookup("WINENET_SIMULATION__FRAMES_PER_TURN")) {
            s.frames_per_turn = v;
        }
        if let Some(v) = parse(lookup("WINENET_SIMULATION__PAYLOAD_SIZE")) {
            s.payload_size = v;
        }
        if let Some(v) = parse(lookup("WINENET_SIMULATION__RUN_SECS")) {
            s.run_secs = v;
        }
        if let Some(v) = parse(lookup("WINENET_SIMULATION__JOIN_INTERVAL_MS")) {
            s.join_interval_ms = v;
        }
    }
}
