//! Application configuration
//!
//! Every field has a default so a partial (or missing) TOML file is valid.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::TransportMode;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub codec: CodecConfig,
    pub audio: AudioConfig,
    pub control: ControlConfig,
}

/// RTP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Multicast group shared by every node in the talk group
    pub group: Ipv4Addr,
    /// UDP port, used both for binding and as the group destination port
    pub port: u16,
    pub mode: TransportMode,
    /// Unicast peers added at start-up
    pub peers: Vec<SocketAddrV4>,
    pub multicast_ttl: u32,
    /// DSCP code point applied to outgoing packets (46 = EF)
    pub dscp: u8,
    pub receive_timeout_ms: u64,
    pub join_grace_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            mode: TransportMode::Auto,
            peers: Vec::new(),
            multicast_ttl: 4,
            dscp: DSCP_EF,
            receive_timeout_ms: RECEIVE_TIMEOUT.as_millis() as u64,
            join_grace_ms: RECEIVE_JOIN_GRACE.as_millis() as u64,
        }
    }
}

impl NetworkConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms.max(1))
    }

    pub fn join_grace(&self) -> Duration {
        Duration::from_millis(self.join_grace_ms)
    }
}

/// Opus encoder settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Target bitrate, clamped to [6000, 24000] bps
    pub bitrate: u32,
    /// Encoder complexity, clamped to [0, 10]
    pub complexity: u8,
    /// In-band forward error correction
    pub fec: bool,
    /// Discontinuous transmission
    pub dtx: bool,
    /// Expected packet loss percentage hint for FEC
    pub packet_loss_perc: u8,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            bitrate: DEFAULT_BITRATE,
            complexity: DEFAULT_COMPLEXITY,
            fec: false,
            dtx: true,
            packet_loss_perc: 5,
        }
    }
}

impl CodecConfig {
    pub fn clamp_bitrate(bitrate: u32) -> u32 {
        bitrate.clamp(MIN_BITRATE, MAX_BITRATE)
    }

    pub fn clamp_complexity(complexity: u8) -> u8 {
        complexity.min(MAX_COMPLEXITY)
    }

    /// Copy with every ranged field pulled into range
    pub fn clamped(mut self) -> Self {
        self.bitrate = Self::clamp_bitrate(self.bitrate);
        self.complexity = Self::clamp_complexity(self.complexity);
        self.packet_loss_perc = self.packet_loss_perc.min(100);
        self
    }
}

/// Audio device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device id (`input:<name>`); `None` selects the system default
    pub input_device: Option<String>,
    /// Output device id (`output:<name>`); `None` selects the system default
    pub output_device: Option<String>,
    /// Frames per device callback
    pub burst_frames: u32,
    /// Decoded frames the playout queue may hold
    pub playout_frames: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            burst_frames: DEFAULT_BURST_FRAMES,
            playout_frames: 4,
        }
    }
}

/// HTTP control surface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_CONTROL_PORT,
        }
    }
}

impl AppConfig {
    /// Platform config file location, e.g. `~/.config/ptt-voice/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "ptt-voice")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load `path` if given, else the platform config file if present,
    /// else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Write the config as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [network]
            mode = "unicast"
            peers = ["10.0.0.2:5004"]

            [codec]
            bitrate = 16000
            "#,
        )
        .unwrap();

        assert_eq!(config.network.mode, TransportMode::Unicast);
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.network.peers, vec!["10.0.0.2:5004".parse().unwrap()]);
        assert_eq!(config.codec.bitrate, 16_000);
        assert_eq!(config.codec.complexity, DEFAULT_COMPLEXITY);
        assert_eq!(config.audio.burst_frames, DEFAULT_BURST_FRAMES);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = AppConfig::default();
        config.network.group = Ipv4Addr::new(239, 1, 2, 3);
        config.codec.fec = true;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.network.group, Ipv4Addr::new(239, 1, 2, 3));
        assert!(loaded.codec.fec);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[network]\nport = \"not a port\"").unwrap();

        assert!(matches!(AppConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_codec_clamping() {
        let config = CodecConfig {
            bitrate: 3000,
            complexity: 11,
            ..CodecConfig::default()
        }
        .clamped();
        assert_eq!(config.bitrate, 6000);
        assert_eq!(config.complexity, 10);

        assert_eq!(CodecConfig::clamp_bitrate(100_000), 24_000);
    }
}
