//! Wire protocol and shared data types

pub mod rtp;
pub mod sequence;

use serde::{Deserialize, Serialize};

pub use rtp::{RtpHeader, MAX_DATAGRAM_SIZE, RTP_HEADER_SIZE, RTP_PAYLOAD_TYPE_OPUS};

/// How outgoing packets reach other nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Multicast group only; failing to join is fatal
    Multicast,
    /// Explicit peer list only
    Unicast,
    /// Try multicast, fall back to unicast for the rest of the session
    #[default]
    Auto,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Multicast => "multicast",
            Self::Unicast => "unicast",
            Self::Auto => "auto",
        })
    }
}

/// Audio device description exposed to the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    /// Whether the device advertises the 16 kHz voice rate
    pub supports_voice_rate: bool,
    pub channels: Vec<u16>,
}
