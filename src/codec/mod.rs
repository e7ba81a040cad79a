//! Opus codec adapter
//!
//! Stateful encoder/decoder pair for mono 16 kHz voice, including packet
//! loss concealment on the decode side.

pub mod decoder;
pub mod encoder;

use bytes::Bytes;

pub use decoder::{DecoderStats, VoiceDecoder};
pub use encoder::{EncoderStats, VoiceEncoder};

/// One compressed frame on its way to the transport
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub payload: Bytes,
    /// First frame of a talk burst (sets the RTP marker bit)
    pub talk_burst_start: bool,
}

impl EncodedPacket {
    pub fn new(payload: Bytes, talk_burst_start: bool) -> Self {
        Self {
            payload,
            talk_burst_start,
        }
    }
}
