//! Opus decoder wrapper
//!
//! Provides Opus decoding with packet loss concealment. Every call yields
//! exactly one 20 ms frame so the playback side never sees a short buffer.

use opus::{Channels, Decoder};

use crate::audio::PcmFrame;
use crate::constants::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::CodecError;

/// Opus decoder for incoming voice
pub struct VoiceDecoder {
    decoder: Decoder,
    /// Frames decoded
    frames_decoded: u64,
    /// Frames synthesized by concealment
    frames_concealed: u64,
}

impl VoiceDecoder {
    pub fn new() -> Result<Self, CodecError> {
        let decoder = Decoder::new(SAMPLE_RATE, Channels::Mono)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        tracing::info!("Opus decoder initialized: {} Hz mono", SAMPLE_RATE);

        Ok(Self {
            decoder,
            frames_decoded: 0,
            frames_concealed: 0,
        })
    }

    /// Decode one packet into `frame`
    pub fn decode(&mut self, data: &[u8], frame: &mut PcmFrame) -> Result<(), CodecError> {
        if data.is_empty() {
            return Err(CodecError::DecodingFailed("empty packet".to_string()));
        }

        let samples = self
            .decoder
            .decode(data, frame, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        // Packets carrying less than 20 ms are padded to a full frame.
        if samples < FRAME_SAMPLES {
            frame[samples..].fill(0);
        }
        self.frames_decoded += 1;
        Ok(())
    }

    /// Synthesize a frame for a missing packet from the decoder state
    ///
    /// Always fills the whole frame: if libopus itself fails, or right
    /// after [`reset`](Self::reset) when there is nothing to extrapolate
    /// from, the frame is silence.
    pub fn conceal_loss(&mut self, frame: &mut PcmFrame) {
        match self.decoder.decode(&[], frame, false) {
            Ok(samples) if samples < FRAME_SAMPLES => frame[samples..].fill(0),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Opus PLC failed: {}", e);
                frame.fill(0);
            }
        }
        self.frames_concealed += 1;
    }

    /// Reset decoder state (start of a playback session)
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;
        tracing::debug!("Decoder reset");
        Ok(())
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_concealed: self.frames_concealed,
            concealment_rate: if self.frames_decoded + self.frames_concealed > 0 {
                self.frames_concealed as f32 / (self.frames_decoded + self.frames_concealed) as f32
            } else {
                0.0
            },
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_concealed: u64,
    pub concealment_rate: f32,
}
