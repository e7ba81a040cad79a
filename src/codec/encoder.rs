//! Opus encoder wrapper
//!
//! Mono 16 kHz VoIP encoder with clamped bitrate / complexity settings.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::audio::PcmFrame;
use crate::config::CodecConfig;
use crate::constants::{FRAME_SAMPLES, MAX_ENCODED_SIZE, SAMPLE_RATE};
use crate::error::CodecError;

/// Opus encoder for outgoing voice
///
/// Not reentrant; the pipeline serializes calls behind its encoder lock.
pub struct VoiceEncoder {
    encoder: Encoder,
    config: CodecConfig,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl VoiceEncoder {
    /// Create a new encoder; out-of-range settings are clamped, not rejected
    pub fn new(config: CodecConfig) -> Result<Self, CodecError> {
        let config = config.clamped();

        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, &config)?;

        tracing::info!(
            bitrate = config.bitrate,
            complexity = config.complexity,
            fec = config.fec,
            dtx = config.dtx,
            "Opus encoder initialized: {} Hz mono, {} samples/frame",
            SAMPLE_RATE,
            FRAME_SAMPLES
        );

        Ok(Self {
            encoder,
            config,
            encode_buffer: vec![0u8; MAX_ENCODED_SIZE],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Push every configured setting to libopus
    fn configure_encoder(encoder: &mut Encoder, config: &CodecConfig) -> Result<(), CodecError> {
        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_complexity(i32::from(config.complexity))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set complexity: {}", e)))?;

        encoder
            .set_inband_fec(config.fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        encoder
            .set_dtx(config.dtx)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set DTX: {}", e)))?;

        encoder
            .set_packet_loss_perc(i32::from(config.packet_loss_perc))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;

        Ok(())
    }

    /// Encode exactly one 20 ms frame
    pub fn encode(&mut self, frame: &[i16]) -> Result<Bytes, CodecError> {
        if frame.len() != FRAME_SAMPLES {
            return Err(CodecError::InvalidFrameSize(frame.len()));
        }

        let size = self
            .encoder
            .encode(frame, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    /// Encode a frame produced by the accumulator
    pub fn encode_frame(&mut self, frame: &PcmFrame) -> Result<Bytes, CodecError> {
        self.encode(frame)
    }

    /// Forget all predictive state (start of a new talk burst)
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.encoder
            .reset_state()
            .map_err(|e| CodecError::EncoderInit(format!("Failed to reset encoder: {}", e)))?;
        tracing::debug!("Encoder reset");
        Ok(())
    }

    /// Update bitrate, clamped to [6000, 24000]
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CodecError> {
        let clamped = CodecConfig::clamp_bitrate(bitrate);
        if clamped != bitrate {
            tracing::warn!("Bitrate {} out of range, clamped to {}", bitrate, clamped);
        }
        self.encoder
            .set_bitrate(opus::Bitrate::Bits(clamped as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        self.config.bitrate = clamped;
        Ok(())
    }

    /// Update complexity, clamped to [0, 10]
    pub fn set_complexity(&mut self, complexity: u8) -> Result<(), CodecError> {
        let clamped = CodecConfig::clamp_complexity(complexity);
        self.encoder
            .set_complexity(i32::from(clamped))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set complexity: {}", e)))?;
        self.config.complexity = clamped;
        Ok(())
    }

    /// Update FEC setting dynamically
    pub fn set_fec(&mut self, enabled: bool) -> Result<(), CodecError> {
        self.encoder
            .set_inband_fec(enabled)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;
        self.config.fec = enabled;
        Ok(())
    }

    /// Toggle discontinuous transmission
    pub fn set_dtx(&mut self, enabled: bool) -> Result<(), CodecError> {
        self.encoder
            .set_dtx(enabled)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set DTX: {}", e)))?;
        self.config.dtx = enabled;
        Ok(())
    }

    /// Get current configuration
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}
