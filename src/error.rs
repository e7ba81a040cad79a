//! Error types for the voice transport
//!
//! Only initialization failures reach the host as hard errors. Everything
//! raised on a real-time path (send, encode, decode) is logged and degrades
//! audio instead; buffer exhaustion is never an error at all, only a counter.

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pipeline is not initialized")]
    NotInitialized,
}

/// Audio device errors
#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Failed to join multicast group {group}: {reason}")]
    MulticastJoin { group: String, reason: String },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("No destination accepted the datagram")]
    NoDestination,

    #[error("Invalid packet: {0}")]
    InvalidPacket(&'static str),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Receive loop failed to start: {0}")]
    ReceiveLoop(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
