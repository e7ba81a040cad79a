//! # PTT Voice
//!
//! Low-latency push-to-talk voice transport over RTP multicast / unicast.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── SEND PATH ─────────────────────────────────┐
//! │                                                                            │
//! │  ┌──────────────┐    ┌──────────────────┐    ┌──────────────┐              │
//! │  │   Capture    │    │ FrameAccumulator │    │ Opus Encoder │              │
//! │  │   callback   │───▶│ (audio::accum..) │───▶│ (codec::enc) │              │
//! │  │ (RT thread)  │    │  192 → 320 smp   │    │ encoder lock │              │
//! │  └──────────────┘    └──────────────────┘    └──────┬───────┘              │
//! │                                                     │                      │
//! │                                                     ▼                      │
//! │                        ┌──────────────────────────────────────────┐        │
//! │                        │  RtpTransport (network::transport)       │        │
//! │                        │  [V|M|PT|Seq|Timestamp|SSRC|Opus data]   │        │
//! │                        │  multicast group + unicast peer fan-out  │        │
//! │                        └──────────────────────────────────────────┘        │
//! └────────────────────────────────────┬───────────────────────────────────────┘
//!                                      │ UDP (DSCP EF)
//!                                      ▼
//! ┌──────────────────────────────── RECEIVE PATH ──────────────────────────────┐
//! │                        ┌──────────────────────────────────────────┐        │
//! │                        │  Receive loop thread (network::receiver) │        │
//! │                        │  loopback SSRC rejection, wake-to-cancel │        │
//! │                        └─────────────────────┬────────────────────┘        │
//! │                                              ▼                             │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐              │
//! │  │   Playback   │    │ Opus Decoder │    │   JitterBuffer   │              │
//! │  │   callback   │◀───│  + loss      │◀───│  50-slot FIFO    │              │
//! │  │ (RT thread)  │    │ concealment  │    │  (audio::jitter) │              │
//! │  └──────────────┘    └──────────────┘    └──────────────────┘              │
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`engine::AudioPipeline`] wires both paths together and owns the lock
//! discipline: every shared resource has its own lock, no two are ever held
//! at once on a real-time path, and the `capturing` / `playing` atomics are
//! the only state the callbacks read without locking.

pub mod audio;
pub mod codec;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod network;
pub mod protocol;

pub use engine::AudioPipeline;
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    /// Capture / playback sample rate
    pub const SAMPLE_RATE: u32 = 16_000;

    /// Mono voice
    pub const CHANNELS: u16 = 1;

    /// Samples in one 20 ms codec frame at [`SAMPLE_RATE`]
    pub const FRAME_SAMPLES: usize = 320;

    /// Codec frame duration in milliseconds
    pub const FRAME_DURATION_MS: u32 = 20;

    /// RTP clock rate mandated by the Opus payload format (RFC 7587),
    /// independent of the actual capture rate
    pub const WIRE_CLOCK_RATE: u32 = 48_000;

    /// RTP timestamp increment per frame
    pub const WIRE_SAMPLES_PER_FRAME: u32 = WIRE_CLOCK_RATE / 1000 * FRAME_DURATION_MS;

    /// Device burst size requested from the audio backend (~12 ms)
    pub const DEFAULT_BURST_FRAMES: u32 = 192;

    /// Upper bound for one encoded Opus frame
    pub const MAX_ENCODED_SIZE: usize = 4000;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 12_000;

    /// Bitrate range accepted by the encoder
    pub const MIN_BITRATE: u32 = 6_000;
    pub const MAX_BITRATE: u32 = 24_000;

    /// Default encoder complexity (0-10)
    pub const DEFAULT_COMPLEXITY: u8 = 5;
    pub const MAX_COMPLEXITY: u8 = 10;

    /// Default UDP port for RTP
    pub const DEFAULT_PORT: u16 = 5004;

    /// Default multicast group (administratively scoped)
    pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);

    /// Default HTTP control port
    pub const DEFAULT_CONTROL_PORT: u16 = 8080;

    /// Expedited Forwarding DSCP code point
    pub const DSCP_EF: u8 = 46;

    /// Number of packets the jitter buffer can hold (~1 s at 20 ms/frame)
    pub const JITTER_BUFFER_SLOTS: usize = 50;

    /// Largest datagram the receive loop will read
    pub const MAX_RECEIVE_SIZE: usize = 1500;

    /// Upper bound on a receive wait before the loop re-checks cancellation
    pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

    /// How long `stop` waits for the receive thread before abandoning it
    pub const RECEIVE_JOIN_GRACE: Duration = Duration::from_millis(500);
}
