//! Audio subsystem module

pub mod accumulator;
pub mod buffer;
pub mod capture;
pub mod device;
pub mod jitter;
pub mod playback;

pub use accumulator::{FrameAccumulator, PcmFrame};
pub use buffer::PlayoutBuffer;
pub use device::{
    list_devices, AudioBackend, AudioCallbacks, CpalBackend, DeviceStream, Direction, StreamRequest,
};
pub use jitter::{JitterBuffer, JitterStats};
