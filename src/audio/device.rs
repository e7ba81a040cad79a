//! Audio device collaborator
//!
//! The core never drives the sound card. A backend opens streams that call
//! back into [`AudioCallbacks`] from the device's real-time threads; the
//! pipeline only reacts to those calls. [`CpalBackend`] is the production
//! backend; tests supply their own.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, unbounded, Sender};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::SAMPLE_RATE;
use crate::error::AudioError;
use crate::protocol::AudioDeviceInfo;

/// Which half of the duplex path a stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Capture,
    Playback,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Capture => "capture",
            Self::Playback => "playback",
        })
    }
}

/// Entry points a device stream calls on its real-time threads
///
/// Implementations must not block: no waiting on other threads, no I/O
/// beyond a non-blocking send.
pub trait AudioCallbacks: Send + Sync {
    /// A burst of captured mono 16 kHz samples, of device-chosen length
    fn on_capture(&self, burst: &[i16]);

    /// Fill `out` with mono 16 kHz samples for the speaker
    fn on_playback(&self, out: &mut [i16]);

    /// The stream reported an asynchronous fault
    fn on_device_error(&self, direction: Direction, error: AudioError);
}

/// An opened device stream
pub trait DeviceStream: Send {
    fn start(&mut self) -> Result<(), AudioError>;
    fn stop(&mut self) -> Result<(), AudioError>;
    /// Buffering latency the device adds, in milliseconds
    fn latency_ms(&self) -> f32;
}

/// What to open
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    /// Device id from [`list_devices`]; `None` for the system default
    pub device_id: Option<String>,
    /// Samples per callback the device is asked for
    pub burst_frames: u32,
}

/// Factory for device streams
pub trait AudioBackend: Send + Sync {
    fn open_capture(
        &self,
        request: &StreamRequest,
        callbacks: Arc<dyn AudioCallbacks>,
    ) -> Result<Box<dyn DeviceStream>, AudioError>;

    fn open_playback(
        &self,
        request: &StreamRequest,
        callbacks: Arc<dyn AudioCallbacks>,
    ) -> Result<Box<dyn DeviceStream>, AudioError>;

    fn list_devices(&self) -> Vec<AudioDeviceInfo> {
        Vec::new()
    }
}

/// Backend on top of the platform's default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_capture(
        &self,
        request: &StreamRequest,
        callbacks: Arc<dyn AudioCallbacks>,
    ) -> Result<Box<dyn DeviceStream>, AudioError> {
        let stream = super::capture::open(request, callbacks)?;
        Ok(Box::new(stream))
    }

    fn open_playback(
        &self,
        request: &StreamRequest,
        callbacks: Arc<dyn AudioCallbacks>,
    ) -> Result<Box<dyn DeviceStream>, AudioError> {
        let stream = super::playback::open(request, callbacks)?;
        Ok(Box::new(stream))
    }

    fn list_devices(&self) -> Vec<AudioDeviceInfo> {
        list_devices()
    }
}

/// Convert a device sample to 16-bit PCM, saturating out-of-range input
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

/// Mono-or-wider 16 kHz config asking the device for `burst_frames` per callback
pub(crate) fn voice_stream_config(channels: u16, burst_frames: u32) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: if burst_frames > 0 {
            cpal::BufferSize::Fixed(burst_frames)
        } else {
            cpal::BufferSize::Default
        },
    }
}

/// Latency of one device burst at the voice rate
pub(crate) fn burst_latency_ms(burst_frames: u32) -> f32 {
    burst_frames as f32 * 1000.0 / SAMPLE_RATE as f32
}

enum StreamCommand {
    Play(Sender<Result<(), AudioError>>),
    Pause(Sender<Result<(), AudioError>>),
}

/// A cpal stream pinned to its own thread
///
/// cpal streams are not `Send`, so the stream is built, played, paused and
/// dropped on a dedicated owner thread driven through a command channel.
pub struct OwnedStream {
    commands: Option<Sender<StreamCommand>>,
    thread: Option<JoinHandle<()>>,
    latency_ms: f32,
    name: String,
}

/// How long a control call waits for the owner thread to answer
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

impl OwnedStream {
    /// Spawn the owner thread and build the stream on it
    pub fn spawn<F>(name: &str, latency_ms: f32, build: F) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<cpal::Stream, AudioError> + Send + 'static,
    {
        let (command_tx, command_rx) = unbounded::<StreamCommand>();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Runs until the handle drops its sender
                for command in command_rx.iter() {
                    match command {
                        StreamCommand::Play(reply) => {
                            let _ = reply.send(
                                stream
                                    .play()
                                    .map_err(|e| AudioError::StreamError(e.to_string())),
                            );
                        }
                        StreamCommand::Pause(reply) => {
                            let _ = reply.send(
                                stream
                                    .pause()
                                    .map_err(|e| AudioError::StreamError(e.to_string())),
                            );
                        }
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands: Some(command_tx),
                thread: Some(thread),
                latency_ms,
                name: name.to_string(),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamError(format!("{} thread exited", name)))
            }
        }
    }

    fn request(
        &self,
        command: impl FnOnce(Sender<Result<(), AudioError>>) -> StreamCommand,
    ) -> Result<(), AudioError> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| AudioError::StreamError(format!("{} is closed", self.name)))?;

        let (reply_tx, reply_rx) = bounded(1);
        commands
            .send(command(reply_tx))
            .map_err(|_| AudioError::StreamError(format!("{} thread is gone", self.name)))?;

        reply_rx
            .recv_timeout(COMMAND_TIMEOUT)
            .map_err(|_| AudioError::StreamError(format!("{} did not respond", self.name)))?
    }
}

impl DeviceStream for OwnedStream {
    fn start(&mut self) -> Result<(), AudioError> {
        self.request(StreamCommand::Play)
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.request(StreamCommand::Pause)
    }

    fn latency_ms(&self) -> f32 {
        self.latency_ms
    }
}

impl Drop for OwnedStream {
    fn drop(&mut self) {
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("{} thread panicked", self.name);
            }
        }
    }
}

/// Wrapper around cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device, is_input: bool, is_output: bool) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
            is_input,
            is_output,
        }
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    /// Fewest channels the device accepts at the 16 kHz voice rate
    pub fn voice_channels(&self) -> Result<u16, AudioError> {
        let ranges: Vec<cpal::SupportedStreamConfigRange> = if self.is_input {
            self.inner
                .supported_input_configs()
                .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
                .collect()
        } else {
            self.inner
                .supported_output_configs()
                .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
                .collect()
        };

        ranges
            .iter()
            .filter(|range| supports_rate(range, SAMPLE_RATE))
            .map(|range| range.channels())
            .min()
            .ok_or_else(|| {
                AudioError::UnsupportedFormat(format!("{} does not support {} Hz", self.name, SAMPLE_RATE))
            })
    }
}

fn supports_rate(range: &cpal::SupportedStreamConfigRange, rate: u32) -> bool {
    let rate = cpal::SampleRate(rate);
    rate >= range.min_sample_rate() && rate <= range.max_sample_rate()
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let (supports_voice_rate, channels) = device_capabilities(&device, true);
                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    supports_voice_rate,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let (supports_voice_rate, channels) = device_capabilities(&device, false);
                devices.push(AudioDeviceInfo {
                    id: format!("output:{}", name),
                    is_default: default_output_name.as_ref() == Some(&name),
                    name,
                    is_input: false,
                    is_output: true,
                    supports_voice_rate,
                    channels,
                });
            }
        }
    }

    devices
}

fn device_capabilities(device: &cpal::Device, is_input: bool) -> (bool, Vec<u16>) {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|configs| configs.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|configs| configs.collect())
            .unwrap_or_default()
    };

    let supports_voice_rate = ranges.iter().any(|r| supports_rate(r, SAMPLE_RATE));
    let mut channels: Vec<u16> = ranges.iter().map(|r| r.channels()).collect();
    channels.sort_unstable();
    channels.dedup();

    (supports_voice_rate, channels)
}

/// Get a device by its ID (`input:<name>` or `output:<name>`)
pub fn get_device_by_id(id: &str) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();

    let (is_input, name) = if let Some(name) = id.strip_prefix("input:") {
        (true, name)
    } else if let Some(name) = id.strip_prefix("output:") {
        (false, name)
    } else {
        return Err(AudioError::DeviceNotFound(id.to_string()));
    };

    let devices = if is_input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().is_ok_and(|device_name| device_name == name) {
            return Ok(AudioDevice::from_cpal(device, is_input, !is_input));
        }
    }

    Err(AudioError::DeviceNotFound(id.to_string()))
}

/// Get default input device
pub fn get_default_input_device() -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();
    host.default_input_device()
        .map(|d| AudioDevice::from_cpal(d, true, false))
        .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))
}

/// Get default output device
pub fn get_default_output_device() -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();
    host.default_output_device()
        .map(|d| AudioDevice::from_cpal(d, false, true))
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))
}
