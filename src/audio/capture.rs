//! Microphone capture through cpal
//!
//! Runs the input stream on its own owner thread. Each device callback is
//! downmixed to mono, converted to 16-bit PCM and handed to
//! [`AudioCallbacks::on_capture`] as one burst.

use cpal::traits::DeviceTrait;
use std::sync::Arc;

use crate::audio::device::{
    burst_latency_ms, f32_to_i16, get_default_input_device, get_device_by_id, voice_stream_config,
    AudioCallbacks, Direction, OwnedStream, StreamRequest,
};
use crate::error::AudioError;

/// Open (but do not start) the capture stream
pub fn open(request: &StreamRequest, callbacks: Arc<dyn AudioCallbacks>) -> Result<OwnedStream, AudioError> {
    let device = match &request.device_id {
        Some(id) => get_device_by_id(id)?,
        None => get_default_input_device()?,
    };
    if !device.is_input {
        return Err(AudioError::DeviceNotFound(format!("{} is not an input device", device.name)));
    }

    let channels = device.voice_channels()?;
    let burst_frames = request.burst_frames;
    let name = device.name.clone();

    tracing::info!(
        "Opening capture on '{}': {} ch, {} samples/burst",
        name,
        channels,
        burst_frames
    );

    OwnedStream::spawn("audio-capture", burst_latency_ms(burst_frames), move || {
        let device = device.into_inner();
        let fixed = voice_stream_config(channels, burst_frames);

        match build(&device, &fixed, callbacks.clone()) {
            Ok(stream) => Ok(stream),
            Err(e) if burst_frames > 0 => {
                tracing::warn!(
                    "Capture device rejected {} sample bursts ({}), using its default size",
                    burst_frames,
                    e
                );
                build(&device, &voice_stream_config(channels, 0), callbacks)
            }
            Err(e) => Err(e),
        }
    })
}

fn build(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    callbacks: Arc<dyn AudioCallbacks>,
) -> Result<cpal::Stream, AudioError> {
    let channels = usize::from(config.channels.max(1));
    let error_callbacks = callbacks.clone();
    let mut burst: Vec<i16> = Vec::with_capacity(4096);

    device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                burst.clear();
                burst.extend(data.chunks(channels).map(downmix));
                callbacks.on_capture(&burst);
            },
            move |err| {
                error_callbacks.on_device_error(Direction::Capture, AudioError::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Average one interleaved frame into a mono sample
fn downmix(frame: &[f32]) -> i16 {
    if frame.is_empty() {
        return 0;
    }
    f32_to_i16(frame.iter().sum::<f32>() / frame.len() as f32)
}
