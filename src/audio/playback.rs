//! Speaker playback through cpal

use cpal::traits::DeviceTrait;
use std::sync::Arc;

use crate::audio::device::{
    burst_latency_ms, get_default_output_device, get_device_by_id, i16_to_f32, voice_stream_config,
    AudioCallbacks, Direction, OwnedStream, StreamRequest,
};
use crate::error::AudioError;

/// Open (but do not start) the playback stream
///
/// Each device callback asks [`AudioCallbacks::on_playback`] for one mono
/// sample per output frame and copies it to every channel.
pub fn open(request: &StreamRequest, callbacks: Arc<dyn AudioCallbacks>) -> Result<OwnedStream, AudioError> {
    let device = match &request.device_id {
        Some(id) => get_device_by_id(id)?,
        None => get_default_output_device()?,
    };
    if !device.is_output {
        return Err(AudioError::DeviceNotFound(format!("{} is not an output device", device.name)));
    }

    let channels = device.voice_channels()?;
    let burst_frames = request.burst_frames;

    tracing::info!(
        "Opening playback on '{}': {} ch, {} samples/burst",
        device.name,
        channels,
        burst_frames
    );

    OwnedStream::spawn("audio-playback", burst_latency_ms(burst_frames), move || {
        let device = device.into_inner();

        match build(&device, &voice_stream_config(channels, burst_frames), callbacks.clone()) {
            Ok(stream) => Ok(stream),
            Err(e) if burst_frames > 0 => {
                tracing::warn!(
                    "Playback device rejected {} sample bursts ({}), using its default size",
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
    let mut mono: Vec<i16> = Vec::with_capacity(4096);

    device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mono.clear();
                mono.resize(data.len() / channels, 0);
                callbacks.on_playback(&mut mono);
                upmix(&mono, data, channels);
            },
            move |err| {
                error_callbacks.on_device_error(Direction::Playback, AudioError::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Copy each mono sample to every channel of the interleaved output
fn upmix(mono: &[i16], out: &mut [f32], channels: usize) {
    for (frame, &sample) in out.chunks_mut(channels).zip(mono) {
        frame.fill(i16_to_f32(sample));
    }
    // Trailing partial frame, if the device handed us one
    let covered = mono.len() * channels;
    if covered < out.len() {
        out[covered..].fill(0.0);
    }
}
