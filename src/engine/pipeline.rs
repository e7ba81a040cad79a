//! Audio pipeline orchestrator
//!
//! Send path (capture thread):
//! burst → [`FrameAccumulator`] → [`VoiceEncoder`] → [`RtpTransport::send_frame`]
//!
//! Receive path (network thread, then playback thread):
//! datagram → [`JitterBuffer`] → [`VoiceDecoder`] (or concealment) → playout queue → device
//!
//! Locking: the accumulator, encoder, decoder, jitter buffer, playout
//! queue, statistics and peer set each have their own lock, and no
//! real-time path ever holds two of them at once. The `capturing` and
//! `playing` atomics are read lock-free by the callbacks. Control calls
//! serialize on the device lock, which the callbacks never touch.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::audio::{
    AudioBackend, AudioCallbacks, DeviceStream, Direction, FrameAccumulator, JitterBuffer, PcmFrame,
    PlayoutBuffer, StreamRequest,
};
use crate::codec::{VoiceDecoder, VoiceEncoder};
use crate::config::{AppConfig, CodecConfig};
use crate::constants::{FRAME_DURATION_MS, FRAME_SAMPLES, MAX_RECEIVE_SIZE, SAMPLE_RATE};
use crate::error::{AudioError, Error, NetworkError, Result};
use crate::network::{parse_peer, RtpTransport};
use crate::protocol::{rtp, AudioDeviceInfo, TransportMode};

use super::stats::{StatsRecorder, StatsSnapshot};

/// Faults kept for the host before new ones are dropped
const FAULT_QUEUE_DEPTH: usize = 16;

/// An asynchronous device failure reported to the host
#[derive(Debug, Clone, Serialize)]
pub struct DeviceFault {
    pub direction: Direction,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Status reported to the control surface
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub capturing: bool,
    pub playing: bool,
    pub requested_mode: TransportMode,
    pub mode: TransportMode,
    pub multicast_joined: bool,
    pub group: String,
    pub ssrc: u32,
    pub peers: Vec<String>,
    pub receiving: bool,
    pub latency_ms: f32,
}

/// Where a played-out frame came from
enum FrameSource {
    Decoded,
    /// A packet was queued but libopus rejected it
    DecodeFailed,
    /// Nothing queued
    Missing,
}

/// Decoded samples plus the scratch buffer used to pull datagrams
struct Playout {
    buffer: PlayoutBuffer,
    packet: Vec<u8>,
}

/// State shared between the device callbacks, the receive thread and the
/// control plane
pub struct PipelineCore {
    capturing: AtomicBool,
    playing: AtomicBool,
    /// Next frame sent starts a talk burst
    burst_start: AtomicBool,
    accumulator: FrameAccumulator,
    encoder: Mutex<VoiceEncoder>,
    decoder: Mutex<VoiceDecoder>,
    jitter: Arc<JitterBuffer>,
    playout: Mutex<Playout>,
    transport: RtpTransport,
    stats: StatsRecorder,
    faults: Sender<DeviceFault>,
    /// Most recent fault, kept until that direction is restarted
    last_fault: Mutex<Option<DeviceFault>>,
}

impl PipelineCore {
    /// Encode one frame and hand it to the transport
    fn send_frame(&self, frame: &PcmFrame) {
        let encoded = self.encoder.lock().encode_frame(frame);
        let payload = match encoded {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Encode failed, frame dropped: {}", e);
                self.stats.update(|s| s.encode_errors += 1);
                return;
            }
        };

        let marker = self.burst_start.swap(false, Ordering::AcqRel);
        match self.transport.send_frame(&payload, marker) {
            Ok(sent) => self.stats.update(|s| {
                s.frames_encoded += 1;
                s.packets_sent += 1;
                s.bytes_out += sent as u64;
            }),
            Err(e) => {
                match e {
                    NetworkError::NoDestination => tracing::trace!("Frame not sent: {}", e),
                    _ => tracing::warn!("Frame not sent: {}", e),
                }
                self.stats.update(|s| {
                    s.frames_encoded += 1;
                    s.send_errors += 1;
                });
            }
        }
    }

    /// Produce one frame from the next queued packet, or by concealment
    fn next_decoded_frame(&self, packet: &mut Vec<u8>, frame: &mut PcmFrame) {
        let sequence = self.jitter.dequeue(packet);

        let outcome = {
            let mut decoder = self.decoder.lock();
            match sequence {
                Some(sequence) => match decoder.decode(rtp::payload(packet), frame) {
                    Ok(()) => FrameSource::Decoded,
                    Err(e) => {
                        tracing::debug!("Packet {} not decodable, concealing: {}", sequence, e);
                        decoder.conceal_loss(frame);
                        FrameSource::DecodeFailed
                    }
                },
                None => {
                    decoder.conceal_loss(frame);
                    FrameSource::Missing
                }
            }
        };

        self.stats.update(|s| match outcome {
            FrameSource::Decoded => s.frames_decoded += 1,
            FrameSource::DecodeFailed => {
                s.decode_errors += 1;
                s.frames_concealed += 1;
            }
            FrameSource::Missing => s.frames_concealed += 1,
        });
    }

    fn clear_fault(&self, direction: Direction) {
        let mut last_fault = self.last_fault.lock();
        if last_fault.as_ref().is_some_and(|f| f.direction == direction) {
            *last_fault = None;
        }
    }

    fn flag(&self, direction: Direction) -> &AtomicBool {
        match direction {
            Direction::Capture => &self.capturing,
            Direction::Playback => &self.playing,
        }
    }
}

impl AudioCallbacks for PipelineCore {
    fn on_capture(&self, burst: &[i16]) {
        if !self.capturing.load(Ordering::Acquire) {
            return;
        }

        let mut frame: PcmFrame = [0; FRAME_SAMPLES];
        let mut ready = self.accumulator.append(burst, &mut frame);
        while ready {
            self.send_frame(&frame);
            ready = self.accumulator.next_frame(&mut frame);
        }
    }

    fn on_playback(&self, out: &mut [i16]) {
        if !self.playing.load(Ordering::Acquire) {
            out.fill(0);
            return;
        }

        // Bounded so a callback larger than the playout queue cannot spin
        let mut frame: PcmFrame = [0; FRAME_SAMPLES];
        for _ in 0..out.len().div_ceil(FRAME_SAMPLES) {
            let mut packet = {
                let mut playout = self.playout.lock();
                if !playout.buffer.is_low(out.len()) {
                    break;
                }
                std::mem::take(&mut playout.packet)
            };

            self.next_decoded_frame(&mut packet, &mut frame);

            let mut playout = self.playout.lock();
            playout.buffer.push(&frame);
            playout.packet = packet;
        }

        self.playout.lock().buffer.pop_into(out);
    }

    fn on_device_error(&self, direction: Direction, error: AudioError) {
        self.flag(direction).store(false, Ordering::Release);
        tracing::error!("{} device error, {} stopped: {}", direction, direction, error);

        let fault = DeviceFault {
            direction,
            message: error.to_string(),
            at: Utc::now(),
        };
        *self.last_fault.lock() = Some(fault.clone());
        if self.faults.try_send(fault).is_err() {
            tracing::debug!("Device fault queue full, dropping fault");
        }
    }
}

#[derive(Default)]
struct Devices {
    capture: Option<Box<dyn DeviceStream>>,
    playback: Option<Box<dyn DeviceStream>>,
}

/// The voice engine: explicitly constructed, shared by handle
pub struct AudioPipeline {
    core: Arc<PipelineCore>,
    devices: Mutex<Devices>,
    fault_rx: Receiver<DeviceFault>,
    backend: Arc<dyn AudioBackend>,
    config: AppConfig,
}

impl AudioPipeline {
    /// Open the transport, the codec and both device streams
    ///
    /// Streams are opened but not started. On failure everything acquired
    /// so far is released, most recent first, before the error is returned.
    pub fn initialize(config: AppConfig, backend: Arc<dyn AudioBackend>) -> Result<Self> {
        tracing::info!(
            "Initializing pipeline: group {}:{}, mode {}",
            config.network.group,
            config.network.port,
            config.network.mode
        );

        let transport = RtpTransport::open(&config.network)?;
        let encoder = VoiceEncoder::new(config.codec.clone())?;
        let decoder = VoiceDecoder::new()?;
        let (fault_tx, fault_rx) = bounded(FAULT_QUEUE_DEPTH);

        let core = Arc::new(PipelineCore {
            capturing: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            burst_start: AtomicBool::new(false),
            accumulator: FrameAccumulator::new(),
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            jitter: Arc::new(JitterBuffer::new()),
            playout: Mutex::new(Playout {
                buffer: PlayoutBuffer::new(config.audio.playout_frames),
                packet: Vec::with_capacity(MAX_RECEIVE_SIZE),
            }),
            transport,
            stats: StatsRecorder::new(),
            faults: fault_tx,
            last_fault: Mutex::new(None),
        });

        let weak: Weak<PipelineCore> = Arc::downgrade(&core);
        core.transport.set_receive_callback(Arc::new(move |ssrc: u32, payload: &[u8]| {
            if let Some(core) = weak.upgrade() {
                core.stats.update(|s| {
                    s.packets_received += 1;
                    s.bytes_in += payload.len() as u64;
                    s.last_talker = Some(ssrc);
                });
            }
        }));

        let callbacks: Arc<dyn AudioCallbacks> = core.clone();
        let capture = backend.open_capture(
            &StreamRequest {
                device_id: config.audio.input_device.clone(),
                burst_frames: config.audio.burst_frames,
            },
            callbacks.clone(),
        )?;
        let playback = backend.open_playback(
            &StreamRequest {
                device_id: config.audio.output_device.clone(),
                burst_frames: config.audio.burst_frames,
            },
            callbacks,
        )?;

        core.transport.start_receive_loop(core.jitter.clone())?;

        tracing::info!(
            "Pipeline ready: ssrc {:08x}, {} transport",
            core.transport.ssrc(),
            core.transport.mode()
        );

        Ok(Self {
            core,
            devices: Mutex::new(Devices {
                capture: Some(capture),
                playback: Some(playback),
            }),
            fault_rx,
            backend,
            config,
        })
    }

    /// Begin a talk burst
    pub fn start_capture(&self) -> Result<()> {
        let mut devices = self.devices.lock();
        if self.core.capturing.load(Ordering::Acquire) {
            return Ok(());
        }
        let stream = devices.capture.as_mut().ok_or(Error::NotInitialized)?;

        self.core.encoder.lock().reset()?;
        self.core.accumulator.clear();
        self.core.burst_start.store(true, Ordering::Release);

        stream.start()?;
        self.core.clear_fault(Direction::Capture);
        self.core.stats.update(|s| {
            s.talk_bursts += 1;
            s.capture_started_at = Some(Utc::now());
        });
        self.core.capturing.store(true, Ordering::Release);

        tracing::info!("Capture started");
        Ok(())
    }

    /// End the talk burst
    pub fn stop_capture(&self) -> Result<()> {
        let mut devices = self.devices.lock();
        let was_capturing = self.core.capturing.swap(false, Ordering::AcqRel);

        if let Some(stream) = devices.capture.as_mut() {
            stream.stop()?;
        }
        if was_capturing {
            tracing::info!("Capture stopped");
        }
        Ok(())
    }

    pub fn start_playback(&self) -> Result<()> {
        let mut devices = self.devices.lock();
        if self.core.playing.load(Ordering::Acquire) {
            return Ok(());
        }
        let stream = devices.playback.as_mut().ok_or(Error::NotInitialized)?;

        self.core.decoder.lock().reset()?;
        self.core.jitter.reset();
        {
            let mut playout = self.core.playout.lock();
            playout.buffer.clear();
            playout.buffer.reset_stats();
        }

        stream.start()?;
        self.core.clear_fault(Direction::Playback);
        self.core
            .stats
            .update(|s| s.playback_started_at = Some(Utc::now()));
        self.core.playing.store(true, Ordering::Release);

        tracing::info!("Playback started");
        Ok(())
    }

    pub fn stop_playback(&self) -> Result<()> {
        let mut devices = self.devices.lock();
        let was_playing = self.core.playing.swap(false, Ordering::AcqRel);

        if let Some(stream) = devices.playback.as_mut() {
            stream.stop()?;
        }
        if was_playing {
            tracing::info!("Playback stopped");
        }
        Ok(())
    }

    pub fn is_capturing(&self) -> bool {
        self.core.capturing.load(Ordering::Acquire)
    }

    pub fn is_playing(&self) -> bool {
        self.core.playing.load(Ordering::Acquire)
    }

    pub fn add_peer(&self, peer: SocketAddrV4) -> bool {
        self.core.transport.add_peer(peer)
    }

    /// Add a peer given as `ip` or `ip:port` (default: the configured port)
    pub fn add_peer_address(&self, address: &str) -> Result<SocketAddrV4> {
        let peer = parse_peer(address, self.config.network.port)?;
        self.core.transport.add_peer(peer);
        Ok(peer)
    }

    pub fn clear_peers(&self) {
        self.core.transport.clear_peers();
    }

    pub fn peers(&self) -> Vec<SocketAddrV4> {
        self.core.transport.peers()
    }

    /// Apply new encoder settings; out-of-range values are clamped
    pub fn configure_codec(&self, config: &CodecConfig) -> Result<CodecConfig> {
        let mut encoder = self.core.encoder.lock();
        encoder.set_bitrate(config.bitrate)?;
        encoder.set_fec(config.fec)?;
        encoder.set_complexity(config.complexity)?;
        encoder.set_dtx(config.dtx)?;
        Ok(encoder.config().clone())
    }

    pub fn codec_config(&self) -> CodecConfig {
        self.core.encoder.lock().config().clone()
    }

    /// Mouth-to-ear estimate: both device buffers, the jitter queue and the
    /// decoded samples waiting for the speaker
    pub fn latency_estimate_ms(&self) -> f32 {
        let device_ms: f32 = {
            let devices = self.devices.lock();
            [&devices.capture, &devices.playback]
                .into_iter()
                .flatten()
                .map(|stream| stream.latency_ms())
                .sum()
        };
        let jitter_ms = (self.core.jitter.len() as u32 * FRAME_DURATION_MS) as f32;
        let playout_ms =
            self.core.playout.lock().buffer.len() as f32 * 1000.0 / SAMPLE_RATE as f32;

        device_ms + jitter_ms + playout_ms
    }

    pub fn stats(&self) -> StatsSnapshot {
        let (underruns, overflows) = {
            let playout = self.core.playout.lock();
            (playout.buffer.underrun_count(), playout.buffer.overflow_count())
        };

        StatsSnapshot::assemble(
            self.core.stats.get(),
            &self.core.transport.stats(),
            self.core.jitter.stats(),
            underruns,
            overflows,
            self.core.accumulator.overflowed(),
            self.latency_estimate_ms(),
        )
    }

    pub fn status(&self) -> PipelineStatus {
        let transport = &self.core.transport;
        PipelineStatus {
            capturing: self.is_capturing(),
            playing: self.is_playing(),
            requested_mode: transport.requested_mode(),
            mode: transport.mode(),
            multicast_joined: transport.is_multicast_joined(),
            group: transport.group().to_string(),
            ssrc: transport.ssrc(),
            peers: transport.peers().iter().map(ToString::to_string).collect(),
            receiving: transport.is_receiving(),
            latency_ms: self.latency_estimate_ms(),
        }
    }

    /// Queue a datagram the host received itself
    ///
    /// The datagram goes through the same screening as the receive loop.
    /// Returns whether it was accepted.
    pub fn enqueue_packet(&self, datagram: &[u8]) -> bool {
        self.core.transport.ingest(&self.core.jitter, datagram)
    }

    /// Next device fault not yet seen by the host
    pub fn take_device_fault(&self) -> Option<DeviceFault> {
        self.fault_rx.try_recv().ok()
    }

    /// Most recent device fault, without consuming it
    ///
    /// Cleared once the faulted direction is started again.
    pub fn last_device_fault(&self) -> Option<DeviceFault> {
        self.core.last_fault.lock().clone()
    }

    pub fn list_devices(&self) -> Vec<AudioDeviceInfo> {
        self.backend.list_devices()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.core.transport.local_addr()
    }

    pub fn ssrc(&self) -> u32 {
        self.core.transport.ssrc()
    }

    /// Stop both directions, the receive loop and release the devices
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if let Err(e) = self.stop_capture() {
            tracing::warn!("Stopping capture during shutdown: {}", e);
        }
        if let Err(e) = self.stop_playback() {
            tracing::warn!("Stopping playback during shutdown: {}", e);
        }
        self.core.transport.stop_receive_loop();

        let mut devices = self.devices.lock();
        let had_devices = devices.capture.is_some() || devices.playback.is_some();
        devices.playback.take();
        devices.capture.take();
        if had_devices {
            tracing::info!("Pipeline shut down");
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    struct MockStream {
        running: Arc<AtomicBool>,
        dropped: Arc<AtomicUsize>,
    }

    impl DeviceStream for MockStream {
        fn start(&mut self) -> std::result::Result<(), AudioError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) -> std::result::Result<(), AudioError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn latency_ms(&self) -> f32 {
            12.0
        }
    }

    impl Drop for MockStream {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockBackend {
        callbacks: Mutex<Option<Arc<dyn AudioCallbacks>>>,
        capture_running: Arc<AtomicBool>,
        playback_running: Arc<AtomicBool>,
        dropped: Arc<AtomicUsize>,
        fail_playback: bool,
    }

    impl MockBackend {
        fn callbacks(&self) -> Arc<dyn AudioCallbacks> {
            self.callbacks.lock().clone().unwrap()
        }
    }

    impl AudioBackend for MockBackend {
        fn open_capture(
            &self,
            _request: &StreamRequest,
            callbacks: Arc<dyn AudioCallbacks>,
        ) -> std::result::Result<Box<dyn DeviceStream>, AudioError> {
            *self.callbacks.lock() = Some(callbacks);
            Ok(Box::new(MockStream {
                running: self.capture_running.clone(),
                dropped: self.dropped.clone(),
            }))
        }

        fn open_playback(
            &self,
            _request: &StreamRequest,
            _callbacks: Arc<dyn AudioCallbacks>,
        ) -> std::result::Result<Box<dyn DeviceStream>, AudioError> {
            if self.fail_playback {
                return Err(AudioError::DeviceNotFound("output:none".into()));
            }
            Ok(Box::new(MockStream {
                running: self.playback_running.clone(),
                dropped: self.dropped.clone(),
            }))
        }
    }

    fn test_config() -> AppConfig {
        AppConfig {
            network: NetworkConfig {
                port: 0,
                mode: TransportMode::Unicast,
                ..NetworkConfig::default()
            },
            ..AppConfig::default()
        }
    }

    fn pipeline() -> (AudioPipeline, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::default());
        let pipeline = AudioPipeline::initialize(test_config(), backend.clone()).unwrap();
        (pipeline, backend)
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_start_stop_flags_and_streams() {
        let (pipeline, backend) = pipeline();
        assert!(!pipeline.is_capturing());

        pipeline.start_capture().unwrap();
        assert!(pipeline.is_capturing());
        assert!(backend.capture_running.load(Ordering::SeqCst));

        pipeline.stop_capture().unwrap();
        assert!(!pipeline.is_capturing());
        assert!(!backend.capture_running.load(Ordering::SeqCst));

        pipeline.start_playback().unwrap();
        assert!(pipeline.is_playing());
        pipeline.stop_playback().unwrap();
        assert!(!pipeline.is_playing());
    }

    #[test]
    fn test_restart_leaves_no_stale_samples() {
        let (pipeline, backend) = pipeline();
        let callbacks = backend.callbacks();

        pipeline.start_capture().unwrap();
        callbacks.on_capture(&[100i16; 500]);
        assert_eq!(pipeline.core.accumulator.buffered(), 500 - FRAME_SAMPLES);

        pipeline.stop_capture().unwrap();
        pipeline.start_capture().unwrap();
        assert_eq!(pipeline.core.accumulator.buffered(), 0);
        assert!(pipeline.core.burst_start.load(Ordering::SeqCst));
    }

    #[test]
    fn test_capture_ignored_when_not_capturing() {
        let (pipeline, backend) = pipeline();
        backend.callbacks().on_capture(&[1i16; 1000]);

        assert_eq!(pipeline.core.accumulator.buffered(), 0);
        assert_eq!(pipeline.stats().session.frames_encoded, 0);
    }

    #[test]
    fn test_playback_silent_when_not_playing() {
        let (_pipeline, backend) = pipeline();
        let mut out = [7i16; 192];
        backend.callbacks().on_playback(&mut out);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_playback_conceals_without_packets() {
        let (pipeline, backend) = pipeline();
        pipeline.start_playback().unwrap();

        let mut out = [7i16; 192];
        backend.callbacks().on_playback(&mut out);

        let stats = pipeline.stats();
        assert_eq!(stats.session.frames_concealed, 1);
        assert_eq!(stats.session.frames_decoded, 0);
        assert!(out.iter().all(|&s| s.unsigned_abs() < 7));
    }

    #[test]
    fn test_undecodable_packet_is_concealed_and_counted() {
        let (pipeline, backend) = pipeline();
        pipeline.start_playback().unwrap();

        let header = rtp::RtpHeader::opus(false, 9, 0, pipeline.ssrc().wrapping_add(1));
        let mut datagram = header.to_bytes().to_vec();
        datagram.extend_from_slice(&[0xFF; 3]);
        assert!(pipeline.enqueue_packet(&datagram));

        let mut out = [7i16; 192];
        backend.callbacks().on_playback(&mut out);

        let stats = pipeline.stats();
        assert_eq!(stats.session.decode_errors, 1);
        assert_eq!(stats.session.frames_concealed, 1);
        assert_eq!(stats.session.frames_decoded, 0);
        assert_eq!(stats.jitter.depth, 0);
        assert!(out.iter().all(|&s| s.unsigned_abs() < 7));
    }

    #[test]
    fn test_marker_only_on_first_frame_of_burst() {
        let (pipeline, backend) = pipeline();
        let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sink.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let std::net::SocketAddr::V4(sink_addr) = sink.local_addr().unwrap() else {
            panic!("expected IPv4");
        };
        pipeline.add_peer(sink_addr);

        pipeline.start_capture().unwrap();
        backend.callbacks().on_capture(&[0i16; FRAME_SAMPLES * 3]);

        let mut buf = [0u8; 1500];
        let markers: Vec<bool> = (0..3)
            .map(|_| {
                let len = sink.recv(&mut buf).unwrap();
                rtp::RtpHeader::parse(&buf[..len]).unwrap().marker
            })
            .collect();
        assert_eq!(markers, vec![true, false, false]);
        assert_eq!(pipeline.stats().session.packets_sent, 3);
    }

    #[test]
    fn test_silence_end_to_end_over_loopback() {
        let (alice, alice_backend) = pipeline();
        let (bob, bob_backend) = pipeline();
        alice.add_peer(bob.local_addr());

        bob.start_playback().unwrap();
        alice.start_capture().unwrap();

        // 192-sample bursts, as a low-latency device delivers them
        let burst = [0i16; 192];
        for _ in 0..5 {
            alice_backend.callbacks().on_capture(&burst);
        }
        let sent = alice.stats().session.packets_sent;
        assert_eq!(sent, 3);

        assert!(wait_for(|| bob.stats().session.packets_received == sent));
        assert_eq!(bob.stats().session.last_talker, Some(alice.ssrc()));

        let mut out = [1i16; FRAME_SAMPLES];
        bob_backend.callbacks().on_playback(&mut out);

        let stats = bob.stats();
        assert_eq!(stats.session.frames_decoded, 1);
        assert_eq!(out.len(), FRAME_SAMPLES);
        let energy: i64 = out.iter().map(|&s| i64::from(s) * i64::from(s)).sum();
        assert!(energy / (FRAME_SAMPLES as i64) < 100);
    }

    #[test]
    fn test_own_packets_dropped() {
        let (pipeline, backend) = pipeline();
        pipeline.add_peer(pipeline.local_addr());

        pipeline.start_capture().unwrap();
        backend.callbacks().on_capture(&[0i16; FRAME_SAMPLES]);

        assert!(wait_for(|| pipeline.stats().loopback_dropped == 1));
        assert_eq!(pipeline.stats().jitter.depth, 0);
        assert_eq!(pipeline.stats().session.packets_received, 0);
    }

    #[test]
    fn test_enqueue_packet_screens_input() {
        let (pipeline, _backend) = pipeline();
        let header = rtp::RtpHeader::opus(false, 5, 0, pipeline.ssrc().wrapping_add(1));
        let mut datagram = header.to_bytes().to_vec();
        datagram.extend_from_slice(&[0xF8, 0xFF, 0xFE]);

        assert!(pipeline.enqueue_packet(&datagram));
        assert!(!pipeline.enqueue_packet(&header.to_bytes()));
        assert_eq!(pipeline.stats().jitter.depth, 1);
    }

    #[test]
    fn test_device_error_clears_flag_and_surfaces() {
        let (pipeline, backend) = pipeline();
        pipeline.start_playback().unwrap();
        assert!(pipeline.take_device_fault().is_none());

        backend.callbacks().on_device_error(
            Direction::Playback,
            AudioError::StreamError("device unplugged".into()),
        );

        assert!(!pipeline.is_playing());
        let fault = pipeline.take_device_fault().unwrap();
        assert_eq!(fault.direction, Direction::Playback);
        assert!(fault.message.contains("unplugged"));
        assert!(pipeline.take_device_fault().is_none());
    }

    #[test]
    fn test_last_fault_survives_reads_until_restart() {
        let (pipeline, backend) = pipeline();
        pipeline.start_playback().unwrap();
        backend.callbacks().on_device_error(
            Direction::Playback,
            AudioError::StreamError("device unplugged".into()),
        );

        assert_eq!(pipeline.last_device_fault().unwrap().direction, Direction::Playback);
        assert_eq!(pipeline.last_device_fault().unwrap().direction, Direction::Playback);

        // Restarting the other direction leaves it in place
        pipeline.start_capture().unwrap();
        assert!(pipeline.last_device_fault().is_some());

        pipeline.start_playback().unwrap();
        assert!(pipeline.last_device_fault().is_none());
    }

    #[test]
    fn test_latency_estimate() {
        let (pipeline, _backend) = pipeline();
        // Two mock streams at 12 ms each, nothing queued
        assert!((pipeline.latency_estimate_ms() - 24.0).abs() < 1e-3);
    }

    #[test]
    fn test_failed_initialization_releases_capture() {
        let backend = Arc::new(MockBackend {
            fail_playback: true,
            ..MockBackend::default()
        });
        let result = AudioPipeline::initialize(test_config(), backend.clone());

        assert!(matches!(result, Err(Error::Audio(AudioError::DeviceNotFound(_)))));
        assert_eq!(backend.dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_peer_address_defaults_to_configured_port() {
        let (pipeline, _backend) = pipeline();
        let peer = pipeline.add_peer_address("10.0.0.7").unwrap();
        assert_eq!(peer.port(), pipeline.config().network.port);
        assert!(matches!(
            pipeline.add_peer_address("nope"),
            Err(Error::Network(NetworkError::InvalidAddress(_)))
        ));

        pipeline.clear_peers();
        assert!(pipeline.peers().is_empty());
    }

    #[test]
    fn test_configure_codec_clamps() {
        let (pipeline, _backend) = pipeline();
        let applied = pipeline
            .configure_codec(&CodecConfig {
                bitrate: 100_000,
                complexity: 30,
                ..CodecConfig::default()
            })
            .unwrap();
        assert_eq!(applied.bitrate, 24_000);
        assert_eq!(applied.complexity, 10);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (pipeline, backend) = pipeline();
        pipeline.shutdown();
        pipeline.shutdown();
        assert_eq!(backend.dropped.load(Ordering::SeqCst), 2);
        assert!(matches!(pipeline.start_capture(), Err(Error::NotInitialized)));
    }
}
