//! Capture burst → codec frame accumulator
//!
//! The device hands over bursts of whatever size it likes (192 samples on
//! most low-latency paths); the encoder only accepts exact 20 ms frames.
//! This buffer bridges the two without ever emitting a short frame.

use parking_lot::Mutex;

use crate::constants::FRAME_SAMPLES;

/// One codec frame of mono 16 kHz PCM
pub type PcmFrame = [i16; FRAME_SAMPLES];

/// Default retention bound, in frames, before the oldest samples are shed
const DEFAULT_MAX_FRAMES: usize = 8;

struct Inner {
    samples: Vec<i16>,
    overflowed: u64,
}

/// Lock-guarded sample accumulator
///
/// The lock is held only while samples are appended or a frame is copied
/// out; callers encode after the guard is gone.
pub struct FrameAccumulator {
    inner: Mutex<Inner>,
    max_samples: usize,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::with_max_frames(DEFAULT_MAX_FRAMES)
    }

    /// Accumulator that retains at most `max_frames` frames of backlog
    pub fn with_max_frames(max_frames: usize) -> Self {
        let max_samples = max_frames.max(1) * FRAME_SAMPLES;
        Self {
            inner: Mutex::new(Inner {
                samples: Vec::with_capacity(max_samples + FRAME_SAMPLES),
                overflowed: 0,
            }),
            max_samples,
        }
    }

    /// Append a capture burst and try to extract one frame
    ///
    /// Returns `true` when `frame` was filled with the oldest
    /// [`FRAME_SAMPLES`] samples. Any remainder stays buffered; call
    /// [`next_frame`](Self::next_frame) to drain bursts that completed more
    /// than one frame.
    pub fn append(&self, burst: &[i16], frame: &mut PcmFrame) -> bool {
        let mut inner = self.inner.lock();
        inner.samples.extend_from_slice(burst);

        let len = inner.samples.len();
        if len > self.max_samples {
            // Shed whole frames from the front so alignment is preserved.
            let excess = (len - self.max_samples).div_ceil(FRAME_SAMPLES) * FRAME_SAMPLES;
            inner.samples.drain(..excess.min(len));
            inner.overflowed += excess as u64;
        }

        Self::extract(&mut inner, frame)
    }

    /// Extract another frame if one is fully buffered
    pub fn next_frame(&self, frame: &mut PcmFrame) -> bool {
        let mut inner = self.inner.lock();
        Self::extract(&mut inner, frame)
    }

    fn extract(inner: &mut Inner, frame: &mut PcmFrame) -> bool {
        if inner.samples.len() < FRAME_SAMPLES {
            return false;
        }
        frame.copy_from_slice(&inner.samples[..FRAME_SAMPLES]);
        inner.samples.drain(..FRAME_SAMPLES);
        true
    }

    /// Drop every buffered sample (start of a new talk burst)
    pub fn clear(&self) {
        self.inner.lock().samples.clear();
    }

    /// Samples currently waiting for a full frame
    pub fn buffered(&self) -> usize {
        self.inner.lock().samples.len()
    }

    /// Samples shed because the backlog bound was exceeded
    pub fn overflowed(&self) -> u64 {
        self.inner.lock().overflowed
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: i16, len: usize) -> Vec<i16> {
        (0..len).map(|i| start.wrapping_add(i as i16)).collect()
    }

    #[test]
    fn test_no_short_frames() {
        let acc = FrameAccumulator::new();
        let mut frame = [0i16; FRAME_SAMPLES];

        assert!(!acc.append(&ramp(0, 192), &mut frame));
        assert_eq!(acc.buffered(), 192);
    }

    #[test]
    fn test_unaligned_bursts_produce_ordered_frames() {
        let acc = FrameAccumulator::new();
        let mut frame = [0i16; FRAME_SAMPLES];

        assert!(!acc.append(&ramp(0, 192), &mut frame));
        assert!(acc.append(&ramp(192, 192), &mut frame));

        // Oldest samples first, remainder kept.
        assert_eq!(frame[0], 0);
        assert_eq!(frame[FRAME_SAMPLES - 1], (FRAME_SAMPLES - 1) as i16);
        assert_eq!(acc.buffered(), 384 - FRAME_SAMPLES);
    }

    #[test]
    fn test_large_burst_drains_with_next_frame() {
        let acc = FrameAccumulator::new();
        let mut frame = [0i16; FRAME_SAMPLES];

        assert!(acc.append(&ramp(0, 700), &mut frame));
        assert!(acc.next_frame(&mut frame));
        assert_eq!(frame[0], FRAME_SAMPLES as i16);
        assert!(!acc.next_frame(&mut frame));
        assert_eq!(acc.buffered(), 700 - 2 * FRAME_SAMPLES);
    }

    #[test]
    fn test_clear_discards_partial_frame() {
        let acc = FrameAccumulator::new();
        let mut frame = [0i16; FRAME_SAMPLES];

        acc.append(&ramp(1000, 300), &mut frame);
        acc.clear();
        assert_eq!(acc.buffered(), 0);

        // A fresh burst must not be completed by the stale 300 samples.
        assert!(!acc.append(&ramp(0, 100), &mut frame));
        assert_eq!(acc.buffered(), 100);
    }

    #[test]
    fn test_backlog_is_bounded() {
        let acc = FrameAccumulator::with_max_frames(2);
        let mut frame = [0i16; FRAME_SAMPLES];

        acc.append(&ramp(0, 3 * FRAME_SAMPLES + 10), &mut frame);

        assert!(acc.overflowed() > 0);
        assert!(acc.buffered() <= 2 * FRAME_SAMPLES);
    }
}
