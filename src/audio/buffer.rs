//! Decoded PCM waiting for the playback callback
//!
//! Decoded frames (320 samples) and device bursts (typically 192 samples)
//! do not line up, so the playback side keeps a small sample queue between
//! the decoder and the device.

use std::collections::VecDeque;

use crate::constants::FRAME_SAMPLES;

/// Bounded FIFO of decoded samples
pub struct PlayoutBuffer {
    samples: VecDeque<i16>,
    capacity: usize,
    overflow_count: u64,
    underrun_count: u64,
}

impl PlayoutBuffer {
    /// Buffer holding at most `frames` codec frames
    pub fn new(frames: usize) -> Self {
        let capacity = frames.max(1) * FRAME_SAMPLES;
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            overflow_count: 0,
            underrun_count: 0,
        }
    }

    /// Queue decoded samples, shedding the oldest on overflow
    pub fn push(&mut self, samples: &[i16]) {
        self.samples.extend(samples.iter().copied());
        if self.samples.len() > self.capacity {
            let excess = self.samples.len() - self.capacity;
            self.samples.drain(..excess);
            self.overflow_count += excess as u64;
        }
    }

    /// Fill `out` from the queue, padding any shortfall with silence
    ///
    /// Returns the number of real samples copied.
    pub fn pop_into(&mut self, out: &mut [i16]) -> usize {
        let available = self.samples.len().min(out.len());
        for (dst, src) in out.iter_mut().zip(self.samples.drain(..available)) {
            *dst = src;
        }
        if available < out.len() {
            out[available..].fill(0);
            self.underrun_count += 1;
        }
        available
    }

    /// Whether fewer than `wanted` samples are queued
    pub fn is_low(&self, wanted: usize) -> bool {
        self.samples.len() < wanted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    pub fn underrun_count(&self) -> u64 {
        self.underrun_count
    }

    pub fn reset_stats(&mut self) {
        self.overflow_count = 0;
        self.underrun_count = 0;
    }
}
