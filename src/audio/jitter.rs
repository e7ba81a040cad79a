//! Fixed-capacity jitter buffer for received RTP datagrams
//!
//! Packets are played back strictly in arrival order. No resequencing is
//! done: a late packet is still queued behind whatever arrived before it.
//! Sequence numbers are only used for loss accounting.

use parking_lot::Mutex;

use crate::constants::{JITTER_BUFFER_SLOTS, MAX_RECEIVE_SIZE};
use crate::protocol::rtp::RtpHeader;
use crate::protocol::sequence;

/// One ring cell
#[derive(Debug, Clone)]
pub struct JitterSlot {
    data: Vec<u8>,
    sequence: u16,
    valid: bool,
}

impl JitterSlot {
    fn empty() -> Self {
        Self {
            data: Vec::with_capacity(MAX_RECEIVE_SIZE),
            sequence: 0,
            valid: false,
        }
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Ring state behind the buffer lock
struct Ring {
    slots: Box<[JitterSlot]>,
    head: usize,
    len: usize,
    last_sequence: Option<u16>,
    received: u64,
    lost: u64,
    late: u64,
    evicted: u64,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| JitterSlot::empty()).collect(),
            head: 0,
            len: 0,
            last_sequence: None,
            received: 0,
            lost: 0,
            late: 0,
            evicted: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn tail(&self) -> usize {
        (self.head + self.len) % self.capacity()
    }

    /// Advance past the head slot, returning its index
    fn advance_head(&mut self) -> usize {
        let index = self.head;
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        index
    }
}

/// Lock-guarded FIFO of raw RTP datagrams
pub struct JitterBuffer {
    ring: Mutex<Ring>,
}

impl JitterBuffer {
    /// Buffer with the default [`JITTER_BUFFER_SLOTS`] capacity
    pub fn new() -> Self {
        Self::with_capacity(JITTER_BUFFER_SLOTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring::new(capacity.max(1))),
        }
    }

    /// Queue a received datagram (header included)
    ///
    /// Datagrams too short to carry a header are ignored. A forward jump from
    /// the previous packet adds the skipped count to the loss counter, a
    /// backward step only counts as late. A full
    /// buffer evicts its oldest packet and counts that as one more loss.
    pub fn enqueue(&self, datagram: &[u8]) -> bool {
        let Some(seq) = RtpHeader::peek_sequence(datagram) else {
            return false;
        };
        let len = datagram.len().min(MAX_RECEIVE_SIZE);

        let mut ring = self.ring.lock();

        // Gaps are measured against the previous packet, so a new talker
        // starting lower in sequence space is tracked from its first packet.
        if let Some(last) = ring.last_sequence {
            match sequence::missing_between(last, seq) {
                Some(missing) => ring.lost += u64::from(missing),
                None => ring.late += 1,
            }
        }
        ring.last_sequence = Some(seq);
        ring.received += 1;

        if ring.len == ring.capacity() {
            let oldest = ring.advance_head();
            ring.slots[oldest].valid = false;
            ring.evicted += 1;
            ring.lost += 1;
        }

        let tail = ring.tail();
        let slot = &mut ring.slots[tail];
        slot.data.clear();
        slot.data.extend_from_slice(&datagram[..len]);
        slot.sequence = seq;
        slot.valid = true;
        ring.len += 1;

        true
    }

    /// Copy the oldest queued datagram into `out`
    ///
    /// Returns its sequence number, or `None` when the buffer is empty.
    pub fn dequeue(&self, out: &mut Vec<u8>) -> Option<u16> {
        let mut ring = self.ring.lock();
        while ring.len > 0 {
            let index = ring.advance_head();
            let slot = &mut ring.slots[index];
            if std::mem::take(&mut slot.valid) {
                out.clear();
                out.extend_from_slice(&slot.data);
                return Some(slot.sequence);
            }
        }
        None
    }

    /// Drop every queued packet and zero all statistics
    pub fn reset(&self) {
        let mut ring = self.ring.lock();
        for slot in ring.slots.iter_mut() {
            slot.valid = false;
            slot.data.clear();
        }
        ring.head = 0;
        ring.len = 0;
        ring.last_sequence = None;
        ring.received = 0;
        ring.lost = 0;
        ring.late = 0;
        ring.evicted = 0;
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity()
    }

    pub fn packets_lost(&self) -> u64 {
        self.ring.lock().lost
    }

    pub fn stats(&self) -> JitterStats {
        let ring = self.ring.lock();
        JitterStats {
            depth: ring.len,
            capacity: ring.capacity(),
            received: ring.received,
            lost: ring.lost,
            late: ring.late,
            evicted: ring.evicted,
        }
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JitterStats {
    pub depth: usize,
    pub capacity: usize,
    pub received: u64,
    pub lost: u64,
    pub late: u64,
    pub evicted: u64,
}

impl JitterStats {
    pub fn loss_rate(&self) -> f32 {
        let expected = self.received + self.lost;
        if expected == 0 {
            0.0
        } else {
            self.lost as f32 / expected as f32
        }
    }
}
