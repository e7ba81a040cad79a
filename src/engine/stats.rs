//! Session statistics
//!
//! Purely observational: nothing in the pipeline branches on these values.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::audio::JitterStats;
use crate::network::TransportStats;

/// Counters the pipeline updates as events happen
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub frames_encoded: u64,
    pub frames_decoded: u64,
    pub frames_concealed: u64,
    pub encode_errors: u64,
    pub decode_errors: u64,
    pub send_errors: u64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub talk_bursts: u64,
    /// SSRC of the most recent remote sender
    pub last_talker: Option<u32>,
    pub capture_started_at: Option<DateTime<Utc>>,
    pub playback_started_at: Option<DateTime<Utc>>,
}

/// Lock-guarded [`SessionStats`]
///
/// Each update takes the lock for one closure call; callers never hold it
/// across codec or network work.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    inner: Mutex<SessionStats>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, f: impl FnOnce(&mut SessionStats)) {
        f(&mut self.inner.lock());
    }

    pub fn get(&self) -> SessionStats {
        self.inner.lock().clone()
    }

    pub fn reset(&self) {
        *self.inner.lock() = SessionStats::default();
    }
}

/// Everything `GET /api/stats` reports
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub session: SessionStats,
    pub packets_lost: u64,
    pub loss_rate: f32,
    pub loopback_dropped: u64,
    pub invalid_packets: u64,
    pub send_failures: u64,
    pub packets_truncated: u64,
    pub jitter: JitterStats,
    pub playout_underruns: u64,
    pub playout_overflows: u64,
    pub accumulator_overflowed: u64,
    pub latency_ms: f32,
}

impl StatsSnapshot {
    pub fn assemble(
        session: SessionStats,
        transport: &TransportStats,
        jitter: JitterStats,
        playout_underruns: u64,
        playout_overflows: u64,
        accumulator_overflowed: u64,
        latency_ms: f32,
    ) -> Self {
        Self {
            session,
            packets_lost: jitter.lost,
            loss_rate: jitter.loss_rate(),
            loopback_dropped: transport.receive.loopback_dropped,
            invalid_packets: transport.receive.invalid_packets,
            send_failures: transport.send_failures,
            packets_truncated: transport.packets_truncated,
            jitter,
            playout_underruns,
            playout_overflows,
            accumulator_overflowed,
            latency_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_update_and_reset() {
        let stats = StatsRecorder::new();
        stats.update(|s| {
            s.frames_encoded += 2;
            s.last_talker = Some(9);
        });
        assert_eq!(stats.get().frames_encoded, 2);

        stats.reset();
        assert_eq!(stats.get().frames_encoded, 0);
        assert!(stats.get().last_talker.is_none());
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let jitter = JitterStats {
            lost: 3,
            received: 7,
            ..JitterStats::default()
        };
        let snapshot = StatsSnapshot::assemble(
            SessionStats::default(),
            &TransportStats::default(),
            jitter,
            0,
            0,
            0,
            42.0,
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["packets_lost"], 3);
        assert_eq!(json["frames_encoded"], 0);
        assert_eq!(json["jitter"]["received"], 7);
        assert!((snapshot.loss_rate - 0.3).abs() < 1e-6);
    }
}
