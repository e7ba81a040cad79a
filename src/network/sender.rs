//! RTP packetization and destination fan-out

use bytes::BytesMut;
use std::net::{SocketAddrV4, UdpSocket};

use crate::constants::WIRE_SAMPLES_PER_FRAME;
use crate::error::NetworkError;
use crate::protocol::rtp::{self, RtpHeader, MAX_DATAGRAM_SIZE};
use crate::protocol::sequence;

/// Per-session RTP header state
#[derive(Debug, Clone)]
pub struct RtpSequencer {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpSequencer {
    pub fn new(ssrc: u32, initial_sequence: u16, initial_timestamp: u32) -> Self {
        Self {
            ssrc,
            sequence: initial_sequence,
            timestamp: initial_timestamp,
        }
    }

    /// Sequencer with random initial sequence number and timestamp
    pub fn random(ssrc: u32) -> Self {
        Self::new(ssrc, rand::random(), rand::random())
    }

    /// Header for the next frame; advances sequence by one and timestamp by
    /// one frame at the 48 kHz wire clock
    pub fn next_header(&mut self, marker: bool) -> RtpHeader {
        let header = RtpHeader::opus(marker, self.sequence, self.timestamp, self.ssrc);
        self.sequence = sequence::next(self.sequence);
        self.timestamp = self.timestamp.wrapping_add(WIRE_SAMPLES_PER_FRAME);
        header
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next header will carry
    pub fn next_sequence(&self) -> u16 {
        self.sequence
    }

    pub fn next_timestamp(&self) -> u32 {
        self.timestamp
    }
}

/// A datagram ready for the wire
pub struct OutgoingPacket {
    pub header: RtpHeader,
    pub datagram: BytesMut,
    /// Payload bytes cut off to respect [`MAX_DATAGRAM_SIZE`]
    pub truncated: usize,
}

impl OutgoingPacket {
    pub fn build(header: RtpHeader, payload: &[u8]) -> Self {
        let mut datagram = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);
        let truncated = rtp::packetize(&header, payload, &mut datagram);
        Self {
            header,
            datagram,
            truncated,
        }
    }
}

/// Outcome of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub accepted: usize,
    pub failed: usize,
}

/// Send `datagram` to every destination
///
/// Individual failures are logged and skipped. The send succeeds when at
/// least one destination accepted the datagram. With no destinations at all
/// the result is `NoDestination`; when every destination refused it, the
/// last socket error is returned as `SendFailed`.
pub fn fan_out(
    socket: &UdpSocket,
    datagram: &[u8],
    destinations: &[SocketAddrV4],
) -> Result<Delivery, NetworkError> {
    if destinations.is_empty() {
        return Err(NetworkError::NoDestination);
    }

    let mut delivery = Delivery::default();
    let mut last_error = None;

    for dest in destinations {
        match socket.send_to(datagram, dest) {
            Ok(_) => delivery.accepted += 1,
            Err(e) => {
                delivery.failed += 1;
                tracing::warn!("Failed to send RTP packet to {}: {}", dest, e);
                last_error = Some(NetworkError::SendFailed(format!("{}: {}", dest, e)));
            }
        }
    }

    match last_error {
        Some(e) if delivery.accepted == 0 => Err(e),
        _ => Ok(delivery),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    #[test]
    fn test_sequence_increments_by_one_with_wrap() {
        let mut seq = RtpSequencer::new(7, 65534, 0);

        let a = seq.next_header(true);
        let b = seq.next_header(false);
        let c = seq.next_header(false);

        assert_eq!((a.sequence, b.sequence, c.sequence), (65534, 65535, 0));
        assert!(a.marker && !b.marker);
        assert_eq!(seq.next_sequence(), 1);
    }

    #[test]
    fn test_timestamp_uses_wire_clock() {
        let mut seq = RtpSequencer::new(7, 0, u32::MAX - 100);

        let a = seq.next_header(false);
        let b = seq.next_header(false);

        assert_eq!(b.timestamp.wrapping_sub(a.timestamp), 960);
        assert_eq!(seq.next_timestamp(), b.timestamp.wrapping_add(960));
        assert_eq!(a.ssrc, seq.ssrc());
    }

    #[test]
    fn test_build_truncates() {
        let header = RtpHeader::opus(false, 1, 2, 3);
        let packet = OutgoingPacket::build(header, &[0u8; 2000]);
        assert_eq!(packet.datagram.len(), MAX_DATAGRAM_SIZE);
        assert_eq!(packet.truncated, 2000 - (MAX_DATAGRAM_SIZE - 12));
    }

    #[test]
    fn test_fan_out_requires_a_destination() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        assert!(matches!(
            fan_out(&socket, b"x", &[]),
            Err(NetworkError::NoDestination)
        ));
    }

    #[test]
    fn test_fan_out_partial_and_total_failure() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let std::net::SocketAddr::V4(good) = peer.local_addr().unwrap() else {
            panic!("expected IPv4");
        };
        // Port 0 is never a valid UDP destination
        let bad = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);

        let delivery = fan_out(&socket, b"voice", &[bad, good]).unwrap();
        assert_eq!(delivery, Delivery { accepted: 1, failed: 1 });

        assert!(matches!(
            fan_out(&socket, b"voice", &[bad]),
            Err(NetworkError::SendFailed(_))
        ));
    }

    #[test]
    fn test_fan_out_reaches_every_peer() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let a = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let b = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        a.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        b.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

        let dests: Vec<SocketAddrV4> = [&a, &b]
            .iter()
            .map(|s| match s.local_addr().unwrap() {
                std::net::SocketAddr::V4(v4) => v4,
                other => panic!("unexpected {other}"),
            })
            .collect();

        let delivery = fan_out(&socket, b"voice", &dests).unwrap();
        assert_eq!(delivery.accepted, 2);

        let mut buf = [0u8; 8];
        assert_eq!(a.recv(&mut buf).unwrap(), 5);
        assert_eq!(b.recv(&mut buf).unwrap(), 5);
    }
}
