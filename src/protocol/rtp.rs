//! RTP fixed header (RFC 3550 §5.1)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Padding, extension and CSRC list are never emitted; on receive they are
//! ignored and the payload is taken to start right after the fixed header.

use bytes::{BufMut, BytesMut};

use crate::error::NetworkError;

/// RTP version carried in every packet
pub const RTP_VERSION: u8 = 2;

/// Dynamic payload type used for Opus
pub const RTP_PAYLOAD_TYPE_OPUS: u8 = 111;

/// Fixed header length
pub const RTP_HEADER_SIZE: usize = 12;

/// Largest datagram put on the wire (header + payload)
pub const MAX_DATAGRAM_SIZE: usize = 1400;

/// Largest payload that fits in one datagram
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - RTP_HEADER_SIZE;

/// Decoded RTP fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Set on the first packet of a talk burst
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    /// Header for an Opus packet
    pub fn opus(marker: bool, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            marker,
            payload_type: RTP_PAYLOAD_TYPE_OPUS,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Serialize into exactly [`RTP_HEADER_SIZE`] bytes, network byte order
    pub fn to_bytes(&self) -> [u8; RTP_HEADER_SIZE] {
        let mut out = [0u8; RTP_HEADER_SIZE];
        out[0] = RTP_VERSION << 6;
        out[1] = (u8::from(self.marker) << 7) | (self.payload_type & 0x7F);
        out[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        out
    }

    /// Append the header to `buf`
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.to_bytes());
    }

    /// Parse the fixed header from the front of `data`
    pub fn parse(data: &[u8]) -> Result<Self, NetworkError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(NetworkError::InvalidPacket("shorter than RTP header"));
        }
        if data[0] >> 6 != RTP_VERSION {
            return Err(NetworkError::InvalidPacket("unsupported RTP version"));
        }

        Ok(Self {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Read only the sequence number, without validating the rest
    pub fn peek_sequence(data: &[u8]) -> Option<u16> {
        (data.len() >= RTP_HEADER_SIZE).then(|| u16::from_be_bytes([data[2], data[3]]))
    }
}

/// Build a complete datagram, truncating payloads that would exceed
/// [`MAX_DATAGRAM_SIZE`] instead of fragmenting them.
pub fn packetize(header: &RtpHeader, payload: &[u8], buf: &mut BytesMut) -> usize {
    let payload_len = payload.len().min(MAX_PAYLOAD_SIZE);
    buf.clear();
    buf.reserve(RTP_HEADER_SIZE + payload_len);
    header.write_to(buf);
    buf.put_slice(&payload[..payload_len]);
    payload.len() - payload_len
}

/// Payload following the fixed header
pub fn payload(datagram: &[u8]) -> &[u8] {
    datagram.get(RTP_HEADER_SIZE..).unwrap_or(&[])
}
