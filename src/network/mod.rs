//! Network subsystem for RTP voice transport

pub mod receiver;
pub mod sender;
pub mod transport;
pub mod udp;

pub use receiver::{ReceiveCallback, ReceiveStats, Screened};
pub use sender::RtpSequencer;
pub use transport::{parse_peer, RtpTransport, TransportStats};
