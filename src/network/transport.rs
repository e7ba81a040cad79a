//! RTP transport
//!
//! Owns the node's UDP socket, the session SSRC and sequencing state, the
//! unicast peer set and the receive loop. Delivery goes to the multicast
//! group when it was joined and to every unicast peer.

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::JitterBuffer;
use crate::codec::EncodedPacket;
use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::protocol::TransportMode;

use super::receiver::{CallbackSlot, ReceiveCallback, ReceiveContext, ReceiveCounters, ReceiveLoop, ReceiveStats};
use super::sender::{self, OutgoingPacket, RtpSequencer};
use super::udp::{self, SocketOptions};

/// Parse `ip` or `ip:port`, using `default_port` when no port is given
pub fn parse_peer(address: &str, default_port: u16) -> Result<SocketAddrV4, NetworkError> {
    let address = address.trim();
    if let Ok(addr) = address.parse::<SocketAddrV4>() {
        return Ok(addr);
    }
    address
        .parse::<Ipv4Addr>()
        .map(|ip| SocketAddrV4::new(ip, default_port))
        .map_err(|_| NetworkError::InvalidAddress(address.to_string()))
}

#[derive(Debug, Default)]
struct SendCounters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
    packets_truncated: AtomicU64,
}

/// Transport statistics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub packets_truncated: u64,
    #[serde(flatten)]
    pub receive: ReceiveStats,
}

pub struct RtpTransport {
    socket: Arc<UdpSocket>,
    local_port: u16,
    group: SocketAddrV4,
    requested_mode: TransportMode,
    /// Effective mode: `Multicast` when the group was joined, else `Unicast`
    mode: TransportMode,
    ssrc: u32,
    sequencer: Mutex<RtpSequencer>,
    peers: Mutex<Vec<SocketAddrV4>>,
    callback: CallbackSlot,
    receive_counters: Arc<ReceiveCounters>,
    send_counters: SendCounters,
    receive_loop: Mutex<Option<ReceiveLoop>>,
    receive_timeout: Duration,
    join_grace: Duration,
}

impl RtpTransport {
    /// Bind the socket and settle the transport mode
    ///
    /// In `Multicast` mode a failed group join is returned as an error. In
    /// `Auto` mode it demotes the transport to `Unicast` for its lifetime.
    pub fn open(config: &NetworkConfig) -> Result<Self, NetworkError> {
        let socket = udp::create_socket(&SocketOptions {
            port: config.port,
            dscp: config.dscp,
            multicast_ttl: config.multicast_ttl,
        })?;

        let joined = match config.mode {
            TransportMode::Unicast => false,
            TransportMode::Multicast => {
                udp::join_group(&socket, config.group)?;
                true
            }
            TransportMode::Auto => match udp::join_group(&socket, config.group) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("{}; falling back to unicast for this session", e);
                    false
                }
            },
        };
        let mode = if joined {
            TransportMode::Multicast
        } else {
            TransportMode::Unicast
        };

        let socket = udp::into_std(socket, config.receive_timeout())?;
        let local_port = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?
            .port();

        let ssrc = rand::thread_rng().gen_range(1..=u32::MAX);
        let mut peers = Vec::with_capacity(config.peers.len());
        for peer in &config.peers {
            if !peers.contains(peer) {
                peers.push(*peer);
            }
        }

        tracing::info!(
            "RTP transport open on port {}, ssrc {:08x} ({} requested, {} effective, {} peers)",
            local_port,
            ssrc,
            config.mode,
            mode,
            peers.len()
        );

        Ok(Self {
            socket: Arc::new(socket),
            local_port,
            group: SocketAddrV4::new(config.group, local_port),
            requested_mode: config.mode,
            mode,
            ssrc,
            sequencer: Mutex::new(RtpSequencer::random(ssrc)),
            peers: Mutex::new(peers),
            callback: Arc::new(RwLock::new(None)),
            receive_counters: Arc::new(ReceiveCounters::default()),
            send_counters: SendCounters::default(),
            receive_loop: Mutex::new(None),
            receive_timeout: config.receive_timeout(),
            join_grace: config.join_grace(),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn requested_mode(&self) -> TransportMode {
        self.requested_mode
    }

    pub fn is_multicast_joined(&self) -> bool {
        self.mode == TransportMode::Multicast
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    /// Address other nodes on this host can send to
    pub fn local_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.local_port)
    }

    /// Add a unicast destination; returns `false` if it was already present
    pub fn add_peer(&self, peer: SocketAddrV4) -> bool {
        let mut peers = self.peers.lock();
        if peers.contains(&peer) {
            return false;
        }
        peers.push(peer);
        tracing::info!("Added unicast peer {}", peer);
        true
    }

    pub fn clear_peers(&self) {
        let cleared = std::mem::take(&mut *self.peers.lock());
        tracing::info!("Cleared {} unicast peers", cleared.len());
    }

    pub fn peers(&self) -> Vec<SocketAddrV4> {
        self.peers.lock().clone()
    }

    fn destinations(&self) -> Vec<SocketAddrV4> {
        let peers = self.peers.lock();
        let mut destinations = Vec::with_capacity(peers.len() + 1);
        if self.is_multicast_joined() {
            destinations.push(self.group);
        }
        destinations.extend(peers.iter().copied());
        destinations
    }

    /// Packetize and deliver one encoded frame
    ///
    /// Returns the datagram size. Payloads larger than the datagram limit
    /// are truncated. Per-destination failures are logged; the call only
    /// fails when no destination accepted the datagram.
    pub fn send_frame(&self, payload: &[u8], marker: bool) -> Result<usize, NetworkError> {
        let packet = {
            let mut sequencer = self.sequencer.lock();
            OutgoingPacket::build(sequencer.next_header(marker), payload)
        };

        if packet.truncated > 0 {
            self.send_counters
                .packets_truncated
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Truncated {} payload bytes from packet {}",
                packet.truncated,
                packet.header.sequence
            );
        }

        let destinations = self.destinations();
        match sender::fan_out(&self.socket, &packet.datagram, &destinations) {
            Ok(delivery) => {
                self.send_counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.send_counters
                    .bytes_sent
                    .fetch_add(packet.datagram.len() as u64, Ordering::Relaxed);
                if delivery.failed > 0 {
                    self.send_counters
                        .send_failures
                        .fetch_add(delivery.failed as u64, Ordering::Relaxed);
                }
                Ok(packet.datagram.len())
            }
            Err(e) => {
                self.send_counters
                    .send_failures
                    .fetch_add(destinations.len().max(1) as u64, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn send_packet(&self, packet: &EncodedPacket) -> Result<usize, NetworkError> {
        self.send_frame(&packet.payload, packet.talk_burst_start)
    }

    /// Register the callback run for every accepted datagram
    ///
    /// Takes effect immediately, also for a loop that is already running.
    pub fn set_receive_callback(&self, callback: ReceiveCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Start the receive thread feeding `jitter`; no-op when already running
    pub fn start_receive_loop(&self, jitter: Arc<JitterBuffer>) -> Result<(), NetworkError> {
        let mut receive_loop = self.receive_loop.lock();
        if receive_loop.as_ref().is_some_and(ReceiveLoop::is_running) {
            return Ok(());
        }

        *receive_loop = Some(ReceiveLoop::spawn(ReceiveContext {
            socket: self.socket.clone(),
            local_ssrc: self.ssrc,
            jitter,
            callback: self.callback.clone(),
            counters: self.receive_counters.clone(),
            error_backoff: self.receive_timeout,
        })?);
        Ok(())
    }

    /// Stop the receive thread, waiting at most the configured grace period
    pub fn stop_receive_loop(&self) {
        let receive_loop = self.receive_loop.lock().take();
        if let Some(mut receive_loop) = receive_loop {
            receive_loop.stop(self.join_grace);
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.receive_loop
            .lock()
            .as_ref()
            .is_some_and(ReceiveLoop::is_running)
    }

    /// Screen and queue a datagram received outside the receive loop
    ///
    /// Returns whether the datagram was accepted.
    pub fn ingest(&self, jitter: &Arc<JitterBuffer>, datagram: &[u8]) -> bool {
        ReceiveContext {
            socket: self.socket.clone(),
            local_ssrc: self.ssrc,
            jitter: jitter.clone(),
            callback: self.callback.clone(),
            counters: self.receive_counters.clone(),
            error_backoff: self.receive_timeout,
        }
        .handle_datagram(datagram)
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.send_counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.send_counters.bytes_sent.load(Ordering::Relaxed),
            send_failures: self.send_counters.send_failures.load(Ordering::Relaxed),
            packets_truncated: self.send_counters.packets_truncated.load(Ordering::Relaxed),
            receive: self.receive_counters.snapshot(),
        }
    }
}

impl Drop for RtpTransport {
    fn drop(&mut self) {
        self.stop_receive_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::rtp::RtpHeader;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn unicast() -> NetworkConfig {
        NetworkConfig {
            port: 0,
            mode: TransportMode::Unicast,
            multicast_ttl: 1,
            ..NetworkConfig::default()
        }
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
    fn test_parse_peer() {
        assert_eq!(
            parse_peer("10.0.0.2", 5004).unwrap(),
            "10.0.0.2:5004".parse::<SocketAddrV4>().unwrap()
        );
        assert_eq!(parse_peer(" 10.0.0.2:6000 ", 5004).unwrap().port(), 6000);
        assert!(matches!(
            parse_peer("not-an-ip", 5004),
            Err(NetworkError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_ssrc_is_nonzero() {
        let transport = RtpTransport::open(&unicast()).unwrap();
        assert_ne!(transport.ssrc(), 0);
        assert_eq!(transport.mode(), TransportMode::Unicast);
    }

    #[test]
    fn test_send_without_peers_fails() {
        let transport = RtpTransport::open(&unicast()).unwrap();
        assert!(matches!(
            transport.send_frame(b"x", false),
            Err(NetworkError::NoDestination)
        ));
        assert_eq!(transport.stats().packets_sent, 0);
    }

    #[test]
    fn test_peer_set() {
        let transport = RtpTransport::open(&unicast()).unwrap();
        let peer: SocketAddrV4 = "127.0.0.1:40000".parse().unwrap();

        assert!(transport.add_peer(peer));
        assert!(!transport.add_peer(peer));
        assert_eq!(transport.peers(), vec![peer]);

        transport.clear_peers();
        assert!(transport.peers().is_empty());
    }

    #[test]
    fn test_multicast_mode_join_failure_is_fatal() {
        let config = NetworkConfig {
            mode: TransportMode::Multicast,
            group: Ipv4Addr::new(10, 1, 2, 3),
            ..unicast()
        };
        assert!(matches!(
            RtpTransport::open(&config),
            Err(NetworkError::MulticastJoin { .. })
        ));
    }

    #[test]
    fn test_auto_mode_demotes_to_unicast() {
        let config = NetworkConfig {
            mode: TransportMode::Auto,
            group: Ipv4Addr::new(10, 1, 2, 3),
            ..unicast()
        };
        let transport = RtpTransport::open(&config).unwrap();
        assert_eq!(transport.requested_mode(), TransportMode::Auto);
        assert_eq!(transport.mode(), TransportMode::Unicast);
        assert!(!transport.is_multicast_joined());
    }

    #[test]
    fn test_sequence_numbers_are_contiguous_on_the_wire() {
        let transport = RtpTransport::open(&unicast()).unwrap();
        let sink = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sink.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let SocketAddr::V4(sink_addr) = sink.local_addr().unwrap() else {
            panic!("expected IPv4");
        };
        transport.add_peer(sink_addr);

        let mut buf = [0u8; 1500];
        let mut previous: Option<RtpHeader> = None;
        for i in 0..20 {
            let packet = EncodedPacket::new(Bytes::from_static(b"frame"), i == 0);
            transport.send_packet(&packet).unwrap();
            let len = sink.recv(&mut buf).unwrap();
            let header = RtpHeader::parse(&buf[..len]).unwrap();

            assert_eq!(header.ssrc, transport.ssrc());
            assert_eq!(header.marker, i == 0);
            if let Some(prev) = previous {
                assert_eq!(header.sequence, prev.sequence.wrapping_add(1));
                assert_eq!(header.timestamp, prev.timestamp.wrapping_add(960));
            }
            previous = Some(header);
        }
        assert_eq!(transport.stats().packets_sent, 20);
    }

    #[test]
    fn test_unicast_between_two_transports() {
        let alice = RtpTransport::open(&unicast()).unwrap();
        let bob = RtpTransport::open(&unicast()).unwrap();
        alice.add_peer(bob.local_addr());

        let jitter = Arc::new(JitterBuffer::new());
        let from = Arc::new(AtomicU32::new(0));
        bob.set_receive_callback({
            let from = from.clone();
            Arc::new(move |ssrc: u32, _payload: &[u8]| from.store(ssrc, Ordering::Relaxed))
        });
        bob.start_receive_loop(jitter.clone()).unwrap();
        assert!(bob.is_receiving());

        alice.send_frame(b"hello", true).unwrap();

        assert!(wait_for(|| from.load(Ordering::Relaxed) == alice.ssrc()));
        assert_eq!(jitter.len(), 1);
        assert_eq!(bob.stats().receive.packets_received, 1);

        bob.stop_receive_loop();
        assert!(!bob.is_receiving());
    }

    #[test]
    fn test_own_packets_are_rejected() {
        let node = RtpTransport::open(&unicast()).unwrap();
        node.add_peer(node.local_addr());

        let jitter = Arc::new(JitterBuffer::new());
        node.start_receive_loop(jitter.clone()).unwrap();
        node.send_frame(b"echo", false).unwrap();

        assert!(wait_for(|| node.stats().receive.loopback_dropped == 1));
        assert!(jitter.is_empty());
        node.stop_receive_loop();
    }

    #[test]
    fn test_ingest_screens_datagrams() {
        let node = RtpTransport::open(&unicast()).unwrap();
        let jitter = Arc::new(JitterBuffer::new());

        let own = OutgoingPacket::build(RtpHeader::opus(false, 1, 0, node.ssrc()), b"x");
        let other = OutgoingPacket::build(RtpHeader::opus(false, 1, 0, node.ssrc() ^ 1), b"x");

        assert!(!node.ingest(&jitter, &own.datagram));
        assert!(node.ingest(&jitter, &other.datagram));
        assert!(!node.ingest(&jitter, &[0u8; 4]));
        assert_eq!(jitter.len(), 1);
    }
}
