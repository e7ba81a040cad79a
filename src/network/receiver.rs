//! Cancellable RTP receive loop
//!
//! The loop blocks in `recv_from` with a bounded read timeout. Stopping it
//! sends a cancel message on a channel and then a zero-length datagram to
//! the socket's own loopback address, so a blocked receive returns at once
//! instead of waiting for the timeout.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::RwLock;
use serde::Serialize;
use std::io::ErrorKind;
use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::audio::JitterBuffer;
use crate::constants::MAX_RECEIVE_SIZE;
use crate::error::NetworkError;
use crate::protocol::rtp::{self, RtpHeader, RTP_HEADER_SIZE};

use super::udp;

/// Called on the receive thread with the sender's SSRC and the payload
pub type ReceiveCallback = Arc<dyn Fn(u32, &[u8]) + Send + Sync>;

/// Slot the transport and the loop share, so the callback can be replaced
/// while the loop is running
pub type CallbackSlot = Arc<RwLock<Option<ReceiveCallback>>>;

/// Verdict on one received datagram
#[derive(Debug, PartialEq, Eq)]
pub enum Screened<'a> {
    Accept { header: RtpHeader, payload: &'a [u8] },
    /// Our own packet looped back by the multicast group
    Loopback,
    Invalid(&'static str),
}

/// Classify a datagram against the local SSRC
///
/// Datagrams that carry no payload beyond the fixed header are invalid.
pub fn screen(datagram: &[u8], local_ssrc: u32) -> Screened<'_> {
    if datagram.len() <= RTP_HEADER_SIZE {
        return Screened::Invalid("no payload");
    }
    match RtpHeader::parse(datagram) {
        Ok(header) if header.ssrc == local_ssrc => Screened::Loopback,
        Ok(header) => Screened::Accept {
            header,
            payload: rtp::payload(datagram),
        },
        Err(NetworkError::InvalidPacket(reason)) => Screened::Invalid(reason),
        Err(_) => Screened::Invalid("unparseable header"),
    }
}

/// Receive-side counters, updated by the loop without locking
#[derive(Debug, Default)]
pub struct ReceiveCounters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    loopback_dropped: AtomicU64,
    invalid_packets: AtomicU64,
    receive_errors: AtomicU64,
}

impl ReceiveCounters {
    pub fn snapshot(&self) -> ReceiveStats {
        ReceiveStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            loopback_dropped: self.loopback_dropped.load(Ordering::Relaxed),
            invalid_packets: self.invalid_packets.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiveStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub loopback_dropped: u64,
    pub invalid_packets: u64,
    pub receive_errors: u64,
}

/// Everything the receive thread needs
pub struct ReceiveContext {
    pub socket: Arc<UdpSocket>,
    pub local_ssrc: u32,
    pub jitter: Arc<JitterBuffer>,
    pub callback: CallbackSlot,
    pub counters: Arc<ReceiveCounters>,
    /// Pause after a hard socket error before retrying
    pub error_backoff: Duration,
}

impl ReceiveContext {
    /// Screen one datagram and hand accepted packets on
    ///
    /// Returns whether the datagram was accepted.
    pub fn handle_datagram(&self, datagram: &[u8]) -> bool {
        match screen(datagram, self.local_ssrc) {
            Screened::Accept { header, payload } => {
                self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_received
                    .fetch_add(datagram.len() as u64, Ordering::Relaxed);

                self.jitter.enqueue(datagram);

                let callback = self.callback.read().clone();
                if let Some(callback) = callback {
                    callback(header.ssrc, payload);
                }
                true
            }
            Screened::Loopback => {
                self.counters.loopback_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Screened::Invalid(reason) => {
                self.counters.invalid_packets.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Dropped {} byte datagram: {}", datagram.len(), reason);
                false
            }
        }
    }
}

/// Handle to a running receive thread
pub struct ReceiveLoop {
    handle: Option<JoinHandle<()>>,
    cancel_tx: Sender<()>,
    done_rx: Receiver<()>,
    socket: Arc<UdpSocket>,
    wake_addr: SocketAddrV4,
}

impl ReceiveLoop {
    /// Start the receive thread
    ///
    /// The socket must already carry a read timeout; that timeout bounds
    /// how long the thread can take to notice cancellation.
    pub fn spawn(context: ReceiveContext) -> Result<Self, NetworkError> {
        let wake_addr = udp::self_address(&context.socket)
            .map_err(|e| NetworkError::ReceiveLoop(format!("local address: {}", e)))?;

        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let socket = context.socket.clone();

        let handle = std::thread::Builder::new()
            .name("rtp-receive".into())
            .spawn(move || {
                // Dropped when the thread exits; `stop` sees the disconnect.
                let _done = done_tx;
                run(context, cancel_rx);
            })
            .map_err(|e| NetworkError::ReceiveLoop(e.to_string()))?;

        tracing::info!("RTP receive loop started");

        Ok(Self {
            handle: Some(handle),
            cancel_tx,
            done_rx,
            socket,
            wake_addr,
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread and wait up to `grace` for it to exit
    ///
    /// If the thread does not exit in time it is detached, not joined.
    /// Calling this more than once is harmless.
    pub fn stop(&mut self, grace: Duration) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        let _ = self.cancel_tx.try_send(());
        if let Err(e) = self.socket.send_to(&[], self.wake_addr) {
            tracing::debug!("Wake datagram failed, waiting for read timeout: {}", e);
        }

        match self.done_rx.recv_timeout(grace) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "Receive loop did not exit within {:?}, abandoning thread",
                    grace
                );
            }
            _ => {
                if handle.join().is_err() {
                    tracing::error!("Receive loop thread panicked");
                }
                tracing::info!("RTP receive loop stopped");
            }
        }
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        self.stop(Duration::ZERO);
    }
}

fn cancelled(cancel_rx: &Receiver<()>) -> bool {
    !matches!(cancel_rx.try_recv(), Err(TryRecvError::Empty))
}

fn run(context: ReceiveContext, cancel_rx: Receiver<()>) {
    let mut buf = vec![0u8; MAX_RECEIVE_SIZE];

    while !cancelled(&cancel_rx) {
        match context.socket.recv_from(&mut buf) {
            // Wake datagram, or an empty packet from elsewhere
            Ok((0, _)) => continue,
            Ok((len, _from)) => {
                context.handle_datagram(&buf[..len]);
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                context.counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("RTP receive error: {}", e);
                match cancel_rx.recv_timeout(context.error_backoff) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
            }
        }
    }

    tracing::debug!("Receive loop exiting");
}
