//! UDP socket setup
//!
//! One socket per node, bound to `0.0.0.0:<port>`, used for both sending
//! and receiving so multicast, unicast and loopback traffic all share the
//! same port.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use crate::error::NetworkError;

/// Parameters for [`create_socket`]
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Local port; 0 picks an ephemeral port
    pub port: u16,
    /// DSCP code point (upper six bits of the IPv4 TOS byte)
    pub dscp: u8,
    pub multicast_ttl: u32,
}

/// Create and bind the RTP socket
///
/// QoS marking is best-effort: failing to set it is logged, not returned.
pub fn create_socket(options: &SocketOptions) -> Result<Socket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(format!("socket(): {}", e)))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(format!("SO_REUSEADDR: {}", e)))?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, options.port);
    socket
        .bind(&SockAddr::from(bind_addr))
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", bind_addr, e)))?;

    if let Err(e) = apply_dscp(&socket, options.dscp) {
        tracing::warn!(
            "Failed to set DSCP {} on RTP socket, continuing without QoS: {}",
            options.dscp,
            e
        );
    } else {
        tracing::debug!("DSCP QoS set to {} (TOS={})", options.dscp, dscp_to_tos(options.dscp));
    }

    if let Err(e) = socket.set_multicast_ttl_v4(options.multicast_ttl) {
        tracing::warn!("Failed to set multicast TTL {}: {}", options.multicast_ttl, e);
    }
    if let Err(e) = socket.set_multicast_loop_v4(true) {
        tracing::warn!("Failed to enable multicast loopback: {}", e);
    }

    Ok(socket)
}

/// TOS byte carrying `dscp` with ECN bits cleared
pub fn dscp_to_tos(dscp: u8) -> u32 {
    u32::from(dscp & 0x3F) << 2
}

/// Mark outgoing packets with a DSCP code point
pub fn apply_dscp(socket: &Socket, dscp: u8) -> std::io::Result<()> {
    socket.set_tos(dscp_to_tos(dscp))
}

/// Join `group` on the default interface
pub fn join_group(socket: &Socket, group: Ipv4Addr) -> Result<(), NetworkError> {
    if !group.is_multicast() {
        return Err(NetworkError::MulticastJoin {
            group: group.to_string(),
            reason: "not a multicast address".to_string(),
        });
    }
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| NetworkError::MulticastJoin {
            group: group.to_string(),
            reason: e.to_string(),
        })
}

/// Hand the configured socket over to std with a bounded read timeout
pub fn into_std(socket: Socket, read_timeout: Duration) -> Result<UdpSocket, NetworkError> {
    let socket: UdpSocket = socket.into();
    socket
        .set_read_timeout(Some(read_timeout))
        .map_err(|e| NetworkError::BindFailed(format!("SO_RCVTIMEO: {}", e)))?;
    Ok(socket)
}

/// Loopback address that reaches `socket` itself (used to wake a blocked receive)
pub fn self_address(socket: &UdpSocket) -> std::io::Result<SocketAddrV4> {
    let port = socket.local_addr()?.port();
    Ok(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}
