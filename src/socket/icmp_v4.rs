//! Raw ICMP socket for IPv4

use super::{recv_datagram, ProbeProtocol, ProbeTransport, TransportError};
use socket2::Socket;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;
use tracing::trace;

/// Raw ICMP socket carrying Echo Request probes
///
/// The kernel builds the IP header; the TTL is applied with `IP_TTL`. Reads
/// return the full IPv4 datagram, which is what the codec expects.
pub struct RawIcmpV4Transport {
    socket: Socket,
}

impl RawIcmpV4Transport {
    /// Wrap an already created raw ICMPv4 socket
    pub fn new(socket: Socket) -> Self {
        RawIcmpV4Transport { socket }
    }
}

impl ProbeTransport for RawIcmpV4Transport {
    fn protocol(&self) -> ProbeProtocol {
        ProbeProtocol::Icmp
    }

    fn set_ttl(&mut self, ttl: u8) -> Result<(), TransportError> {
        self.socket
            .set_ttl_v4(u32::from(ttl))
            .map_err(|e| TransportError::SocketError(format!("Failed to set TTL: {e}")))
    }

    fn send(&mut self, packet: &[u8], destination: SocketAddrV4) -> Result<(), TransportError> {
        // Raw ICMP ignores the port
        let target = SocketAddr::V4(SocketAddrV4::new(*destination.ip(), 0));
        let sent = self
            .socket
            .send_to(packet, &target.into())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        trace!(bytes = sent, %destination, "icmp probe sent");
        Ok(())
    }

    fn recv(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>, TransportError> {
        recv_datagram(&self.socket, deadline)
    }
}
