//! UDP probe transport
//!
//! Probes leave on an ordinary datagram socket; the answers (Time Exceeded,
//! Port Unreachable) come back as ICMP, so a raw ICMP socket is opened next
//! to it for receiving.

use super::{recv_datagram, ProbeProtocol, ProbeTransport, TransportError};
use socket2::Socket;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;
use tracing::trace;

/// UDP sender paired with a raw ICMP receiver
pub struct UdpProbeTransport {
    udp: Socket,
    icmp: Socket,
    local_port: Option<u16>,
}

impl UdpProbeTransport {
    /// Combine a bound UDP socket with a raw ICMPv4 socket
    pub fn new(udp: Socket, icmp: Socket) -> Self {
        let local_port = udp
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .map(|addr| addr.port())
            .filter(|&port| port != 0);
        UdpProbeTransport {
            udp,
            icmp,
            local_port,
        }
    }
}

impl ProbeTransport for UdpProbeTransport {
    fn protocol(&self) -> ProbeProtocol {
        ProbeProtocol::Udp
    }

    fn set_ttl(&mut self, ttl: u8) -> Result<(), TransportError> {
        self.udp
            .set_ttl_v4(u32::from(ttl))
            .map_err(|e| TransportError::SocketError(format!("Failed to set TTL: {e}")))
    }

    fn send(&mut self, packet: &[u8], destination: SocketAddrV4) -> Result<(), TransportError> {
        let target = SocketAddr::V4(destination);
        let sent = self
            .udp
            .send_to(packet, &target.into())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        trace!(bytes = sent, %destination, "udp probe sent");
        Ok(())
    }

    fn recv(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>, TransportError> {
        recv_datagram(&self.icmp, deadline)
    }

    fn local_port(&self) -> Option<u16> {
        self.local_port
    }
}
