//! Factory for creating probe transports on the host network stack

use super::icmp_v4::RawIcmpV4Transport;
use super::udp::UdpProbeTransport;
use super::{ProbeProtocol, ProbeTransport, TransportError, TransportFactory};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::debug;

// Common POSIX error codes
const EPERM: i32 = 1; // Operation not permitted
const EACCES: i32 = 13; // Permission denied

/// Opens raw sockets on the local host
///
/// ICMP probes use one raw ICMPv4 socket. UDP probes use a UDP socket bound
/// to an ephemeral port plus a raw ICMPv4 socket for the replies, so both
/// protocols need root or `CAP_NET_RAW`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTransportFactory;

impl SystemTransportFactory {
    /// Create a factory for the host network stack
    pub fn new() -> Self {
        SystemTransportFactory
    }
}

impl TransportFactory for SystemTransportFactory {
    fn open(&self, protocol: ProbeProtocol) -> Result<Box<dyn ProbeTransport>, TransportError> {
        match protocol {
            ProbeProtocol::Icmp => {
                let socket = raw_icmp_socket()?;
                debug!(protocol = protocol.description(), "opened raw transport");
                Ok(Box::new(RawIcmpV4Transport::new(socket)))
            }
            ProbeProtocol::Udp => {
                let udp = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
                    .map_err(|e| map_socket_error(&e, "UDP"))?;
                let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
                udp.bind(&bind_addr.into()).map_err(|e| {
                    TransportError::SocketError(format!("Failed to bind UDP socket: {e}"))
                })?;
                let icmp = raw_icmp_socket()?;
                let transport = UdpProbeTransport::new(udp, icmp);
                debug!(
                    protocol = protocol.description(),
                    local_port = ?transport.local_port(),
                    "opened udp transport"
                );
                Ok(Box::new(transport))
            }
        }
    }
}

fn raw_icmp_socket() -> Result<Socket, TransportError> {
    Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
        .map_err(|e| map_socket_error(&e, "raw ICMP"))
}

/// Check whether an I/O error means the process lacks raw-socket rights
pub fn is_permission_error(io_err: &std::io::Error) -> bool {
    matches!(io_err.kind(), std::io::ErrorKind::PermissionDenied)
        || io_err
            .raw_os_error()
            .map(|code| code == EPERM || code == EACCES)
            .unwrap_or(false)
}

fn map_socket_error(io_err: &std::io::Error, kind: &str) -> TransportError {
    if is_permission_error(io_err) {
        TransportError::InsufficientPermissions {
            required: "root or CAP_NET_RAW".to_string(),
            suggestion: format!(
                "{kind} sockets need elevated privileges. Run with sudo or grant the \
                 capability: sudo setcap cap_net_raw+ep {}",
                std::env::args().next().unwrap_or_else(|| "netprobe".to_string())
            ),
        }
    } else {
        TransportError::SocketError(format!("{kind} socket: {io_err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_permission_error_detection() {
        assert!(is_permission_error(&Error::from_raw_os_error(EPERM)));
        assert!(is_permission_error(&Error::from_raw_os_error(EACCES)));
        assert!(is_permission_error(&Error::new(ErrorKind::PermissionDenied, "nope")));
        assert!(!is_permission_error(&Error::new(ErrorKind::AddrInUse, "busy")));
    }

    #[test]
    fn test_error_mapping() {
        let err = map_socket_error(&Error::from_raw_os_error(EPERM), "raw ICMP");
        match err {
            TransportError::InsufficientPermissions { required, suggestion } => {
                assert_eq!(required, "root or CAP_NET_RAW");
                assert!(suggestion.contains("raw ICMP"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = map_socket_error(&Error::new(ErrorKind::Other, "weird"), "UDP");
        assert!(matches!(err, TransportError::SocketError(msg) if msg.contains("weird")));
    }

    #[test]
    fn test_open_does_not_panic() {
        // Succeeds with privileges, otherwise must report a permission error
        let factory = SystemTransportFactory::new();
        for protocol in [ProbeProtocol::Icmp, ProbeProtocol::Udp] {
            match factory.open(protocol) {
                Ok(transport) => assert_eq!(transport.protocol(), protocol),
                Err(TransportError::InsufficientPermissions { .. })
                | Err(TransportError::SocketError(_)) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
    }
}
