//! Socket abstraction layer for ICMP and UDP probing
//!
//! A transport is opened for exactly one probe attempt: the scheduler sets
//! the TTL, sends one packet, drains replies until its deadline and then
//! drops the transport. Nothing here keeps per-probe state; correlating a
//! reply with its request is the classifier's job.

use serde::{Deserialize, Serialize};
use socket2::Socket;
use std::io::Read;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use thiserror::Error;

pub mod factory;
pub mod icmp_v4;
pub mod sim;
pub mod udp;
pub mod utils;

/// Largest datagram read from a raw socket
const RECV_BUFFER_LEN_BYTES: usize = 1500;
/// Upper bound on a single blocking read so deadlines stay responsive
const MAX_READ_SLICE: Duration = Duration::from_millis(100);
/// Lower bound on a read timeout; shorter values round down to a zero
/// timeval, which the kernel treats as "block forever"
const MIN_READ_SLICE: Duration = Duration::from_millis(1);

/// Protocol to use for probing
///
/// - **ICMP**: Echo Request probes, answered by Echo Reply or ICMP errors
/// - **UDP**: datagrams to a high port, answered by ICMP errors only
///
/// # Examples
///
/// ```
/// use netprobe::ProbeProtocol;
///
/// let protocol = ProbeProtocol::Udp;
/// println!("Using {} protocol", protocol.description());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    /// ICMP Echo Request protocol
    #[default]
    Icmp,
    /// UDP protocol with high port numbers
    Udp,
}

impl ProbeProtocol {
    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            ProbeProtocol::Icmp => "ICMP",
            ProbeProtocol::Udp => "UDP",
        }
    }
}

/// Errors raised by a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Socket creation failed due to insufficient permissions
    ///
    /// Raw ICMP sockets need elevated privileges on every supported platform.
    #[error("Insufficient permissions: {required}")]
    InsufficientPermissions {
        /// Description of required permissions (e.g., "root or CAP_NET_RAW")
        required: String,
        /// Suggested remedy (e.g., "Run with sudo")
        suggestion: String,
    },

    /// Socket creation or configuration failed for other reasons
    #[error("Failed to create socket: {0}")]
    SocketError(String),

    /// Sending the probe failed
    #[error("Failed to send probe: {0}")]
    SendFailed(String),

    /// Reading from the socket failed
    #[error("Failed to receive reply: {0}")]
    RecvFailed(String),

    /// The requested transport is not available on this platform
    #[error("Unsupported transport: {0}")]
    Unsupported(String),
}

/// A socket (or socket pair) able to carry one probe attempt
pub trait ProbeTransport: Send {
    /// Protocol this transport sends
    fn protocol(&self) -> ProbeProtocol;

    /// Set the TTL for outgoing packets
    fn set_ttl(&mut self, ttl: u8) -> Result<(), TransportError>;

    /// Send an encoded probe to `destination`
    ///
    /// For ICMP the packet is a complete ICMP message; for UDP it is the
    /// datagram payload and the port of `destination` is the probe port.
    fn send(&mut self, packet: &[u8], destination: SocketAddrV4) -> Result<(), TransportError>;

    /// Wait for the next raw IPv4 datagram until `deadline`
    ///
    /// `Ok(None)` means the deadline passed with nothing received.
    fn recv(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>, TransportError>;

    /// Local source port of outgoing probes, when the transport has one
    fn local_port(&self) -> Option<u16> {
        None
    }
}

/// Opens fresh transports for probe attempts
pub trait TransportFactory: Send + Sync {
    /// Open a transport for `protocol`
    fn open(&self, protocol: ProbeProtocol) -> Result<Box<dyn ProbeTransport>, TransportError>;
}

/// Read one datagram from a raw socket, giving up at `deadline`.
///
/// The read timeout is re-armed in short slices so a deadline in the past
/// is noticed promptly.
pub(crate) fn recv_datagram(
    socket: &Socket,
    deadline: Instant,
) -> Result<Option<Vec<u8>>, TransportError> {
    let mut recv_buf = [0u8; RECV_BUFFER_LEN_BYTES];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }

        let slice = remaining.clamp(MIN_READ_SLICE, MAX_READ_SLICE);
        socket
            .set_read_timeout(Some(slice))
            .map_err(|e| TransportError::RecvFailed(e.to_string()))?;

        let mut reader = socket;
        match reader.read(&mut recv_buf) {
            Ok(size) => return Ok(Some(recv_buf[..size].to_vec())),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) => return Err(TransportError::RecvFailed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_description() {
        assert_eq!(ProbeProtocol::Icmp.description(), "ICMP");
        assert_eq!(ProbeProtocol::Udp.description(), "UDP");
        assert_eq!(ProbeProtocol::default(), ProbeProtocol::Icmp);
    }

    #[test]
    fn test_protocol_serde() {
        let json = serde_json::to_string(&ProbeProtocol::Udp).unwrap();
        assert_eq!(json, "\"udp\"");
        let parsed: ProbeProtocol = serde_json::from_str("\"icmp\"").unwrap();
        assert_eq!(parsed, ProbeProtocol::Icmp);
    }

    fn loopback_pair() -> (Socket, Socket) {
        use socket2::{Domain, Protocol, SockAddr, Type};
        let any = SockAddr::from(SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 0));
        let receiver = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        receiver.bind(&any).unwrap();
        let sender = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        sender.bind(&any).unwrap();
        (receiver, sender)
    }

    #[test]
    fn test_recv_datagram_returns_pending_datagram() {
        let (receiver, sender) = loopback_pair();
        sender
            .send_to(b"reply", &receiver.local_addr().unwrap())
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let datagram = recv_datagram(&receiver, deadline).unwrap();
        assert_eq!(datagram.as_deref(), Some(&b"reply"[..]));
    }

    #[test]
    fn test_recv_datagram_times_out_on_silence() {
        let (receiver, _sender) = loopback_pair();
        let started = Instant::now();

        let datagram = recv_datagram(&receiver, started + Duration::from_millis(250)).unwrap();
        let elapsed = started.elapsed();
        assert!(datagram.is_none());
        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed < Duration::from_secs(2), "waited {elapsed:?}");
    }

    #[test]
    fn test_recv_datagram_past_deadline() {
        let (receiver, _sender) = loopback_pair();
        let started = Instant::now();

        let past = started.checked_sub(Duration::from_millis(10)).unwrap_or(started);
        assert!(recv_datagram(&receiver, past).unwrap().is_none());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_recv_datagram_sub_microsecond_deadline_stays_bounded() {
        let (receiver, _sender) = loopback_pair();

        // Every remaining window, down to nanoseconds, must arm a real timeout
        for nanos in [1u64, 500, 999] {
            let started = Instant::now();
            let deadline = started + Duration::from_nanos(nanos);
            assert!(recv_datagram(&receiver, deadline).unwrap().is_none());
            assert!(started.elapsed() < Duration::from_secs(1));
        }

        // A sub-microsecond timeout on its own would disable the timeout
        let slice = Duration::from_nanos(500).clamp(MIN_READ_SLICE, MAX_READ_SLICE);
        receiver.set_read_timeout(Some(slice)).unwrap();
        assert!(receiver.read_timeout().unwrap().is_some());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::InsufficientPermissions {
            required: "root or CAP_NET_RAW".to_string(),
            suggestion: "Run with sudo".to_string(),
        };
        assert_eq!(err.to_string(), "Insufficient permissions: root or CAP_NET_RAW");
        assert!(TransportError::SendFailed("boom".into())
            .to_string()
            .contains("boom"));
    }
}
