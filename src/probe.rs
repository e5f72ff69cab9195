//! Probe-related types shared by the scheduler, sweeper and sinks

use crate::socket::ProbeProtocol;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Instant;

/// One probe to be sent
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    /// Session identifier, constant across a session's probes
    pub id: u16,
    /// Per-probe sequence number
    pub sequence: u16,
    /// Probe destination
    pub destination: Ipv4Addr,
    /// TTL for this probe; `None` keeps the system default
    pub ttl: Option<u8>,
    /// Protocol used to carry the probe
    pub protocol: ProbeProtocol,
    /// UDP destination port (unused for ICMP)
    pub port: u16,
    /// Bytes carried after the ICMP header, or the UDP payload
    pub payload: Vec<u8>,
    /// When the probe left the transport
    pub sent_at: Option<Instant>,
}

impl ProbeRequest {
    /// ICMP Echo Request for ping
    pub fn echo(id: u16, sequence: u16, destination: Ipv4Addr, payload: Vec<u8>) -> Self {
        ProbeRequest {
            id,
            sequence,
            destination,
            ttl: None,
            protocol: ProbeProtocol::Icmp,
            port: 0,
            payload,
            sent_at: None,
        }
    }

    /// Set the TTL
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Switch to UDP towards `port`
    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.protocol = ProbeProtocol::Udp;
        self.port = port;
        self
    }
}

/// A reply that was correlated with a request
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReply {
    /// Address the reply came from
    pub source_addr: Ipv4Addr,
    /// ICMP type
    pub icmp_type: u8,
    /// ICMP code
    pub icmp_code: u8,
    /// Identifier of the request this reply answers
    pub matched_request_id: Option<u16>,
    /// When the reply was read
    pub received_at: Instant,
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
}

/// Final result of one probe attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Echo Reply from the probed host
    Success {
        /// Round-trip time in milliseconds
        rtt_ms: f64,
        /// Host that answered
        responder: Ipv4Addr,
    },
    /// Destination Unreachable
    Unreachable {
        /// ICMP code (3 = port unreachable)
        code: u8,
        /// Router or host that answered
        responder: Ipv4Addr,
        /// Round-trip time in milliseconds
        rtt_ms: f64,
    },
    /// Redirect; never ends an attempt on its own
    Redirect {
        /// ICMP code (0-3)
        code: u8,
        /// Router that sent the redirect
        responder: Ipv4Addr,
    },
    /// Time Exceeded from an intermediate router
    TtlExceeded {
        /// Router where the TTL expired
        responder: Ipv4Addr,
        /// Round-trip time in milliseconds
        rtt_ms: f64,
    },
    /// No reply before the deadline
    Timeout,
    /// The datagram that ended the attempt could not be decoded
    MalformedReply,
    /// Sending or receiving failed
    TransportError {
        /// Error description
        reason: String,
    },
    /// The datagram that ended the attempt was unrelated to the probe
    Ignored {
        /// ICMP type
        icmp_type: u8,
        /// ICMP code
        code: u8,
    },
}

impl Outcome {
    /// Address of the host that answered, if any
    pub fn responder(&self) -> Option<Ipv4Addr> {
        match self {
            Outcome::Success { responder, .. }
            | Outcome::Unreachable { responder, .. }
            | Outcome::Redirect { responder, .. }
            | Outcome::TtlExceeded { responder, .. } => Some(*responder),
            _ => None,
        }
    }

    /// Round-trip time, when the outcome carries one
    pub fn rtt_ms(&self) -> Option<f64> {
        match self {
            Outcome::Success { rtt_ms, .. }
            | Outcome::Unreachable { rtt_ms, .. }
            | Outcome::TtlExceeded { rtt_ms, .. } => Some(*rtt_ms),
            _ => None,
        }
    }

    /// Whether the outcome counts as a received reply for ping statistics
    pub fn is_reply(&self) -> bool {
        matches!(self, Outcome::Success { .. } | Outcome::TtlExceeded { .. })
    }

    /// RTT sample for a traceroute hop: the probe reached a router or the
    /// destination and came back
    pub fn hop_sample(&self) -> Option<f64> {
        match self {
            Outcome::Success { rtt_ms, .. } | Outcome::TtlExceeded { rtt_ms, .. } => Some(*rtt_ms),
            Outcome::Unreachable {
                code: PORT_UNREACHABLE,
                rtt_ms,
                ..
            } => Some(*rtt_ms),
            _ => None,
        }
    }

    /// Short label for logs and text output
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "reply",
            Outcome::Unreachable { .. } => "unreachable",
            Outcome::Redirect { .. } => "redirect",
            Outcome::TtlExceeded { .. } => "ttl exceeded",
            Outcome::Timeout => "timeout",
            Outcome::MalformedReply => "malformed",
            Outcome::TransportError { .. } => "transport error",
            Outcome::Ignored { .. } => "ignored",
        }
    }
}

/// ICMP Destination Unreachable code for "port unreachable"
pub const PORT_UNREACHABLE: u8 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 7);

    #[test]
    fn test_request_builders() {
        let request = ProbeRequest::echo(0x1234, 1, HOST, b"Ping".to_vec())
            .with_ttl(5)
            .with_udp_port(40005);
        assert_eq!(request.ttl, Some(5));
        assert_eq!(request.protocol, ProbeProtocol::Udp);
        assert_eq!(request.port, 40005);
        assert!(request.sent_at.is_none());
    }

    #[test]
    fn test_hop_samples() {
        let ttl = Outcome::TtlExceeded { responder: HOST, rtt_ms: 1.5 };
        let port = Outcome::Unreachable { code: 3, responder: HOST, rtt_ms: 2.0 };
        let host = Outcome::Unreachable { code: 1, responder: HOST, rtt_ms: 2.0 };
        assert_eq!(ttl.hop_sample(), Some(1.5));
        assert_eq!(port.hop_sample(), Some(2.0));
        assert_eq!(host.hop_sample(), None);
        assert_eq!(Outcome::Timeout.hop_sample(), None);
        assert_eq!(host.responder(), Some(HOST));
        assert!(ttl.is_reply());
        assert!(!port.is_reply());
    }

    #[test]
    fn test_outcome_json_shape() {
        let outcome = Outcome::Success { rtt_ms: 12.5, responder: HOST };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "success");
        assert_eq!(json["responder"], "192.0.2.7");

        let json = serde_json::to_string(&Outcome::Timeout).unwrap();
        assert_eq!(json, r#"{"kind":"timeout"}"#);

        let json = r#"{"kind":"ttl_exceeded","responder":"10.0.0.1","rtt_ms":3.0}"#;
        let back: Outcome = serde_json::from_str(json).unwrap();
        assert_eq!(back.responder(), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }
}
