//! Reply classification and correlation
//!
//! Maps a decoded ICMP message onto an [`Outcome`] and decides whether it
//! belongs to the probe that is waiting for it. Errors (Unreachable, Time
//! Exceeded, Redirect) are correlated through the datagram they quote, echo
//! replies through their identifier, sequence and payload.

use crate::packet::codec::IcmpReply;
use crate::probe::{Outcome, ProbeRequest};
use crate::socket::ProbeProtocol;
use pnet::packet::icmp::IcmpTypes;
use tracing::trace;

/// What a received message means for the attempt in progress
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The probe was answered; the attempt ends with this outcome
    Matched(Outcome),
    /// Worth surfacing, but the probe is still waiting for its answer
    Report(Outcome),
    /// Not related to the probe
    Unrelated {
        /// ICMP type
        icmp_type: u8,
        /// ICMP code
        code: u8,
    },
}

/// Classify `reply` against the outstanding `request`.
///
/// `local_port` is the source port the transport sent from, when known;
/// it narrows the match for quoted UDP probes.
pub fn classify(
    reply: &IcmpReply,
    request: &ProbeRequest,
    local_port: Option<u16>,
    rtt_ms: f64,
) -> Verdict {
    let responder = reply.source;
    let code = reply.icmp_code;
    let unrelated = Verdict::Unrelated {
        icmp_type: reply.icmp_type,
        code,
    };

    let verdict = match reply.icmp_type {
        t if t == IcmpTypes::EchoReply.0 => {
            if echo_matches(reply, request) {
                Verdict::Matched(Outcome::Success { rtt_ms, responder })
            } else {
                unrelated
            }
        }
        t if t == IcmpTypes::DestinationUnreachable.0 => {
            if flow_matches(reply, request, local_port) {
                Verdict::Matched(Outcome::Unreachable {
                    code,
                    responder,
                    rtt_ms,
                })
            } else {
                unrelated
            }
        }
        t if t == IcmpTypes::TimeExceeded.0 => {
            if flow_matches(reply, request, local_port) {
                Verdict::Matched(Outcome::TtlExceeded { responder, rtt_ms })
            } else {
                unrelated
            }
        }
        t if t == IcmpTypes::RedirectMessage.0 => {
            if code <= 3 && flow_matches(reply, request, local_port) {
                Verdict::Report(Outcome::Redirect { code, responder })
            } else {
                unrelated
            }
        }
        _ => unrelated,
    };

    if let Verdict::Unrelated { icmp_type, code } = verdict {
        trace!(
            icmp_type,
            code,
            name = icmp_type_name(icmp_type),
            informational = is_informational(icmp_type),
            source = %responder,
            "ignoring unrelated icmp message"
        );
    }
    verdict
}

fn echo_matches(reply: &IcmpReply, request: &ProbeRequest) -> bool {
    request.protocol == ProbeProtocol::Icmp
        && reply.identifier == request.id
        && reply.sequence == request.sequence
        && reply.payload == request.payload
}

/// Does the datagram quoted by an ICMP error belong to `request`?
///
/// Errors that quote nothing decodable are accepted.
fn flow_matches(reply: &IcmpReply, request: &ProbeRequest, local_port: Option<u16>) -> bool {
    let Some(quoted) = &reply.quoted else {
        return true;
    };
    if quoted.destination != request.destination {
        return false;
    }
    match request.protocol {
        ProbeProtocol::Icmp => quoted.echo_request() == Some((request.id, request.sequence)),
        ProbeProtocol::Udp => match quoted.udp_ports() {
            Some((source_port, destination_port)) => {
                destination_port == request.port
                    && local_port.is_none_or(|port| port == source_port)
            }
            None => false,
        },
    }
}

/// Informational types that never answer a probe
pub fn is_informational(icmp_type: u8) -> bool {
    matches!(icmp_type, 8 | 9 | 10 | 13 | 14 | 17 | 18)
}

/// Human-readable name of an ICMP type
pub fn icmp_type_name(icmp_type: u8) -> &'static str {
    match icmp_type {
        0 => "echo reply",
        3 => "destination unreachable",
        4 => "source quench",
        5 => "redirect",
        8 => "echo request",
        9 => "router advertisement",
        10 => "router solicitation",
        11 => "time exceeded",
        12 => "parameter problem",
        13 => "timestamp request",
        14 => "timestamp reply",
        17 => "address mask request",
        18 => "address mask reply",
        _ => "unknown",
    }
}

/// Name of a Destination Unreachable code
pub fn unreachable_code_name(code: u8) -> &'static str {
    match code {
        0 => "network unreachable",
        1 => "host unreachable",
        2 => "protocol unreachable",
        3 => "port unreachable",
        4 => "fragmentation needed",
        5 => "source route failed",
        6 => "destination network unknown",
        7 => "destination host unknown",
        8 => "source host isolated",
        9 => "network administratively prohibited",
        10 => "host administratively prohibited",
        11 => "network unreachable for TOS",
        12 => "host unreachable for TOS",
        13 => "communication administratively prohibited",
        14 => "host precedence violation",
        15 => "precedence cutoff in effect",
        _ => "unknown code",
    }
}

/// Name of a Redirect code
pub fn redirect_code_name(code: u8) -> &'static str {
    match code {
        0 => "redirect for network",
        1 => "redirect for host",
        2 => "redirect for TOS and network",
        3 => "redirect for TOS and host",
        _ => "unknown redirect",
    }
}
