//! Wire-format construction and parsing of probe and reply datagrams

use super::checksum;
use pnet::packet::icmp::echo_reply::MutableEchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpTypes};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::Packet;
use std::net::Ipv4Addr;
use thiserror::Error;

/// IPv4 header minimum length in bytes
pub const IPV4_HEADER_MIN_LEN_BYTES: usize = 20;
/// ICMP header length in bytes (type, code, checksum, identifier, sequence)
pub const ICMP_HEADER_LEN_BYTES: usize = 8;
/// UDP header length in bytes
pub const UDP_HEADER_LEN_BYTES: usize = 8;
/// Smallest datagram that can carry an IPv4 header and an ICMP header
pub const MIN_REPLY_LEN_BYTES: usize = IPV4_HEADER_MIN_LEN_BYTES + ICMP_HEADER_LEN_BYTES;

/// A received datagram that cannot be decoded as IPv4 + ICMP
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedReply {
    /// Fewer bytes than an IPv4 header plus an ICMP header
    #[error("datagram too short: {len} bytes, need at least {MIN_REPLY_LEN_BYTES}")]
    TooShort {
        /// Received length
        len: usize,
    },
    /// The IP version nibble is not 4
    #[error("not an IPv4 datagram (version {version})")]
    NotIpv4 {
        /// Version nibble found
        version: u8,
    },
    /// The IHL field is below 5 or leaves no room for the ICMP header
    #[error("invalid IPv4 header length: {header_len} bytes in a {len}-byte datagram")]
    BadHeaderLength {
        /// Header length in bytes, from the IHL field
        header_len: usize,
        /// Received length
        len: usize,
    },
}

/// The start of the original datagram quoted inside an ICMP error message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotedDatagram {
    /// Destination of the original datagram
    pub destination: Ipv4Addr,
    /// IP protocol number of the original datagram
    pub protocol: u8,
    /// Up to the first 8 bytes of the original transport header
    pub transport_header: Vec<u8>,
}

impl QuotedDatagram {
    /// `(identifier, sequence)` when the quote is an ICMP Echo Request
    pub fn echo_request(&self) -> Option<(u16, u16)> {
        let h = &self.transport_header;
        if self.protocol != IpNextHeaderProtocols::Icmp.0
            || h.len() < ICMP_HEADER_LEN_BYTES
            || h[0] != IcmpTypes::EchoRequest.0
        {
            return None;
        }
        Some((
            u16::from_be_bytes([h[4], h[5]]),
            u16::from_be_bytes([h[6], h[7]]),
        ))
    }

    /// `(source_port, destination_port)` when the quote is a UDP header
    pub fn udp_ports(&self) -> Option<(u16, u16)> {
        let h = &self.transport_header;
        if self.protocol != IpNextHeaderProtocols::Udp.0 || h.len() < 4 {
            return None;
        }
        Some((
            u16::from_be_bytes([h[0], h[1]]),
            u16::from_be_bytes([h[2], h[3]]),
        ))
    }
}

/// A decoded IPv4 + ICMP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpReply {
    /// Source address from the IP header
    pub source: Ipv4Addr,
    /// Destination address from the IP header
    pub destination: Ipv4Addr,
    /// ICMP type
    pub icmp_type: u8,
    /// ICMP code
    pub icmp_code: u8,
    /// Checksum as carried on the wire
    pub checksum: u16,
    /// Identifier field (meaningful for echo messages)
    pub identifier: u16,
    /// Sequence field (meaningful for echo messages)
    pub sequence: u16,
    /// Everything after the 8-byte ICMP header
    pub payload: Vec<u8>,
    /// Original datagram quoted by an error message, when decodable
    pub quoted: Option<QuotedDatagram>,
}

/// Build an ICMP Echo Request: 8-byte header followed by `payload`.
///
/// The checksum is computed with the checksum field zeroed and then written
/// in network byte order.
pub fn build_echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; MutableEchoRequestPacket::minimum_packet_size() + payload.len()];
    if let Some(mut packet) = MutableEchoRequestPacket::new(&mut buf) {
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_icmp_code(IcmpCode(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        packet.set_payload(payload);
        let sum = checksum::compute(packet.packet());
        packet.set_checksum(sum);
    }
    buf
}

/// Build an ICMP Echo Reply mirroring a request.
pub fn build_echo_reply(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; MutableEchoReplyPacket::minimum_packet_size() + payload.len()];
    if let Some(mut packet) = MutableEchoReplyPacket::new(&mut buf) {
        packet.set_icmp_type(IcmpTypes::EchoReply);
        packet.set_icmp_code(IcmpCode(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        packet.set_payload(payload);
        let sum = checksum::compute(packet.packet());
        packet.set_checksum(sum);
    }
    buf
}

/// Build an ICMP error message (`type` 3, 5, 11, ...) quoting `original`.
///
/// `rest_of_header` fills bytes 4..8 (unused for most errors, the gateway
/// address for a Redirect). Per RFC792 only the original IP header and the
/// first 8 bytes of its payload are quoted.
pub fn build_icmp_error(
    icmp_type: u8,
    icmp_code: u8,
    rest_of_header: [u8; 4],
    original: &[u8],
) -> Vec<u8> {
    let quoted_len = quoted_length(original).min(original.len());
    let mut buf = Vec::with_capacity(ICMP_HEADER_LEN_BYTES + quoted_len);
    buf.extend_from_slice(&[icmp_type, icmp_code, 0, 0]);
    buf.extend_from_slice(&rest_of_header);
    buf.extend_from_slice(&original[..quoted_len]);
    let sum = checksum::compute(&buf);
    buf[2..4].copy_from_slice(&sum.to_be_bytes());
    buf
}

/// Payload for a UDP probe.
///
/// UDP probes need no ICMP framing; the kernel adds the UDP header and its
/// checksum when the payload is sent on a datagram socket.
pub fn build_udp_probe(payload: &[u8]) -> Vec<u8> {
    payload.to_vec()
}

/// Build a complete UDP datagram with the pseudo-header checksum filled in.
pub fn build_udp_datagram(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    source_port: u16,
    destination_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let length = (UDP_HEADER_LEN_BYTES + payload.len()) as u16;
    let mut segment = Vec::with_capacity(length as usize);
    segment.extend_from_slice(&source_port.to_be_bytes());
    segment.extend_from_slice(&destination_port.to_be_bytes());
    segment.extend_from_slice(&length.to_be_bytes());
    segment.extend_from_slice(&[0, 0]);
    segment.extend_from_slice(payload);
    let sum = checksum::udp_ipv4(source, destination, &segment);
    segment[6..8].copy_from_slice(&sum.to_be_bytes());
    segment
}

/// Wrap `payload` in an option-less IPv4 header.
pub fn build_ipv4_datagram(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: u8,
    ttl: u8,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = IPV4_HEADER_MIN_LEN_BYTES + payload.len();
    let mut packet = vec![0u8; total_len];

    if let Some(mut ipv4_packet) = MutableIpv4Packet::new(&mut packet) {
        ipv4_packet.set_version(4);
        ipv4_packet.set_header_length(5); // 5 * 4 = 20 bytes
        ipv4_packet.set_dscp(0);
        ipv4_packet.set_ecn(0);
        ipv4_packet.set_total_length(total_len as u16);
        ipv4_packet.set_identification(rand::random::<u16>());
        ipv4_packet.set_flags(0);
        ipv4_packet.set_fragment_offset(0);
        ipv4_packet.set_ttl(ttl);
        ipv4_packet.set_next_level_protocol(IpNextHeaderProtocol::new(protocol));
        ipv4_packet.set_source(source);
        ipv4_packet.set_destination(destination);
        ipv4_packet.set_payload(payload);
    }

    let sum = checksum::compute(&packet[..IPV4_HEADER_MIN_LEN_BYTES]);
    packet[10..12].copy_from_slice(&sum.to_be_bytes());
    packet
}

/// Decode a raw IPv4 datagram carrying an ICMP message.
///
/// The IP header is 20 bytes unless the IHL field announces options, in
/// which case the options are skipped too.
pub fn parse_reply(datagram: &[u8]) -> Result<IcmpReply, MalformedReply> {
    let len = datagram.len();
    if len < MIN_REPLY_LEN_BYTES {
        return Err(MalformedReply::TooShort { len });
    }

    let version = datagram[0] >> 4;
    if version != 4 {
        return Err(MalformedReply::NotIpv4 { version });
    }

    let header_len = usize::from(datagram[0] & 0x0F) * 4;
    if header_len < IPV4_HEADER_MIN_LEN_BYTES || header_len + ICMP_HEADER_LEN_BYTES > len {
        return Err(MalformedReply::BadHeaderLength { header_len, len });
    }

    let source = ipv4_at(datagram, 12);
    let destination = ipv4_at(datagram, 16);
    let icmp = &datagram[header_len..];
    let icmp_type = icmp[0];
    let payload = icmp[ICMP_HEADER_LEN_BYTES..].to_vec();

    let quoted = if carries_quote(icmp_type) {
        parse_quoted(&payload)
    } else {
        None
    };

    Ok(IcmpReply {
        source,
        destination,
        icmp_type,
        icmp_code: icmp[1],
        checksum: u16::from_be_bytes([icmp[2], icmp[3]]),
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
        payload,
        quoted,
    })
}

fn carries_quote(icmp_type: u8) -> bool {
    icmp_type == IcmpTypes::DestinationUnreachable.0
        || icmp_type == IcmpTypes::RedirectMessage.0
        || icmp_type == IcmpTypes::TimeExceeded.0
        || icmp_type == IcmpTypes::ParameterProblem.0
}

fn parse_quoted(data: &[u8]) -> Option<QuotedDatagram> {
    if data.len() < IPV4_HEADER_MIN_LEN_BYTES || data[0] >> 4 != 4 {
        return None;
    }
    let header_len = usize::from(data[0] & 0x0F) * 4;
    if header_len < IPV4_HEADER_MIN_LEN_BYTES || header_len > data.len() {
        return None;
    }
    let end = data.len().min(header_len + 8);
    Some(QuotedDatagram {
        destination: ipv4_at(data, 16),
        protocol: data[9],
        transport_header: data[header_len..end].to_vec(),
    })
}

fn quoted_length(original: &[u8]) -> usize {
    match original.first() {
        Some(first) if first >> 4 == 4 => usize::from(first & 0x0F) * 4 + 8,
        _ => original.len(),
    }
}

fn ipv4_at(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    )
}
