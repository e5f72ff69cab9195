//! RFC1071 Internet checksum
//!
//! All values returned here are plain `u16`s holding the checksum as a
//! big-endian quantity; embed them into a header with `to_be_bytes`.

use std::net::Ipv4Addr;

/// IANA protocol number for UDP, used in the pseudo-header
const IPPROTO_UDP: u8 = 17;

/// Compute the one's-complement checksum of `buffer`.
///
/// Words are read in network byte order and a trailing odd byte is padded
/// with a zero low byte. Computing the checksum over a buffer that already
/// carries its own checksum yields `0`.
pub fn compute(buffer: &[u8]) -> u16 {
    finalize(sum_be_words(buffer))
}

/// Check that a buffer with an embedded checksum is intact.
pub fn verify(buffer: &[u8]) -> bool {
    compute(buffer) == 0
}

/// Compute the UDP checksum over the IPv4 pseudo-header and `segment`.
///
/// `segment` is the full UDP header plus payload with the checksum field
/// zeroed. A computed value of zero is transmitted as `0xFFFF` (RFC768).
pub fn udp_ipv4(source: Ipv4Addr, destination: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = ipv4_word_sum(source) + ipv4_word_sum(destination);
    sum += u32::from(IPPROTO_UDP);
    sum += segment.len() as u32;
    sum += sum_be_words(segment);
    match finalize(sum) {
        0 => 0xFFFF,
        checksum => checksum,
    }
}

fn ipv4_word_sum(ip: Ipv4Addr) -> u32 {
    let octets = ip.octets();
    u32::from(u16::from_be_bytes([octets[0], octets[1]]))
        + u32::from(u16::from_be_bytes([octets[2], octets[3]]))
}

fn sum_be_words(data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    let mut sum = 0u32;
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([chunk[0], chunk[1]])));
        // Fold early so arbitrarily large buffers never overflow the accumulator
        if sum & 0x8000_0000 != 0 {
            sum = (sum >> 16) + (sum & 0xFFFF);
        }
    }
    if let Some(&tail) = chunks.remainder().first() {
        sum += u32::from(tail) << 8;
    }
    sum
}

const fn finalize(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }
    !(sum as u16)
}
