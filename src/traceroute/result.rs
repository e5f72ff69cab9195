//! Result types for traceroute operations

use super::types::{HopResult, SweepMode};
use crate::socket::ProbeProtocol;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Result of a traceroute sweep
///
/// Hops are ordered by TTL. In a completed sweep that reached the
/// destination the last hop is the destination and `hops.len()` equals
/// its TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracerouteSession {
    /// Target hostname as provided
    pub destination: String,
    /// Resolved target IP address
    pub resolved_ip: Ipv4Addr,
    /// Sweep mode that produced the hops
    pub mode: SweepMode,
    /// Protocol used for probing
    pub protocol: ProbeProtocol,
    /// All hops probed
    pub hops: Vec<HopResult>,
    /// Whether the destination answered
    pub reached_destination: bool,
    /// Last TTL that was probed
    pub termination_ttl: Option<u8>,
    /// The sweep stopped early because of cancellation
    pub cancelled: bool,
}

impl TracerouteSession {
    /// Get the number of hops probed
    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Get the hop that reached the destination, if any
    pub fn destination_hop(&self) -> Option<&HopResult> {
        self.hops
            .iter()
            .find(|hop| hop.is_destination(self.resolved_ip))
    }

    /// Check if a specific TTL had a response
    pub fn has_response_at_ttl(&self, ttl: u8) -> bool {
        self.hops
            .iter()
            .any(|h| h.ttl == ttl && h.responder.is_some())
    }

    /// Mean of the per-hop average RTTs over responding hops
    pub fn average_rtt_ms(&self) -> Option<f64> {
        let rtts: Vec<f64> = self.hops.iter().filter_map(HopResult::avg_rtt_ms).collect();

        if rtts.is_empty() {
            None
        } else {
            Some(rtts.iter().sum::<f64>() / rtts.len() as f64)
        }
    }
}
