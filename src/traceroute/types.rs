//! Core types for traceroute operations

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// How the TTL range is walked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepMode {
    /// One TTL at a time, stopping once the destination answers
    #[default]
    Sequential,
    /// Every TTL at once; results are ordered and cut afterwards
    Parallel,
}

impl SweepMode {
    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            SweepMode::Sequential => "sequential",
            SweepMode::Parallel => "parallel",
        }
    }
}

/// Result for one TTL of a sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopResult {
    /// Time-to-live value
    pub ttl: u8,
    /// First address that answered at this TTL
    pub responder: Option<Ipv4Addr>,
    /// Reverse DNS name of the responder, or its numeric form
    pub hostname: Option<String>,
    /// Round-trip times of every answered attempt, in milliseconds
    pub rtt_samples: Vec<f64>,
    /// Fraction of attempts without an answer, in `[0, 1]`
    pub loss_rate: f64,
}

impl HopResult {
    /// Build a hop from its samples; `attempts` is the number of probes
    /// actually sent for the hop
    pub fn new(ttl: u8, responder: Option<Ipv4Addr>, rtt_samples: Vec<f64>, attempts: u8) -> Self {
        let loss_rate = if attempts == 0 {
            1.0
        } else {
            let lost = usize::from(attempts).saturating_sub(rtt_samples.len());
            lost as f64 / f64::from(attempts)
        };
        HopResult {
            ttl,
            responder,
            hostname: None,
            rtt_samples,
            loss_rate,
        }
    }

    /// Loss as a percentage
    pub fn loss_pct(&self) -> f64 {
        self.loss_rate * 100.0
    }

    /// Check if this hop reached the destination
    pub fn is_destination(&self, target: Ipv4Addr) -> bool {
        self.responder == Some(target)
    }

    /// Mean RTT over the samples
    pub fn avg_rtt_ms(&self) -> Option<f64> {
        if self.rtt_samples.is_empty() {
            None
        } else {
            Some(self.rtt_samples.iter().sum::<f64>() / self.rtt_samples.len() as f64)
        }
    }

    /// `hostname (addr)`, or just the address when the name is numeric
    pub fn display_name(&self) -> Option<String> {
        let addr = self.responder?;
        Some(match &self.hostname {
            Some(name) if *name != addr.to_string() => format!("{name} ({addr})"),
            _ => addr.to_string(),
        })
    }
}
