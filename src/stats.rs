//! Loss and round-trip statistics

use crate::probe::Outcome;
use serde::{Deserialize, Serialize};

/// Minimum, mean and maximum RTT in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RttStats {
    /// Fastest reply
    pub min_ms: f64,
    /// Mean over all replies
    pub avg_ms: f64,
    /// Slowest reply
    pub max_ms: f64,
}

/// Aggregate over one session's outcomes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Outcomes considered
    pub sent: usize,
    /// Outcomes that carried a reply
    pub received: usize,
    /// `100 * (sent - received) / sent`, or 0 when nothing was sent
    pub loss_pct: f64,
    /// `None` when no reply arrived
    pub rtt: Option<RttStats>,
}

/// Summarize outcomes; only Echo Replies and Time Exceeded count as
/// received.
pub fn summarize(outcomes: &[Outcome]) -> Summary {
    let rtts: Vec<f64> = outcomes
        .iter()
        .filter(|o| o.is_reply())
        .filter_map(Outcome::rtt_ms)
        .collect();

    let sent = outcomes.len();
    let received = rtts.len();
    let loss_pct = if sent == 0 {
        0.0
    } else {
        100.0 * (sent - received) as f64 / sent as f64
    };

    let rtt = if rtts.is_empty() {
        None
    } else {
        let min_ms = rtts.iter().copied().fold(f64::INFINITY, f64::min);
        let max_ms = rtts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg_ms = rtts.iter().sum::<f64>() / received as f64;
        Some(RttStats {
            min_ms,
            avg_ms,
            max_ms,
        })
    };

    Summary {
        sent,
        received,
        loss_pct,
        rtt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const HOST: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 9);

    #[test]
    fn test_empty_input() {
        let summary = summarize(&[]);
        assert_eq!(summary.sent, 0);
        assert_eq!(summary.loss_pct, 0.0);
        assert!(summary.rtt.is_none());
    }

    #[test]
    fn test_mixed_outcomes() {
        let outcomes = vec![
            Outcome::Success { rtt_ms: 10.0, responder: HOST },
            Outcome::Timeout,
            Outcome::TtlExceeded { responder: HOST, rtt_ms: 30.0 },
            Outcome::Unreachable { code: 1, responder: HOST, rtt_ms: 1.0 },
        ];
        let summary = summarize(&outcomes);
        assert_eq!(summary.sent, 4);
        assert_eq!(summary.received, 2);
        assert_eq!(summary.loss_pct, 50.0);
        let rtt = summary.rtt.unwrap();
        assert_eq!(rtt.min_ms, 10.0);
        assert_eq!(rtt.avg_ms, 20.0);
        assert_eq!(rtt.max_ms, 30.0);
    }

    #[test]
    fn test_all_lost() {
        let summary = summarize(&[Outcome::Timeout, Outcome::MalformedReply]);
        assert_eq!(summary.loss_pct, 100.0);
        assert!(summary.rtt.is_none());
    }
}
