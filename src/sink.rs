//! Consumers of probe events and finished sessions
//!
//! The engine never prints. Every attempt outcome is pushed to a
//! [`ResultSink`] as a [`ProbeEvent`], and every finished session is handed
//! over once, read-only.

use crate::ping::PingSession;
use crate::probe::Outcome;
use crate::traceroute::TracerouteSession;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Unit of work an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeUnit {
    /// Ping sequence, counting from 1
    Sequence(u16),
    /// Traceroute TTL
    Ttl(u8),
}

/// One attempt outcome as seen by a sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeEvent {
    /// Target as given by the user
    pub target: String,
    /// Sequence or TTL the attempt belongs to
    pub unit: ProbeUnit,
    /// What happened
    pub outcome: Outcome,
    /// Address that answered, if any
    pub responder: Option<Ipv4Addr>,
    /// Name of the responder, when resolved
    pub hostname: Option<String>,
}

/// Observer of probing progress
pub trait ResultSink: Send + Sync {
    /// Called once per finished attempt
    fn record(&self, event: &ProbeEvent);

    /// Called once when a ping session completes
    fn finish_ping(&self, _session: &PingSession) {}

    /// Called once when a traceroute session completes
    fn finish_traceroute(&self, _session: &TracerouteSession) {}
}

/// Turns events into `tracing` records
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ResultSink for TracingSink {
    fn record(&self, event: &ProbeEvent) {
        debug!(
            target_host = %event.target,
            unit = ?event.unit,
            outcome = event.outcome.label(),
            responder = ?event.responder,
            rtt_ms = ?event.outcome.rtt_ms(),
            "probe"
        );
    }

    fn finish_ping(&self, session: &PingSession) {
        let s = &session.summary;
        info!(
            target_host = %session.destination,
            ip = %session.resolved_ip,
            sent = s.sent,
            received = s.received,
            loss_pct = s.loss_pct,
            "ping finished"
        );
    }

    fn finish_traceroute(&self, session: &TracerouteSession) {
        info!(
            target_host = %session.destination,
            ip = %session.resolved_ip,
            hops = session.hops.len(),
            reached = session.reached_destination,
            "traceroute finished"
        );
    }
}

/// Keeps everything in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProbeEvent>>,
    pings: Mutex<Vec<PingSession>>,
    traces: Mutex<Vec<TracerouteSession>>,
}

impl CollectingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far
    pub fn events(&self) -> Vec<ProbeEvent> {
        self.events.lock().expect("mutex poisoned").clone()
    }

    /// Finished ping sessions
    pub fn ping_sessions(&self) -> Vec<PingSession> {
        self.pings.lock().expect("mutex poisoned").clone()
    }

    /// Finished traceroute sessions
    pub fn traceroute_sessions(&self) -> Vec<TracerouteSession> {
        self.traces.lock().expect("mutex poisoned").clone()
    }
}

impl ResultSink for CollectingSink {
    fn record(&self, event: &ProbeEvent) {
        self.events
            .lock()
            .expect("mutex poisoned")
            .push(event.clone());
    }

    fn finish_ping(&self, session: &PingSession) {
        self.pings
            .lock()
            .expect("mutex poisoned")
            .push(session.clone());
    }

    fn finish_traceroute(&self, session: &TracerouteSession) {
        self.traces
            .lock()
            .expect("mutex poisoned")
            .push(session.clone());
    }
}

/// Message delivered by a [`ChannelSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum SinkMessage {
    /// An attempt finished
    Event(ProbeEvent),
    /// A ping session finished
    Ping(PingSession),
    /// A traceroute session finished
    Traceroute(TracerouteSession),
}

/// Forwards everything over an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }

    fn send(&self, message: SinkMessage) {
        // A dropped receiver just means nobody is listening anymore
        if self.tx.send(message).is_err() {
            debug!("sink receiver dropped");
        }
    }
}

impl ResultSink for ChannelSink {
    fn record(&self, event: &ProbeEvent) {
        self.send(SinkMessage::Event(event.clone()));
    }

    fn finish_ping(&self, session: &PingSession) {
        self.send(SinkMessage::Ping(session.clone()));
    }

    fn finish_traceroute(&self, session: &TracerouteSession) {
        self.send(SinkMessage::Traceroute(session.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(unit: ProbeUnit) -> ProbeEvent {
        ProbeEvent {
            target: "example.test".to_string(),
            unit,
            outcome: Outcome::Timeout,
            responder: None,
            hostname: None,
        }
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::new();
        sink.record(&event(ProbeUnit::Sequence(1)));
        sink.record(&event(ProbeUnit::Ttl(4)));
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].unit, ProbeUnit::Ttl(4));
        assert!(sink.ping_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut rx) = ChannelSink::channel();
        sink.record(&event(ProbeUnit::Sequence(2)));
        match rx.recv().await {
            Some(SinkMessage::Event(e)) => assert_eq!(e.unit, ProbeUnit::Sequence(2)),
            other => panic!("unexpected message: {other:?}"),
        }

        drop(rx);
        // Must not panic once the receiver is gone
        sink.record(&event(ProbeUnit::Sequence(3)));
    }

    #[test]
    fn test_event_json() {
        let json = serde_json::to_value(event(ProbeUnit::Ttl(7))).unwrap();
        assert_eq!(json["unit"]["ttl"], 7);
        assert_eq!(json["outcome"]["kind"], "timeout");
    }
}
