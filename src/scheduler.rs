//! Per-attempt probe state machine and retry policy
//!
//! One attempt owns one transport from open to drop:
//!
//! ```text
//! Idle -> Sent -> { Matched | Unmatched | TimedOut | Errored } -> Done
//! ```
//!
//! Opening the transport is the only step whose failure is fatal; every
//! later failure is folded into the attempt's [`Outcome`].

use crate::classify::{classify, Verdict};
use crate::error::ProbeError;
use crate::packet::codec::{build_echo_request, build_udp_probe, parse_reply};
use crate::probe::{Outcome, ProbeReply, ProbeRequest};
use crate::socket::{ProbeProtocol, ProbeTransport, TransportFactory};
use serde::{Deserialize, Serialize};
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How an attempt treats datagrams that do not answer its probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceivePolicy {
    /// Keep reading until a matching reply or the deadline
    #[default]
    UntilDeadline,
    /// The first datagram read ends the attempt, whatever it is
    SingleShot,
}

/// Everything one attempt produced
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    /// The request as sent (`sent_at` filled in when it left)
    pub request: ProbeRequest,
    /// Final outcome
    pub outcome: Outcome,
    /// The correlated reply, when there was one
    pub reply: Option<ProbeReply>,
    /// Non-final messages seen while waiting (redirects)
    pub notices: Vec<Outcome>,
}

/// How many attempts a unit of work gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts
    pub attempts: u8,
    /// Stop at the first `Success`
    pub stop_on_success: bool,
}

impl RetryPolicy {
    /// Up to `attempts` tries, stopping at the first success (ping)
    pub fn until_success(attempts: u8) -> Self {
        RetryPolicy {
            attempts,
            stop_on_success: true,
        }
    }

    /// Exactly `attempts` tries (traceroute hop)
    pub fn exhaustive(attempts: u8) -> Self {
        RetryPolicy {
            attempts,
            stop_on_success: false,
        }
    }
}

/// Attempts made for one unit of work
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryReport {
    /// Attempts in the order they ran
    pub attempts: Vec<AttemptReport>,
    /// The loop stopped early because of cancellation
    pub cancelled: bool,
}

impl RetryReport {
    /// The first success, otherwise the last attempt's outcome
    pub fn outcome(&self) -> Option<&Outcome> {
        self.attempts
            .iter()
            .map(|a| &a.outcome)
            .find(|o| matches!(o, Outcome::Success { .. }))
            .or_else(|| self.attempts.last().map(|a| &a.outcome))
    }
}

enum AttemptState {
    Idle,
    Sent { deadline: Instant },
    Matched { outcome: Outcome, reply: ProbeReply },
    Unmatched { outcome: Outcome },
    TimedOut,
    Errored { reason: String },
}

/// Runs probe attempts against transports from a factory
#[derive(Clone)]
pub struct ProbeScheduler {
    factory: Arc<dyn TransportFactory>,
    timeout: Duration,
    policy: ReceivePolicy,
}

impl ProbeScheduler {
    /// Create a scheduler with the given per-attempt timeout
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        timeout: Duration,
        policy: ReceivePolicy,
    ) -> Self {
        ProbeScheduler {
            factory,
            timeout,
            policy,
        }
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one blocking attempt.
    ///
    /// Fails only when the transport cannot be opened.
    pub fn attempt(&self, mut request: ProbeRequest) -> Result<AttemptReport, ProbeError> {
        let mut transport = self.factory.open(request.protocol)?;
        let local_port = transport.local_port();
        let mut notices = Vec::new();
        let mut state = AttemptState::Idle;

        loop {
            state = match state {
                AttemptState::Idle => self.send(transport.as_mut(), &mut request),
                AttemptState::Sent { deadline } => {
                    self.receive(transport.as_mut(), &request, local_port, deadline, &mut notices)
                }
                AttemptState::Matched { outcome, reply } => {
                    trace!(seq = request.sequence, outcome = outcome.label(), "attempt matched");
                    return Ok(self.done(request, outcome, Some(reply), notices));
                }
                AttemptState::Unmatched { outcome } => {
                    trace!(seq = request.sequence, outcome = outcome.label(), "attempt consumed");
                    return Ok(self.done(request, outcome, None, notices));
                }
                AttemptState::TimedOut => {
                    trace!(seq = request.sequence, "attempt timed out");
                    return Ok(self.done(request, Outcome::Timeout, None, notices));
                }
                AttemptState::Errored { reason } => {
                    debug!(seq = request.sequence, %reason, "attempt failed");
                    let outcome = Outcome::TransportError { reason };
                    return Ok(self.done(request, outcome, None, notices));
                }
            };
        }
    }

    /// Run one attempt on tokio's blocking pool
    pub async fn attempt_async(&self, request: ProbeRequest) -> Result<AttemptReport, ProbeError> {
        let scheduler = self.clone();
        tokio::task::spawn_blocking(move || scheduler.attempt(request))
            .await
            .map_err(|e| ProbeError::Worker(e.to_string()))?
    }

    /// Run attempts built from `template` under `policy`.
    ///
    /// Every attempt gets a fresh sequence number from `next_sequence`.
    /// Cancellation is checked before each attempt.
    pub async fn run_with_retries<F>(
        &self,
        template: &ProbeRequest,
        policy: RetryPolicy,
        cancel: &CancellationToken,
        mut next_sequence: F,
    ) -> Result<RetryReport, ProbeError>
    where
        F: FnMut() -> u16,
    {
        let mut report = RetryReport::default();

        for attempt in 0..policy.attempts {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let mut request = template.clone();
            request.sequence = next_sequence();
            let result = self.attempt_async(request).await?;
            trace!(
                attempt = attempt + 1,
                of = policy.attempts,
                outcome = result.outcome.label(),
                "attempt finished"
            );

            let success = matches!(result.outcome, Outcome::Success { .. });
            report.attempts.push(result);
            if success && policy.stop_on_success {
                break;
            }
        }

        Ok(report)
    }

    fn send(&self, transport: &mut dyn ProbeTransport, request: &mut ProbeRequest) -> AttemptState {
        let packet = match request.protocol {
            ProbeProtocol::Icmp => {
                build_echo_request(request.id, request.sequence, &request.payload)
            }
            ProbeProtocol::Udp => build_udp_probe(&request.payload),
        };

        if let Some(ttl) = request.ttl {
            if let Err(e) = transport.set_ttl(ttl) {
                return AttemptState::Errored {
                    reason: e.to_string(),
                };
            }
        }

        let destination = SocketAddrV4::new(request.destination, request.port);
        match transport.send(&packet, destination) {
            Ok(()) => {
                let sent_at = Instant::now();
                request.sent_at = Some(sent_at);
                trace!(
                    id = request.id,
                    seq = request.sequence,
                    ttl = ?request.ttl,
                    %destination,
                    "probe sent"
                );
                AttemptState::Sent {
                    deadline: sent_at + self.timeout,
                }
            }
            Err(e) => AttemptState::Errored {
                reason: e.to_string(),
            },
        }
    }

    fn receive(
        &self,
        transport: &mut dyn ProbeTransport,
        request: &ProbeRequest,
        local_port: Option<u16>,
        deadline: Instant,
        notices: &mut Vec<Outcome>,
    ) -> AttemptState {
        let single_shot = self.policy == ReceivePolicy::SingleShot;
        let keep_waiting = AttemptState::Sent { deadline };

        let datagram = match transport.recv(deadline) {
            Ok(Some(datagram)) => datagram,
            Ok(None) => return AttemptState::TimedOut,
            Err(e) => {
                return AttemptState::Errored {
                    reason: e.to_string(),
                }
            }
        };

        let received_at = Instant::now();
        let Some(rtt) = request
            .sent_at
            .and_then(|sent_at| received_at.checked_duration_since(sent_at))
        else {
            debug!(seq = request.sequence, "discarding reply with negative rtt");
            return keep_waiting;
        };
        let rtt_ms = rtt.as_secs_f64() * 1000.0;

        let reply = match parse_reply(&datagram) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(len = datagram.len(), error = %e, "malformed datagram");
                return if single_shot {
                    AttemptState::Unmatched {
                        outcome: Outcome::MalformedReply,
                    }
                } else {
                    keep_waiting
                };
            }
        };

        match classify(&reply, request, local_port, rtt_ms) {
            Verdict::Matched(outcome) => AttemptState::Matched {
                outcome,
                reply: ProbeReply {
                    source_addr: reply.source,
                    icmp_type: reply.icmp_type,
                    icmp_code: reply.icmp_code,
                    matched_request_id: Some(request.id),
                    received_at,
                    rtt_ms,
                },
            },
            Verdict::Report(outcome) => {
                debug!(seq = request.sequence, responder = ?outcome.responder(), "icmp redirect");
                notices.push(outcome.clone());
                if single_shot {
                    AttemptState::Unmatched { outcome }
                } else {
                    keep_waiting
                }
            }
            Verdict::Unrelated { icmp_type, code } => {
                if single_shot {
                    AttemptState::Unmatched {
                        outcome: Outcome::Ignored { icmp_type, code },
                    }
                } else {
                    keep_waiting
                }
            }
        }
    }

    fn done(
        &self,
        request: ProbeRequest,
        outcome: Outcome,
        reply: Option<ProbeReply>,
        notices: Vec<Outcome>,
    ) -> AttemptReport {
        AttemptReport {
            request,
            outcome,
            reply,
            notices,
        }
    }
}
