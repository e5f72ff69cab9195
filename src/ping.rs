//! Ping sessions
//!
//! A session sends `count` sequences to one destination. Each sequence gets
//! up to `retries` attempts and keeps one final outcome: the first success,
//! otherwise whatever the last attempt ended with.

use crate::config::ProbeConfig;
use crate::error::ProbeError;
use crate::probe::{Outcome, ProbeRequest};
use crate::scheduler::{ProbeScheduler, RetryPolicy};
use crate::sink::{ProbeEvent, ProbeUnit, ResultSink};
use crate::stats::{summarize, Summary};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Finished (or cancelled) ping session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingSession {
    /// Target as given by the user
    pub destination: String,
    /// Resolved target address
    pub resolved_ip: Ipv4Addr,
    /// ICMP identifier used for every probe of the session
    pub identifier: u16,
    /// One outcome per sequence, in sequence order
    pub samples: Vec<Outcome>,
    /// Statistics over `samples`
    pub summary: Summary,
    /// The session stopped early because of cancellation
    pub cancelled: bool,
}

/// Parameters of one ping session
#[derive(Debug, Clone, PartialEq)]
pub struct PingPlan {
    /// Target as given by the user
    pub target: String,
    /// Resolved destination
    pub destination: Ipv4Addr,
    /// Session identifier
    pub identifier: u16,
    /// Number of sequences
    pub count: u16,
    /// Attempts per sequence
    pub retries: u8,
    /// Echo payload
    pub payload: Vec<u8>,
    /// Pause between sequences
    pub interval: Duration,
}

impl PingPlan {
    /// Derive a plan from the shared configuration
    pub fn from_config(
        config: &ProbeConfig,
        target: impl Into<String>,
        destination: Ipv4Addr,
        identifier: u16,
    ) -> Self {
        PingPlan {
            target: target.into(),
            destination,
            identifier,
            count: config.count,
            retries: config.retries,
            payload: config.icmp_payload(),
            interval: config.interval,
        }
    }
}

/// Runs ping sessions over a scheduler
#[derive(Clone)]
pub struct Pinger {
    scheduler: ProbeScheduler,
    sink: Arc<dyn ResultSink>,
}

impl Pinger {
    /// Create a pinger reporting to `sink`
    pub fn new(scheduler: ProbeScheduler, sink: Arc<dyn ResultSink>) -> Self {
        Pinger { scheduler, sink }
    }

    /// Run a session to completion or cancellation
    #[instrument(
        skip_all,
        fields(host = %plan.target, dest = %plan.destination, id = plan.identifier)
    )]
    pub async fn run(
        &self,
        plan: &PingPlan,
        cancel: &CancellationToken,
    ) -> Result<PingSession, ProbeError> {
        let mut wire_sequence: u16 = 0;
        let mut samples = Vec::with_capacity(usize::from(plan.count));
        let mut cancelled = false;

        for seq in 1..=plan.count {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if seq > 1 && !plan.interval.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(plan.interval) => {}
                }
            }

            let template =
                ProbeRequest::echo(plan.identifier, seq, plan.destination, plan.payload.clone());
            let report = self
                .scheduler
                .run_with_retries(&template, RetryPolicy::until_success(plan.retries), cancel, || {
                    wire_sequence = wire_sequence.wrapping_add(1);
                    wire_sequence
                })
                .await?;

            for attempt in &report.attempts {
                self.sink.record(&ProbeEvent {
                    target: plan.target.clone(),
                    unit: ProbeUnit::Sequence(seq),
                    outcome: attempt.outcome.clone(),
                    responder: attempt.outcome.responder(),
                    hostname: None,
                });
            }

            if let Some(outcome) = report.outcome() {
                debug!(seq, outcome = outcome.label(), rtt_ms = ?outcome.rtt_ms(), "sequence done");
                samples.push(outcome.clone());
            }
            if report.cancelled {
                cancelled = true;
                break;
            }
        }

        let session = PingSession {
            destination: plan.target.clone(),
            resolved_ip: plan.destination,
            identifier: plan.identifier,
            summary: summarize(&samples),
            samples,
            cancelled,
        };
        self.sink.finish_ping(&session);
        Ok(session)
    }
}
