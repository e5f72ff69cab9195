//! TTL sweep
//!
//! Every TTL gets `retries` attempts. An attempt that came back (Echo
//! Reply, Time Exceeded, Port Unreachable) contributes an RTT sample, and
//! the first address that answered becomes the hop's responder. A hop whose
//! responder is the destination ends the sweep.

use super::result::TracerouteSession;
use super::types::{HopResult, SweepMode};
use crate::config::{ProbeConfig, UDP_BASE_PORT};
use crate::dns::HostResolver;
use crate::error::ProbeError;
use crate::probe::{Outcome, ProbeRequest};
use crate::scheduler::{ProbeScheduler, RetryPolicy};
use crate::sink::{ProbeEvent, ProbeUnit, ResultSink};
use crate::socket::ProbeProtocol;
use futures::stream::{FuturesUnordered, StreamExt};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Everything a sweep needs to know about its target
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    /// Target as given by the user
    pub target: String,
    /// Resolved destination
    pub destination: Ipv4Addr,
    /// Session identifier carried by ICMP probes
    pub identifier: u16,
    /// Probe protocol
    pub protocol: ProbeProtocol,
    /// Highest TTL to probe
    pub max_hops: u8,
    /// Attempts per TTL
    pub retries: u8,
    /// Probe payload
    pub payload: Vec<u8>,
    /// Sequential or parallel
    pub mode: SweepMode,
    /// Pause between hops (sequential only)
    pub send_interval: Duration,
    /// Look up PTR names for responders
    pub resolve_hostnames: bool,
}

impl SweepPlan {
    /// Derive a plan from the shared configuration
    pub fn from_config(
        config: &ProbeConfig,
        target: impl Into<String>,
        destination: Ipv4Addr,
        identifier: u16,
    ) -> Self {
        SweepPlan {
            target: target.into(),
            destination,
            identifier,
            protocol: config.protocol,
            max_hops: config.max_hops,
            retries: config.retries,
            payload: config.payload_for(config.protocol),
            mode: config.sweep_mode,
            send_interval: config.send_interval,
            resolve_hostnames: config.resolve_hostnames,
        }
    }

    fn template(&self, ttl: u8) -> ProbeRequest {
        let request = ProbeRequest::echo(self.identifier, 0, self.destination, self.payload.clone())
            .with_ttl(ttl);
        match self.protocol {
            ProbeProtocol::Icmp => request,
            ProbeProtocol::Udp => request.with_udp_port(UDP_BASE_PORT + u16::from(ttl)),
        }
    }
}

/// One TTL after its attempts ran
struct HopProbe {
    hop: HopResult,
    outcomes: Vec<Outcome>,
    cancelled: bool,
}

/// Walks the TTL range towards a destination
#[derive(Clone)]
pub struct HopSweeper {
    scheduler: ProbeScheduler,
    resolver: Arc<dyn HostResolver>,
    sink: Arc<dyn ResultSink>,
}

impl HopSweeper {
    /// Create a sweeper
    pub fn new(
        scheduler: ProbeScheduler,
        resolver: Arc<dyn HostResolver>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        HopSweeper {
            scheduler,
            resolver,
            sink,
        }
    }

    /// Run a sweep to completion, cancellation or a transport failure.
    ///
    /// Only failing to open a transport is an error; lost probes simply
    /// show up as loss.
    #[instrument(
        skip_all,
        fields(host = %plan.target, dest = %plan.destination, mode = plan.mode.description())
    )]
    pub async fn sweep(
        &self,
        plan: &SweepPlan,
        cancel: &CancellationToken,
    ) -> Result<TracerouteSession, ProbeError> {
        let sequence = AtomicU16::new(1);
        let mut session = TracerouteSession {
            destination: plan.target.clone(),
            resolved_ip: plan.destination,
            mode: plan.mode,
            protocol: plan.protocol,
            hops: Vec::new(),
            reached_destination: false,
            termination_ttl: None,
            cancelled: false,
        };

        match plan.mode {
            SweepMode::Sequential => self.sequential(plan, &sequence, cancel, &mut session).await?,
            SweepMode::Parallel => self.parallel(plan, &sequence, cancel, &mut session).await?,
        }

        debug!(
            hops = session.hops.len(),
            reached = session.reached_destination,
            cancelled = session.cancelled,
            "sweep finished"
        );
        self.sink.finish_traceroute(&session);
        Ok(session)
    }

    async fn sequential(
        &self,
        plan: &SweepPlan,
        sequence: &AtomicU16,
        cancel: &CancellationToken,
        session: &mut TracerouteSession,
    ) -> Result<(), ProbeError> {
        for ttl in 1..=plan.max_hops {
            if cancel.is_cancelled() {
                session.cancelled = true;
                break;
            }
            if ttl > 1 && !plan.send_interval.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        session.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(plan.send_interval) => {}
                }
            }

            let mut probe = self.probe_hop(plan, ttl, sequence, cancel).await?;
            if probe.outcomes.is_empty() {
                session.cancelled = true;
                break;
            }

            self.annotate(plan, &mut probe.hop).await;
            self.emit(plan, &probe);
            session.termination_ttl = Some(ttl);

            let terminal = probe.hop.is_destination(plan.destination);
            session.hops.push(probe.hop);
            if probe.cancelled {
                session.cancelled = true;
                break;
            }
            if terminal {
                session.reached_destination = true;
                break;
            }
        }
        Ok(())
    }

    async fn parallel(
        &self,
        plan: &SweepPlan,
        sequence: &AtomicU16,
        cancel: &CancellationToken,
        session: &mut TracerouteSession,
    ) -> Result<(), ProbeError> {
        let mut pending: FuturesUnordered<_> = (1..=plan.max_hops)
            .map(|ttl| self.probe_hop(plan, ttl, sequence, cancel))
            .collect();

        // Completion order is arbitrary
        let mut probes = Vec::with_capacity(usize::from(plan.max_hops));
        while let Some(result) = pending.next().await {
            let probe = result?;
            session.cancelled |= probe.cancelled;
            if !probe.outcomes.is_empty() {
                probes.push(probe);
            }
        }

        probes.sort_by_key(|p| p.hop.ttl);
        if let Some(pos) = probes
            .iter()
            .position(|p| p.hop.is_destination(plan.destination))
        {
            probes.truncate(pos + 1);
            session.reached_destination = true;
        }

        for probe in &mut probes {
            self.annotate(plan, &mut probe.hop).await;
            self.emit(plan, probe);
        }

        session.termination_ttl = probes.last().map(|p| p.hop.ttl);
        session.hops = probes.into_iter().map(|p| p.hop).collect();
        Ok(())
    }

    async fn probe_hop(
        &self,
        plan: &SweepPlan,
        ttl: u8,
        sequence: &AtomicU16,
        cancel: &CancellationToken,
    ) -> Result<HopProbe, ProbeError> {
        let report = self
            .scheduler
            .run_with_retries(
                &plan.template(ttl),
                RetryPolicy::exhaustive(plan.retries),
                cancel,
                || sequence.fetch_add(1, Ordering::Relaxed),
            )
            .await?;

        let outcomes: Vec<Outcome> = report.attempts.into_iter().map(|a| a.outcome).collect();
        let samples: Vec<f64> = outcomes.iter().filter_map(Outcome::hop_sample).collect();
        let responder = outcomes.iter().find_map(hop_responder);
        debug!(ttl, ?responder, samples = samples.len(), "hop probed");

        // Cancellation can cut a hop short; loss covers only attempts made
        let attempted = u8::try_from(outcomes.len()).unwrap_or(plan.retries);
        Ok(HopProbe {
            hop: HopResult::new(ttl, responder, samples, attempted),
            outcomes,
            cancelled: report.cancelled,
        })
    }

    /// Best-effort reverse DNS; the numeric address stands in on failure
    async fn annotate(&self, plan: &SweepPlan, hop: &mut HopResult) {
        let Some(addr) = hop.responder else {
            return;
        };
        if !plan.resolve_hostnames {
            return;
        }
        hop.hostname = Some(match self.resolver.reverse(addr).await {
            Ok(name) => name,
            Err(e) => {
                debug!(%addr, error = %e, "reverse lookup failed");
                addr.to_string()
            }
        });
    }

    fn emit(&self, plan: &SweepPlan, probe: &HopProbe) {
        for outcome in &probe.outcomes {
            let responder = outcome.responder();
            let hostname = if responder.is_some() && responder == probe.hop.responder {
                probe.hop.hostname.clone()
            } else {
                None
            };
            self.sink.record(&ProbeEvent {
                target: plan.target.clone(),
                unit: ProbeUnit::Ttl(probe.hop.ttl),
                outcome: outcome.clone(),
                responder,
                hostname,
            });
        }
    }
}

/// Address that answered a hop attempt (redirects do not count)
fn hop_responder(outcome: &Outcome) -> Option<Ipv4Addr> {
    match outcome {
        Outcome::Success { responder, .. }
        | Outcome::TtlExceeded { responder, .. }
        | Outcome::Unreachable { responder, .. } => Some(*responder),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticResolver;
    use crate::scheduler::ReceivePolicy;
    use crate::sink::CollectingSink;
    use crate::socket::sim::SimulatedNetwork;

    const DEST: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 50);
    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);

    fn sweeper(net: &SimulatedNetwork, sink: Arc<CollectingSink>) -> HopSweeper {
        let scheduler = ProbeScheduler::new(
            Arc::new(net.clone()),
            Duration::from_millis(100),
            ReceivePolicy::UntilDeadline,
        );
        let resolver = StaticResolver::new().with_ptr(A, "gw.test");
        HopSweeper::new(scheduler, Arc::new(resolver), sink)
    }

    fn plan(mode: SweepMode, protocol: ProbeProtocol, max_hops: u8, retries: u8) -> SweepPlan {
        SweepPlan {
            target: "dest.test".to_string(),
            destination: DEST,
            identifier: 0x4242,
            protocol,
            max_hops,
            retries,
            payload: b"Ping".to_vec(),
            mode,
            send_interval: Duration::ZERO,
            resolve_hostnames: true,
        }
    }

    #[tokio::test]
    async fn test_three_hop_path_sequential() {
        let net = SimulatedNetwork::new();
        net.route(DEST, [Some(A), Some(B)]);
        let sink = Arc::new(CollectingSink::new());

        let session = sweeper(&net, sink.clone())
            .sweep(
                &plan(SweepMode::Sequential, ProbeProtocol::Icmp, 30, 1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(session.reached_destination);
        assert_eq!(session.termination_ttl, Some(3));
        let responders: Vec<_> = session.hops.iter().map(|h| h.responder).collect();
        assert_eq!(responders, vec![Some(A), Some(B), Some(DEST)]);
        assert_eq!(session.hops[0].hostname.as_deref(), Some("gw.test"));
        // Failed PTR falls back to the numeric form
        assert_eq!(session.hops[1].hostname.as_deref(), Some("10.0.1.1"));
        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.traceroute_sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_cuts_after_destination() {
        let net = SimulatedNetwork::new();
        net.route(DEST, [Some(A), None, Some(B)]);
        let sink = Arc::new(CollectingSink::new());

        let session = sweeper(&net, sink.clone())
            .sweep(
                &plan(SweepMode::Parallel, ProbeProtocol::Icmp, 10, 2),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(session.reached_destination);
        let ttls: Vec<u8> = session.hops.iter().map(|h| h.ttl).collect();
        assert_eq!(ttls, vec![1, 2, 3, 4]);
        assert_eq!(session.hops[1].responder, None);
        assert_eq!(session.hops[1].loss_rate, 1.0);
        assert_eq!(session.hops[3].responder, Some(DEST));
        assert_eq!(session.termination_ttl, Some(4));
        // All ten TTLs went out, two attempts each
        assert_eq!(net.sent_probes().len(), 20);
        // Only kept hops are reported
        assert!(sink.events().iter().all(|e| matches!(e.unit, ProbeUnit::Ttl(t) if t <= 4)));
    }

    #[tokio::test]
    async fn test_unreachable_destination_runs_to_max_hops() {
        let net = SimulatedNetwork::new();
        net.black_hole(DEST, [Some(A)]);

        for mode in [SweepMode::Sequential, SweepMode::Parallel] {
            let session = sweeper(&net, Arc::new(CollectingSink::new()))
                .sweep(&plan(mode, ProbeProtocol::Icmp, 5, 1), &CancellationToken::new())
                .await
                .unwrap();
            assert!(!session.reached_destination);
            assert_eq!(session.hops.len(), 5);
            assert_eq!(session.termination_ttl, Some(5));
        }
    }

    #[tokio::test]
    async fn test_udp_sweep_uses_port_per_ttl() {
        let net = SimulatedNetwork::new();
        net.route(DEST, [Some(A)]);

        let session = sweeper(&net, Arc::new(CollectingSink::new()))
            .sweep(
                &plan(SweepMode::Sequential, ProbeProtocol::Udp, 30, 1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(session.reached_destination);
        assert_eq!(session.hops.len(), 2);
        let ports: Vec<u16> = net.sent_probes().iter().map(|p| p.destination.port()).collect();
        assert_eq!(ports, vec![40001, 40002]);
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_unique() {
        let net = SimulatedNetwork::new();
        net.route(DEST, [Some(A), Some(B)]);

        sweeper(&net, Arc::new(CollectingSink::new()))
            .sweep(&plan(SweepMode::Parallel, ProbeProtocol::Icmp, 6, 3), &CancellationToken::new())
            .await
            .unwrap();

        let mut sequences: Vec<u16> = net
            .sent_probes()
            .iter()
            .map(|p| u16::from_be_bytes([p.packet[6], p.packet[7]]))
            .collect();
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(sequences.len(), 18);
    }

    #[tokio::test]
    async fn test_hop_cut_short_counts_loss_over_attempts_made() {
        let net = SimulatedNetwork::new();
        net.route(DEST, [Some(A)]).latency(Duration::from_millis(40));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            canceller.cancel();
        });

        let session = sweeper(&net, Arc::new(CollectingSink::new()))
            .sweep(&plan(SweepMode::Sequential, ProbeProtocol::Icmp, 30, 5), &cancel)
            .await
            .unwrap();

        assert!(session.cancelled);
        assert_eq!(session.hops.len(), 1);
        let hop = &session.hops[0];
        let sent = net.sent_probes().len();
        assert!(sent > 0 && sent < 5, "sent {sent}");
        // Every attempt that ran was answered
        assert_eq!(hop.rtt_samples.len(), sent);
        assert_eq!(hop.loss_rate, 0.0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let net = SimulatedNetwork::new();
        net.route(DEST, [Some(A)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let session = sweeper(&net, Arc::new(CollectingSink::new()))
            .sweep(&plan(SweepMode::Sequential, ProbeProtocol::Icmp, 30, 1), &cancel)
            .await
            .unwrap();
        assert!(session.cancelled);
        assert!(session.hops.is_empty());
        assert!(net.sent_probes().is_empty());
    }
}
