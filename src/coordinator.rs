//! Bounded worker pool over many targets
//!
//! `max_workers` tokio tasks pull targets from one shared queue. Each pop
//! yields a whole session (ping or traceroute), so at most `max_workers`
//! sessions run at once. Cancellation is polled between pops; a session
//! already underway notices it through its own checks.

use crate::config::ProbeConfig;
use crate::dns::{HickoryResolver, HostResolver};
use crate::error::ProbeError;
use crate::ping::{PingPlan, PingSession, Pinger};
use crate::scheduler::ProbeScheduler;
use crate::sink::{ResultSink, TracingSink};
use crate::socket::factory::SystemTransportFactory;
use crate::socket::TransportFactory;
use crate::traceroute::{HopSweeper, SweepPlan, TracerouteSession};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Hands out ICMP identifiers, one per session
///
/// Seeded from the process id so that concurrent processes on one host are
/// unlikely to collide.
#[derive(Debug)]
pub struct IdentifierAllocator {
    next: AtomicU16,
}

impl IdentifierAllocator {
    /// Start counting at `seed`
    pub fn new(seed: u16) -> Self {
        IdentifierAllocator {
            next: AtomicU16::new(seed),
        }
    }

    /// Seed from the current process id
    pub fn from_process() -> Self {
        Self::new((std::process::id() % u32::from(u16::MAX)) as u16)
    }

    /// Next identifier; wraps at `u16::MAX`
    pub fn allocate(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdentifierAllocator {
    fn default() -> Self {
        Self::from_process()
    }
}

/// Outcome of one target, in input order
pub type TargetResult<S> = (String, Result<S, ProbeError>);

/// State a worker needs to run one session
#[derive(Clone)]
struct Worker {
    config: Arc<ProbeConfig>,
    scheduler: ProbeScheduler,
    resolver: Arc<dyn HostResolver>,
    sink: Arc<dyn ResultSink>,
    ids: Arc<IdentifierAllocator>,
    cancel: CancellationToken,
}

impl Worker {
    async fn ping(&self, target: &str) -> Result<PingSession, ProbeError> {
        let destination = self.resolver.resolve_ipv4(target).await?;
        let plan = PingPlan::from_config(&self.config, target, destination, self.ids.allocate());
        Pinger::new(self.scheduler.clone(), Arc::clone(&self.sink))
            .run(&plan, &self.cancel)
            .await
    }

    async fn trace(&self, target: &str) -> Result<TracerouteSession, ProbeError> {
        let destination = self.resolver.resolve_ipv4(target).await?;
        let plan = SweepPlan::from_config(&self.config, target, destination, self.ids.allocate());
        HopSweeper::new(
            self.scheduler.clone(),
            Arc::clone(&self.resolver),
            Arc::clone(&self.sink),
        )
        .sweep(&plan, &self.cancel)
        .await
    }
}

/// Runs sessions for every configured target
pub struct Coordinator {
    config: Arc<ProbeConfig>,
    factory: Arc<dyn TransportFactory>,
    resolver: Arc<dyn HostResolver>,
    sink: Arc<dyn ResultSink>,
    ids: Arc<IdentifierAllocator>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Create a coordinator over `factory`
    ///
    /// Fails when the configuration does not validate.
    pub fn new(
        config: ProbeConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, ProbeError> {
        config.validate()?;
        Ok(Coordinator {
            config: Arc::new(config),
            factory,
            resolver: Arc::new(HickoryResolver::new()),
            sink: Arc::new(TracingSink),
            ids: Arc::new(IdentifierAllocator::from_process()),
            cancel: CancellationToken::new(),
        })
    }

    /// Coordinator using real sockets
    pub fn system(config: ProbeConfig) -> Result<Self, ProbeError> {
        Self::new(config, Arc::new(SystemTransportFactory::new()))
    }

    /// Replace the resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the result sink
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the identifier allocator
    pub fn with_identifiers(mut self, ids: Arc<IdentifierAllocator>) -> Self {
        self.ids = ids;
        self
    }

    /// Token that stops every session this coordinator runs
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Configuration in use
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Ping every target
    #[instrument(
        skip_all,
        fields(targets = self.config.targets.len(), workers = self.config.max_workers)
    )]
    pub async fn ping_all(&self) -> Vec<TargetResult<PingSession>> {
        self.run_all(|worker, target| async move { worker.ping(&target).await })
            .await
    }

    /// Trace the path to every target
    #[instrument(
        skip_all,
        fields(targets = self.config.targets.len(), workers = self.config.max_workers)
    )]
    pub async fn trace_all(&self) -> Vec<TargetResult<TracerouteSession>> {
        self.run_all(|worker, target| async move { worker.trace(&target).await })
            .await
    }

    /// Ping a single target outside the pool
    pub async fn ping(&self, target: &str) -> Result<PingSession, ProbeError> {
        self.worker().ping(target).await
    }

    /// Trace a single target outside the pool
    pub async fn trace(&self, target: &str) -> Result<TracerouteSession, ProbeError> {
        self.worker().trace(target).await
    }

    fn worker(&self) -> Worker {
        Worker {
            config: Arc::clone(&self.config),
            scheduler: ProbeScheduler::new(
                Arc::clone(&self.factory),
                self.config.timeout,
                self.config.receive_policy,
            ),
            resolver: Arc::clone(&self.resolver),
            sink: Arc::clone(&self.sink),
            ids: Arc::clone(&self.ids),
            cancel: self.cancel.clone(),
        }
    }

    /// Drain the target queue with a bounded number of tasks.
    ///
    /// Targets never popped because of cancellation are left out of the
    /// result; everything else appears in input order.
    async fn run_all<S, F, Fut>(&self, job: F) -> Vec<TargetResult<S>>
    where
        S: Send + 'static,
        F: Fn(Worker, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, ProbeError>> + Send + 'static,
    {
        let targets = &self.config.targets;
        let queue: Arc<Mutex<VecDeque<(usize, String)>>> = Arc::new(Mutex::new(
            targets.iter().cloned().enumerate().collect(),
        ));
        let slots: Arc<Mutex<Vec<Option<TargetResult<S>>>>> =
            Arc::new(Mutex::new((0..targets.len()).map(|_| None).collect()));
        let job = Arc::new(job);

        let workers = self.config.max_workers.min(targets.len());
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let queue = Arc::clone(&queue);
            let slots = Arc::clone(&slots);
            let job = Arc::clone(&job);
            let worker = self.worker();

            handles.push(tokio::spawn(async move {
                loop {
                    if worker.cancel.is_cancelled() {
                        debug!(worker_id, "cancelled, stopping");
                        break;
                    }
                    let next = queue.lock().expect("mutex poisoned").pop_front();
                    let Some((index, target)) = next else {
                        break;
                    };

                    debug!(worker_id, %target, "session started");
                    // Stands in for a panicked session; only reachable when
                    // panics unwind, as in test builds
                    slots.lock().expect("mutex poisoned")[index] = Some((
                        target.clone(),
                        Err(ProbeError::Worker("session did not complete".to_string())),
                    ));
                    let result = job(worker.clone(), target.clone()).await;
                    if let Err(e) = &result {
                        warn!(worker_id, %target, error = %e, "session failed");
                    }
                    slots.lock().expect("mutex poisoned")[index] = Some((target, result));
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task failed");
            }
        }

        let mut slots = slots.lock().expect("mutex poisoned");
        slots.drain(..).flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::StaticResolver;
    use crate::probe::Outcome;
    use crate::sink::CollectingSink;
    use crate::socket::sim::SimulatedNetwork;
    use crate::socket::TransportError;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn hosts(n: u8) -> Vec<(String, Ipv4Addr)> {
        (1..=n)
            .map(|i| (format!("host{i}.test"), Ipv4Addr::new(198, 51, 100, i)))
            .collect()
    }

    fn coordinator(
        net: &SimulatedNetwork,
        config: ProbeConfig,
        resolver: StaticResolver,
    ) -> Coordinator {
        Coordinator::new(config, Arc::new(net.clone()))
            .unwrap()
            .with_resolver(Arc::new(resolver))
            .with_sink(Arc::new(CollectingSink::new()))
    }

    #[test]
    fn test_identifiers_are_distinct() {
        let ids = IdentifierAllocator::new(u16::MAX);
        assert_eq!(ids.allocate(), u16::MAX);
        assert_eq!(ids.allocate(), 0);
        assert_eq!(ids.allocate(), 1);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let net = SimulatedNetwork::new();
        let err = Coordinator::new(ProbeConfig::default(), Arc::new(net)).err().unwrap();
        assert!(matches!(err, ProbeError::Config(_)));
    }

    #[tokio::test]
    async fn test_panicked_session_reports_worker_error() {
        let config = ProbeConfig::builder()
            .targets(["good.test", "bad.test"])
            .max_workers(2)
            .build()
            .unwrap();
        let net = SimulatedNetwork::new();
        let results = coordinator(&net, config, StaticResolver::new())
            .run_all(|_, target| async move {
                if target == "bad.test" {
                    panic!("session blew up");
                }
                Ok(target.len())
            })
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "good.test");
        assert_eq!(results[0].1.as_ref().ok(), Some(&9));
        assert_eq!(results[1].0, "bad.test");
        assert!(matches!(&results[1].1, Err(ProbeError::Worker(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_never_exceeds_max_workers() {
        let net = SimulatedNetwork::new();
        net.latency(Duration::from_millis(20));
        let mut resolver = StaticResolver::new();
        for (name, addr) in hosts(6) {
            net.route(addr, []);
            resolver = resolver.with_host(name, addr);
        }

        let config = ProbeConfig::builder()
            .targets(hosts(6).into_iter().map(|(name, _)| name))
            .count(2)
            .retries(1)
            .max_workers(2)
            .interval(Duration::ZERO)
            .build()
            .unwrap();

        let results = coordinator(&net, config, resolver).ping_all().await;

        assert_eq!(results.len(), 6);
        let names: Vec<&str> = results.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "host1.test",
                "host2.test",
                "host3.test",
                "host4.test",
                "host5.test",
                "host6.test"
            ]
        );
        assert!(results
            .iter()
            .all(|(_, r)| r.as_ref().is_ok_and(|s| s.summary.received == 2)));
        assert!(net.peak_open_transports() <= 2);
        assert_eq!(net.open_transports(), 0);

        let mut ids: Vec<u16> = results
            .iter()
            .map(|(_, r)| r.as_ref().map(|s| s.identifier).unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 6);
    }

    #[tokio::test]
    async fn test_failed_target_does_not_abort_others() {
        let net = SimulatedNetwork::new();
        let good = Ipv4Addr::new(198, 51, 100, 1);
        net.route(good, []);

        let config = ProbeConfig::builder()
            .targets(["nowhere.test", "198.51.100.1"])
            .count(1)
            .retries(1)
            .build()
            .unwrap();

        let results = coordinator(&net, config, StaticResolver::new()).ping_all().await;

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0].1, Err(ProbeError::Resolution(_))));
        let session = results[1].1.as_ref().unwrap();
        assert!(matches!(session.samples[0], Outcome::Success { .. }));
    }

    #[tokio::test]
    async fn test_permission_error_surfaces_per_target() {
        let net = SimulatedNetwork::new();
        net.route(Ipv4Addr::new(198, 51, 100, 1), []).deny_raw_sockets(true);

        let config = ProbeConfig::builder()
            .target("198.51.100.1")
            .build()
            .unwrap();

        let results = coordinator(&net, config, StaticResolver::new()).trace_all().await;
        assert!(matches!(
            results[0].1,
            Err(ProbeError::Transport(TransportError::InsufficientPermissions { .. }))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let net = SimulatedNetwork::new();
        let config = ProbeConfig::builder()
            .targets(["198.51.100.1", "198.51.100.2"])
            .build()
            .unwrap();
        let coordinator = coordinator(&net, config, StaticResolver::new());
        coordinator.cancellation_token().cancel();

        assert!(coordinator.trace_all().await.is_empty());
        assert!(net.sent_probes().is_empty());
    }

    #[tokio::test]
    async fn test_trace_all_reaches_each_destination() {
        let net = SimulatedNetwork::new();
        let router = Ipv4Addr::new(10, 0, 0, 1);
        net.route(Ipv4Addr::new(198, 51, 100, 1), [Some(router)]);
        net.route(Ipv4Addr::new(198, 51, 100, 2), [Some(router), None]);

        let config = ProbeConfig::builder()
            .targets(["198.51.100.1", "198.51.100.2"])
            .retries(1)
            .send_interval(Duration::ZERO)
            .build()
            .unwrap();

        let results = coordinator(&net, config, StaticResolver::new()).trace_all().await;
        let hops: Vec<usize> = results
            .iter()
            .map(|(_, r)| r.as_ref().unwrap().hops.len())
            .collect();
        assert_eq!(hops, vec![2, 3]);
    }
}
