//! Deterministic in-memory network
//!
//! `SimulatedNetwork` is a [`TransportFactory`] whose transports answer
//! probes with replies fabricated by the packet codec, exactly as routers
//! and hosts on a real path would: routers answer an expiring TTL with Time
//! Exceeded quoting the probe, the destination answers ICMP with an Echo
//! Reply and UDP with Port Unreachable. It makes sessions testable without
//! privileges or a network.

use super::{ProbeProtocol, ProbeTransport, TransportError, TransportFactory};
use crate::packet::codec::{
    build_echo_reply, build_icmp_error, build_ipv4_datagram, build_udp_datagram,
};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_UDP: u8 = 17;
const DEFAULT_TTL: u8 = 64;
const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// A probe as it left a simulated transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentProbe {
    /// Destination address and port
    pub destination: SocketAddrV4,
    /// Protocol of the transport that sent it
    pub protocol: ProbeProtocol,
    /// TTL set on the transport, if any
    pub ttl: Option<u8>,
    /// Bytes handed to `send`
    pub packet: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
struct Route {
    routers: Vec<Option<Ipv4Addr>>,
    reachable: bool,
    drop_remaining: usize,
    noise: bool,
    redirect_via: Option<Ipv4Addr>,
    unreachable_code: Option<u8>,
}

#[derive(Debug)]
struct Inner {
    local: Ipv4Addr,
    routes: Mutex<HashMap<Ipv4Addr, Route>>,
    sent: Mutex<Vec<SentProbe>>,
    deny_raw: AtomicBool,
    latency: Mutex<Duration>,
    open_now: AtomicUsize,
    open_peak: AtomicUsize,
    opened_total: AtomicUsize,
    next_port: AtomicU16,
}

/// Scriptable network of routers and hosts living in memory
#[derive(Debug, Clone)]
pub struct SimulatedNetwork {
    inner: Arc<Inner>,
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedNetwork {
    /// Source address of every simulated probe
    pub const LOCAL_ADDR: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

    /// Create an empty network; unknown destinations never answer
    pub fn new() -> Self {
        SimulatedNetwork {
            inner: Arc::new(Inner {
                local: Self::LOCAL_ADDR,
                routes: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
                deny_raw: AtomicBool::new(false),
                latency: Mutex::new(Duration::ZERO),
                open_now: AtomicUsize::new(0),
                open_peak: AtomicUsize::new(0),
                opened_total: AtomicUsize::new(0),
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            }),
        }
    }

    /// Add a reachable destination behind `routers`
    ///
    /// A `None` router never answers. The destination itself answers at
    /// TTL `routers.len() + 1` and above.
    pub fn route<I>(&self, destination: Ipv4Addr, routers: I) -> &Self
    where
        I: IntoIterator<Item = Option<Ipv4Addr>>,
    {
        self.set_route(destination, routers, true)
    }

    /// Add a destination that is never reached: only `routers` answer
    pub fn black_hole<I>(&self, destination: Ipv4Addr, routers: I) -> &Self
    where
        I: IntoIterator<Item = Option<Ipv4Addr>>,
    {
        self.set_route(destination, routers, false)
    }

    /// Silently drop the next `count` probes sent to `destination`
    pub fn drop_first(&self, destination: Ipv4Addr, count: usize) -> &Self {
        self.with_route(destination, |route| route.drop_remaining = count)
    }

    /// Precede every reply from `destination` with background traffic:
    /// a truncated datagram, an echo reply for another identifier and an
    /// ICMP timestamp request
    pub fn inject_noise(&self, destination: Ipv4Addr) -> &Self {
        self.with_route(destination, |route| route.noise = true)
    }

    /// Precede every reply from `destination` with a host Redirect
    pub fn redirect_via(&self, destination: Ipv4Addr, gateway: Ipv4Addr) -> &Self {
        self.with_route(destination, |route| route.redirect_via = Some(gateway))
    }

    /// Make the last router answer with Destination Unreachable `code`
    /// instead of forwarding to the destination
    pub fn unreachable(&self, destination: Ipv4Addr, code: u8) -> &Self {
        self.with_route(destination, |route| route.unreachable_code = Some(code))
    }

    /// Delay every delivered reply by `latency`
    pub fn latency(&self, latency: Duration) -> &Self {
        *self.inner.latency.lock().expect("mutex poisoned") = latency;
        self
    }

    /// Refuse to open transports, as an unprivileged host would
    pub fn deny_raw_sockets(&self, deny: bool) -> &Self {
        self.inner.deny_raw.store(deny, Ordering::SeqCst);
        self
    }

    /// Every probe sent so far, in send order
    pub fn sent_probes(&self) -> Vec<SentProbe> {
        self.inner.sent.lock().expect("mutex poisoned").clone()
    }

    /// Highest number of transports that were open at the same time
    pub fn peak_open_transports(&self) -> usize {
        self.inner.open_peak.load(Ordering::SeqCst)
    }

    /// Number of transports currently open
    pub fn open_transports(&self) -> usize {
        self.inner.open_now.load(Ordering::SeqCst)
    }

    /// Number of transports opened since creation
    pub fn opened_transports(&self) -> usize {
        self.inner.opened_total.load(Ordering::SeqCst)
    }

    fn set_route<I>(&self, destination: Ipv4Addr, routers: I, reachable: bool) -> &Self
    where
        I: IntoIterator<Item = Option<Ipv4Addr>>,
    {
        let route = Route {
            routers: routers.into_iter().collect(),
            reachable,
            ..Route::default()
        };
        self.inner
            .routes
            .lock()
            .expect("mutex poisoned")
            .insert(destination, route);
        self
    }

    fn with_route(&self, destination: Ipv4Addr, update: impl FnOnce(&mut Route)) -> &Self {
        let mut routes = self.inner.routes.lock().expect("mutex poisoned");
        update(routes.entry(destination).or_default());
        self
    }
}

impl TransportFactory for SimulatedNetwork {
    fn open(&self, protocol: ProbeProtocol) -> Result<Box<dyn ProbeTransport>, TransportError> {
        if self.inner.deny_raw.load(Ordering::SeqCst) {
            return Err(TransportError::InsufficientPermissions {
                required: "root or CAP_NET_RAW".to_string(),
                suggestion: "Run with sudo".to_string(),
            });
        }

        let now = self.inner.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.open_peak.fetch_max(now, Ordering::SeqCst);
        self.inner.opened_total.fetch_add(1, Ordering::SeqCst);

        let local_port = match protocol {
            ProbeProtocol::Udp => Some(self.inner.next_port.fetch_add(1, Ordering::SeqCst)),
            ProbeProtocol::Icmp => None,
        };

        Ok(Box::new(SimTransport {
            net: Arc::clone(&self.inner),
            protocol,
            ttl: None,
            local_port,
            pending: VecDeque::new(),
        }))
    }
}

struct SimTransport {
    net: Arc<Inner>,
    protocol: ProbeProtocol,
    ttl: Option<u8>,
    local_port: Option<u16>,
    pending: VecDeque<Vec<u8>>,
}

impl SimTransport {
    /// The datagram as it would appear on the wire, for quoting
    fn original_datagram(&self, packet: &[u8], destination: SocketAddrV4) -> Vec<u8> {
        let local = self.net.local;
        match self.protocol {
            ProbeProtocol::Icmp => {
                build_ipv4_datagram(local, *destination.ip(), IPPROTO_ICMP, 1, packet)
            }
            ProbeProtocol::Udp => {
                let segment = build_udp_datagram(
                    local,
                    *destination.ip(),
                    self.local_port.unwrap_or(0),
                    destination.port(),
                    packet,
                );
                build_ipv4_datagram(local, *destination.ip(), IPPROTO_UDP, 1, &segment)
            }
        }
    }

    fn deliver(&mut self, from: Ipv4Addr, icmp: &[u8]) {
        let datagram = build_ipv4_datagram(from, self.net.local, IPPROTO_ICMP, DEFAULT_TTL, icmp);
        self.pending.push_back(datagram);
    }

    fn destination_reply(&self, packet: &[u8]) -> Option<Vec<u8>> {
        match self.protocol {
            ProbeProtocol::Icmp => {
                // Only echo requests are answered
                if packet.len() < 8 || packet[0] != 8 {
                    return None;
                }
                let identifier = u16::from_be_bytes([packet[4], packet[5]]);
                let sequence = u16::from_be_bytes([packet[6], packet[7]]);
                Some(build_echo_reply(identifier, sequence, &packet[8..]))
            }
            ProbeProtocol::Udp => None,
        }
    }

    fn push_noise(&mut self, from: Ipv4Addr, route: &Route, packet: &[u8], original: &[u8]) {
        if route.noise {
            self.pending.push_back(vec![0x45, 0, 0, 12]);
            self.deliver(from, &build_echo_reply(0xdead, 1, b"not ours"));
            self.deliver(from, &[13, 0, 0xf2, 0xff, 0, 0, 0, 0]);
            // Echo reply with our identifier but foreign payload
            if let Some(mut forged) = self.destination_reply(packet) {
                forged.push(0);
                self.deliver(from, &forged);
            }
        }
        if let Some(gateway) = route.redirect_via {
            self.deliver(from, &build_icmp_error(5, 1, gateway.octets(), original));
        }
    }
}

impl ProbeTransport for SimTransport {
    fn protocol(&self) -> ProbeProtocol {
        self.protocol
    }

    fn set_ttl(&mut self, ttl: u8) -> Result<(), TransportError> {
        self.ttl = Some(ttl);
        Ok(())
    }

    fn send(&mut self, packet: &[u8], destination: SocketAddrV4) -> Result<(), TransportError> {
        self.net
            .sent
            .lock()
            .expect("mutex poisoned")
            .push(SentProbe {
                destination,
                protocol: self.protocol,
                ttl: self.ttl,
                packet: packet.to_vec(),
            });

        let route = {
            let mut routes = self.net.routes.lock().expect("mutex poisoned");
            let Some(route) = routes.get_mut(destination.ip()) else {
                return Ok(());
            };
            if route.drop_remaining > 0 {
                route.drop_remaining -= 1;
                return Ok(());
            }
            route.clone()
        };

        let ttl = usize::from(self.ttl.unwrap_or(DEFAULT_TTL));
        if ttl == 0 {
            return Ok(());
        }
        let original = self.original_datagram(packet, destination);
        let path_len = route.routers.len();

        if ttl <= path_len {
            let is_last = ttl == path_len;
            if let Some(router) = route.routers[ttl - 1] {
                self.push_noise(router, &route, packet, &original);
                match route.unreachable_code {
                    Some(code) if is_last => {
                        self.deliver(router, &build_icmp_error(3, code, [0; 4], &original));
                    }
                    _ => self.deliver(router, &build_icmp_error(11, 0, [0; 4], &original)),
                }
            }
            return Ok(());
        }

        // Past the last router: either the destination or nothing at all
        if !route.reachable || route.unreachable_code.is_some() {
            return Ok(());
        }
        let target = *destination.ip();
        self.push_noise(target, &route, packet, &original);
        match self.destination_reply(packet) {
            Some(reply) => self.deliver(target, &reply),
            None => self.deliver(target, &build_icmp_error(3, 3, [0; 4], &original)),
        }
        Ok(())
    }

    fn recv(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(datagram) = self.pending.pop_front() else {
            // Nothing will ever arrive; report the timeout without waiting
            return Ok(None);
        };
        let latency = *self.net.latency.lock().expect("mutex poisoned");
        if !latency.is_zero() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if latency > remaining {
                std::thread::sleep(remaining);
                return Ok(None);
            }
            std::thread::sleep(latency);
        }
        Ok(Some(datagram))
    }

    fn local_port(&self) -> Option<u16> {
        self.local_port
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.net.open_now.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::codec::{build_echo_request as echo_probe, parse_reply};

    const DEST: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);
    const R1: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const R2: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[test]
    fn test_router_answers_time_exceeded() {
        let net = SimulatedNetwork::new();
        net.route(DEST, [Some(R1), Some(R2)]);

        let mut transport = net.open(ProbeProtocol::Icmp).unwrap();
        transport.set_ttl(2).unwrap();
        transport
            .send(&echo_probe(7, 1, b"abc"), SocketAddrV4::new(DEST, 0))
            .unwrap();

        let reply = parse_reply(&transport.recv(far_deadline()).unwrap().unwrap()).unwrap();
        assert_eq!(reply.icmp_type, 11);
        assert_eq!(reply.source, R2);
        assert_eq!(reply.quoted.unwrap().echo_request(), Some((7, 1)));
        assert!(transport.recv(far_deadline()).unwrap().is_none());
    }

    #[test]
    fn test_destination_echoes_payload() {
        let net = SimulatedNetwork::new();
        net.route(DEST, [Some(R1)]);

        let mut transport = net.open(ProbeProtocol::Icmp).unwrap();
        transport
            .send(&echo_probe(7, 3, b"Ping"), SocketAddrV4::new(DEST, 0))
            .unwrap();

        let reply = parse_reply(&transport.recv(far_deadline()).unwrap().unwrap()).unwrap();
        assert_eq!(reply.icmp_type, 0);
        assert_eq!(reply.source, DEST);
        assert_eq!((reply.identifier, reply.sequence), (7, 3));
        assert_eq!(reply.payload, b"Ping".to_vec());
    }

    #[test]
    fn test_udp_destination_port_unreachable() {
        let net = SimulatedNetwork::new();
        net.route(DEST, []);

        let mut transport = net.open(ProbeProtocol::Udp).unwrap();
        let local_port = transport.local_port().unwrap();
        transport.set_ttl(1).unwrap();
        transport.send(b"payload", SocketAddrV4::new(DEST, 40001)).unwrap();

        let reply = parse_reply(&transport.recv(far_deadline()).unwrap().unwrap()).unwrap();
        assert_eq!((reply.icmp_type, reply.icmp_code), (3, 3));
        assert_eq!(reply.quoted.unwrap().udp_ports(), Some((local_port, 40001)));
    }

    #[test]
    fn test_drop_and_silent_hops() {
        let net = SimulatedNetwork::new();
        net.route(DEST, [None]).drop_first(DEST, 1);

        let mut transport = net.open(ProbeProtocol::Icmp).unwrap();
        transport.send(&echo_probe(1, 1, b""), SocketAddrV4::new(DEST, 0)).unwrap();
        assert!(transport.recv(far_deadline()).unwrap().is_none());

        transport.set_ttl(1).unwrap();
        transport.send(&echo_probe(1, 2, b""), SocketAddrV4::new(DEST, 0)).unwrap();
        assert!(transport.recv(far_deadline()).unwrap().is_none());
        assert_eq!(net.sent_probes().len(), 2);
    }

    #[test]
    fn test_transport_accounting() {
        let net = SimulatedNetwork::new();
        let a = net.open(ProbeProtocol::Icmp).unwrap();
        let b = net.open(ProbeProtocol::Udp).unwrap();
        assert_eq!(net.open_transports(), 2);
        drop(a);
        drop(b);
        assert_eq!(net.open_transports(), 0);
        assert_eq!(net.peak_open_transports(), 2);
        assert_eq!(net.opened_transports(), 2);

        net.deny_raw_sockets(true);
        assert!(matches!(
            net.open(ProbeProtocol::Icmp),
            Err(TransportError::InsufficientPermissions { .. })
        ));
    }
}
