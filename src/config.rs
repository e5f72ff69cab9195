//! Configuration for ping and traceroute sessions

use crate::scheduler::ReceivePolicy;
use crate::socket::ProbeProtocol;
use crate::traceroute::SweepMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Per-attempt receive timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
/// Ping sequences per target
pub const DEFAULT_COUNT: u16 = 4;
/// Highest TTL a sweep probes
pub const DEFAULT_MAX_HOPS: u8 = 30;
/// Attempts per ping sequence or traceroute hop
pub const DEFAULT_RETRIES: u8 = 3;
/// Targets processed concurrently
pub const DEFAULT_MAX_WORKERS: usize = 8;
/// Pause between ping sequences
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
/// Pause between hops of a sequential sweep
pub const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(5);
/// UDP probes go to `UDP_BASE_PORT + ttl`
pub const UDP_BASE_PORT: u16 = 40000;
/// Echo payload when none is configured
pub const DEFAULT_ICMP_PAYLOAD: &[u8] = b"Ping";
/// Length of the random UDP payload when none is configured
pub const DEFAULT_UDP_PAYLOAD_LEN: usize = 32;
/// Largest payload that fits a 1500-byte MTU behind IPv4 and ICMP/UDP headers
pub const MAX_PAYLOAD_LEN: usize = 1472;

/// Invalid configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Configuration shared by every session a coordinator runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Target hostnames or IPv4 addresses
    pub targets: Vec<String>,
    /// Timeout for individual attempts (default: 1s)
    pub timeout: Duration,
    /// Number of ping sequences per target (default: 4)
    pub count: u16,
    /// Maximum number of hops (default: 30)
    pub max_hops: u8,
    /// Attempts per ping sequence or per hop (default: 3)
    pub retries: u8,
    /// Protocol for traceroute probes; ping always uses ICMP
    pub protocol: ProbeProtocol,
    /// Upper bound on concurrently probed targets (default: 8)
    pub max_workers: usize,
    /// Sequential or parallel TTL sweep
    pub sweep_mode: SweepMode,
    /// Probe payload; `None` picks a per-protocol default
    pub payload: Option<Vec<u8>>,
    /// How long an attempt keeps reading after unrelated traffic
    pub receive_policy: ReceivePolicy,
    /// Pause between ping sequences (default: 1s)
    pub interval: Duration,
    /// Pause between hops of a sequential sweep (default: 5ms)
    pub send_interval: Duration,
    /// Enable reverse DNS lookups of hop responders (default: true)
    pub resolve_hostnames: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            count: DEFAULT_COUNT,
            max_hops: DEFAULT_MAX_HOPS,
            retries: DEFAULT_RETRIES,
            protocol: ProbeProtocol::Icmp,
            max_workers: DEFAULT_MAX_WORKERS,
            sweep_mode: SweepMode::Sequential,
            payload: None,
            receive_policy: ReceivePolicy::UntilDeadline,
            interval: DEFAULT_INTERVAL,
            send_interval: DEFAULT_SEND_INTERVAL,
            resolve_hostnames: true,
        }
    }
}

impl ProbeConfig {
    /// Create a new ProbeConfig builder
    pub fn builder() -> ProbeConfigBuilder {
        ProbeConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError(msg.to_string()));

        if self.targets.is_empty() {
            return fail("at least one target must be specified");
        }
        if self.targets.iter().any(|t| t.trim().is_empty()) {
            return fail("targets must not be empty strings");
        }
        if self.timeout.is_zero() {
            return fail("timeout must be greater than 0");
        }
        if self.count < 1 {
            return fail("count must be at least 1");
        }
        if self.max_hops < 1 {
            return fail("max_hops must be at least 1");
        }
        if self.retries < 1 {
            return fail("retries must be at least 1");
        }
        if self.max_workers < 1 {
            return fail("max_workers must be at least 1");
        }
        if self.payload.as_ref().is_some_and(|p| p.len() > MAX_PAYLOAD_LEN) {
            return Err(ConfigError(format!(
                "payload must be at most {MAX_PAYLOAD_LEN} bytes"
            )));
        }
        Ok(())
    }

    /// Payload for ICMP echo probes
    pub fn icmp_payload(&self) -> Vec<u8> {
        self.payload
            .clone()
            .unwrap_or_else(|| DEFAULT_ICMP_PAYLOAD.to_vec())
    }

    /// Payload for UDP probes; random when not configured
    pub fn udp_payload(&self) -> Vec<u8> {
        self.payload.clone().unwrap_or_else(|| {
            let mut payload = vec![0u8; DEFAULT_UDP_PAYLOAD_LEN];
            rand::fill(&mut payload[..]);
            payload
        })
    }

    /// Payload for probes of `protocol`
    pub fn payload_for(&self, protocol: ProbeProtocol) -> Vec<u8> {
        match protocol {
            ProbeProtocol::Icmp => self.icmp_payload(),
            ProbeProtocol::Udp => self.udp_payload(),
        }
    }
}

/// Builder for ProbeConfig
pub struct ProbeConfigBuilder {
    config: ProbeConfig,
}

impl ProbeConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: ProbeConfig::default(),
        }
    }

    /// Add one target hostname or IP address
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.config.targets.push(target.into());
        self
    }

    /// Replace the target list
    pub fn targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-attempt timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the number of ping sequences
    pub fn count(mut self, count: u16) -> Self {
        self.config.count = count;
        self
    }

    /// Set the maximum number of hops
    pub fn max_hops(mut self, hops: u8) -> Self {
        self.config.max_hops = hops;
        self
    }

    /// Set the attempts per sequence or hop
    pub fn retries(mut self, retries: u8) -> Self {
        self.config.retries = retries;
        self
    }

    /// Set the traceroute protocol
    pub fn protocol(mut self, protocol: ProbeProtocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    /// Set the worker pool size
    pub fn max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = workers;
        self
    }

    /// Set the sweep mode
    pub fn sweep_mode(mut self, mode: SweepMode) -> Self {
        self.config.sweep_mode = mode;
        self
    }

    /// Set the probe payload
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.config.payload = Some(payload.into());
        self
    }

    /// Set the receive policy
    pub fn receive_policy(mut self, policy: ReceivePolicy) -> Self {
        self.config.receive_policy = policy;
        self
    }

    /// Set the pause between ping sequences
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the pause between hops of a sequential sweep
    pub fn send_interval(mut self, interval: Duration) -> Self {
        self.config.send_interval = interval;
        self
    }

    /// Enable or disable reverse DNS lookups
    pub fn resolve_hostnames(mut self, enable: bool) -> Self {
        self.config.resolve_hostnames = enable;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<ProbeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ProbeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
