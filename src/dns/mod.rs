//! Host name resolution: forward lookups for targets and best-effort
//! reverse lookups for hop responders

use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use thiserror::Error;

/// Errors from forward resolution
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The lookup itself failed
    #[error("Failed to resolve host {host}: {reason}")]
    LookupFailed {
        /// Name that was looked up
        host: String,
        /// Resolver error
        reason: String,
    },

    /// The name exists but has no IPv4 address
    #[error("No IPv4 address found for {0}")]
    NoIpv4Address(String),
}

/// Errors from reverse (PTR) lookups
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReverseDnsError {
    /// The lookup itself failed
    #[error("DNS resolution failed: {0}")]
    ResolutionError(String),

    /// No PTR record for the address
    #[error("No PTR record found")]
    NotFound,
}

/// Name resolution used by probing sessions
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolve a target name (or dotted quad) to an IPv4 address
    async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr, ResolveError>;

    /// Look up the PTR name of `addr`
    async fn reverse(&self, addr: Ipv4Addr) -> Result<String, ReverseDnsError>;
}

/// Resolver backed by hickory
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: Arc<TokioResolver>,
}

impl HickoryResolver {
    /// Create a resolver querying Cloudflare's public servers
    pub fn new() -> Self {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self::with_resolver(Arc::new(resolver))
    }

    /// Share an existing hickory resolver
    pub fn with_resolver(resolver: Arc<TokioResolver>) -> Self {
        HickoryResolver { resolver }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostResolver for HickoryResolver {
    async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr, ResolveError> {
        // Try parsing as IP first
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(ip);
        }

        let lookup = self
            .resolver
            .ipv4_lookup(host)
            .await
            .map_err(|e| ResolveError::LookupFailed {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        lookup
            .iter()
            .next()
            .map(|ipv4| ipv4.0)
            .ok_or_else(|| ResolveError::NoIpv4Address(host.to_string()))
    }

    async fn reverse(&self, addr: Ipv4Addr) -> Result<String, ReverseDnsError> {
        let lookup = self
            .resolver
            .reverse_lookup(IpAddr::V4(addr))
            .await
            .map_err(|e| ReverseDnsError::ResolutionError(e.to_string()))?;

        lookup
            .iter()
            .next()
            .map(|name| strip_root_label(name.to_string()))
            .ok_or(ReverseDnsError::NotFound)
    }
}

/// PTR answers are fully qualified; drop the trailing dot
fn strip_root_label(mut name: String) -> String {
    if name.ends_with('.') {
        name.pop();
    }
    name
}

/// Fixed table of names, for tests and offline use
///
/// Dotted quads always resolve to themselves; other names must be in the
/// table. Reverse lookups consult the same table.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Ipv4Addr>,
    names: HashMap<Ipv4Addr, String>,
}

impl StaticResolver {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `name` to `addr` in both directions
    pub fn with_host(mut self, name: impl Into<String>, addr: Ipv4Addr) -> Self {
        let name = name.into();
        self.names.entry(addr).or_insert_with(|| name.clone());
        self.hosts.insert(name, addr);
        self
    }

    /// Add a PTR name only
    pub fn with_ptr(mut self, addr: Ipv4Addr, name: impl Into<String>) -> Self {
        self.names.insert(addr, name.into());
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr, ResolveError> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(ip);
        }
        self.hosts
            .get(host)
            .copied()
            .ok_or_else(|| ResolveError::LookupFailed {
                host: host.to_string(),
                reason: "unknown host".to_string(),
            })
    }

    async fn reverse(&self, addr: Ipv4Addr) -> Result<String, ReverseDnsError> {
        self.names.get(&addr).cloned().ok_or(ReverseDnsError::NotFound)
    }
}
