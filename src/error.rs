//! Error types for probing sessions

use crate::config::ConfigError;
use crate::dns::ResolveError;
use crate::socket::TransportError;
use thiserror::Error;

/// Errors that end a session
///
/// Per-attempt trouble (timeouts, malformed replies, send failures) never
/// shows up here; it is recorded as an [`Outcome`](crate::Outcome).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// A transport could not be opened
    ///
    /// Usually [`TransportError::InsufficientPermissions`]: raw sockets need
    /// root or `CAP_NET_RAW`.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The target name could not be resolved
    #[error(transparent)]
    Resolution(#[from] ResolveError),

    /// Invalid configuration provided
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker task failed before producing a result
    #[error("Worker failed: {0}")]
    Worker(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        let err: ProbeError = TransportError::SocketError("boom".into()).into();
        assert!(matches!(err, ProbeError::Transport(_)));
        assert_eq!(err.to_string(), "Failed to create socket: boom");

        let err: ProbeError = ResolveError::NoIpv4Address("v6.test".into()).into();
        assert_eq!(err.to_string(), "No IPv4 address found for v6.test");

        let err: ProbeError = ConfigError("retries must be at least 1".into()).into();
        assert!(err.to_string().contains("retries"));
    }
}
