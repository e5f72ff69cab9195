//! netprobe - concurrent ping and traceroute over raw ICMP and UDP
//!
//! This library provides the probing engine behind the `netprobe` binary:
//! packet encoding and decoding, per-attempt transports, reply
//! correlation, TTL sweeps and a bounded pool that runs many sessions at
//! once. Results are pushed to a [`ResultSink`]; nothing here prints.
//!
//! # Example
//!
//! ```no_run
//! use netprobe::{Coordinator, ProbeConfig};
//!
//! # async fn run() -> Result<(), netprobe::ProbeError> {
//! let config = ProbeConfig::builder()
//!     .targets(["example.com", "192.0.2.7"])
//!     .count(3)
//!     .build()?;
//!
//! let coordinator = Coordinator::system(config)?;
//! for (target, result) in coordinator.ping_all().await {
//!     match result {
//!         Ok(session) => println!("{target}: {:.1}% loss", session.summary.loss_pct),
//!         Err(e) => eprintln!("{target}: {e}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod config;
pub mod coordinator;
pub mod dns;
pub mod error;
pub mod packet;
pub mod ping;
pub mod probe;
pub mod scheduler;
pub mod sink;
pub mod socket;
pub mod stats;
pub mod traceroute;

// Re-export core types for library users
pub use config::{ConfigError, ProbeConfig, ProbeConfigBuilder};
pub use coordinator::{Coordinator, IdentifierAllocator, TargetResult};
pub use dns::{HickoryResolver, HostResolver, ResolveError, StaticResolver};
pub use error::ProbeError;
pub use ping::{PingPlan, PingSession, Pinger};
pub use probe::{Outcome, ProbeReply, ProbeRequest};
pub use scheduler::{ProbeScheduler, ReceivePolicy, RetryPolicy};
pub use sink::{
    ChannelSink, CollectingSink, ProbeEvent, ProbeUnit, ResultSink, SinkMessage, TracingSink,
};
pub use socket::factory::SystemTransportFactory;
pub use socket::sim::SimulatedNetwork;
pub use socket::{ProbeProtocol, ProbeTransport, TransportError, TransportFactory};
pub use stats::{summarize, RttStats, Summary};
pub use traceroute::{HopResult, HopSweeper, SweepMode, SweepPlan, TracerouteSession};
