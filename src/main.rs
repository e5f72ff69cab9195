//! netprobe - concurrent ping and traceroute over raw ICMP and UDP.
//!
//! This is the command-line interface for the netprobe library.

#![allow(clippy::uninlined_format_args)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use netprobe::{
    Coordinator, HopResult, Outcome, PingSession, ProbeConfig, ProbeConfigBuilder, ProbeError,
    ProbeProtocol, ReceivePolicy, SweepMode, TargetResult, TracerouteSession, TransportError,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Get the version string for netprobe
fn get_version() -> &'static str {
    if cfg!(debug_assertions) {
        concat!(env!("CARGO_PKG_VERSION"), "-UNRELEASED")
    } else {
        env!("CARGO_PKG_VERSION")
    }
}

/// Command-line arguments for the probing tool.
#[derive(Parser, Debug)]
#[clap(
    author,
    version = get_version(),
    about = "Concurrent ICMP/UDP ping and traceroute",
    long_about = None
)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// Output one JSON document per session
    #[clap(long, global = true)]
    json: bool,

    /// Enable verbose logging (use -vv for per-probe traces)
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Maximum number of targets probed at once
    #[clap(short = 'w', long, default_value_t = 8, global = true)]
    workers: usize,

    /// Timeout for individual probes in milliseconds
    #[clap(short = 'W', long, default_value_t = 1000, global = true)]
    timeout_ms: u64,

    /// End an attempt on the first datagram received, even if unrelated
    #[clap(long, global = true)]
    single_shot: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Measure round-trip latency with ICMP echo
    Ping {
        /// Target hostnames or IPv4 addresses
        #[clap(required = true)]
        targets: Vec<String>,

        /// Number of echo requests per target
        #[clap(short, long, default_value_t = 4)]
        count: u16,

        /// Attempts per echo request
        #[clap(short, long, default_value_t = 3)]
        retries: u8,

        /// Pause between echo requests in milliseconds
        #[clap(short, long, default_value_t = 1000)]
        interval_ms: u64,

        /// Echo payload as text
        #[clap(short, long)]
        payload: Option<String>,
    },

    /// Discover the path to each target
    Trace {
        /// Target hostnames or IPv4 addresses
        #[clap(required = true)]
        targets: Vec<String>,

        /// Maximum number of hops
        #[clap(short = 'm', long, default_value_t = 30)]
        max_hops: u8,

        /// Probes per hop
        #[clap(short = 'q', long, default_value_t = 3)]
        queries: u8,

        /// Protocol to use (icmp, udp)
        #[clap(long, value_enum, default_value_t = ProtocolArg::Icmp)]
        protocol: ProtocolArg,

        /// Probe every TTL at once instead of hop by hop
        #[clap(long)]
        parallel: bool,

        /// Pause between hops of a sequential sweep in milliseconds
        #[clap(short = 'i', long, default_value_t = 5)]
        send_interval_ms: u64,

        /// Disable reverse DNS lookups
        #[clap(long)]
        no_rdns: bool,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ProtocolArg {
    Icmp,
    Udp,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create Tokio runtime");

    match runtime.block_on(async_main(args)) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// `RUST_LOG` wins over `-v`
fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "netprobe=debug",
        _ => "netprobe=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns whether every target produced a session
async fn async_main(args: Args) -> Result<bool> {
    let config = build_config(&args)?;
    if let Some(hint) = netprobe::socket::utils::privilege_hint() {
        tracing::warn!("{}", hint);
    }
    let coordinator = Coordinator::system(config)?;

    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, finishing current probes...");
            cancel.cancel();
        }
    });

    let ok = match args.command {
        Command::Ping { .. } => {
            let results = coordinator.ping_all().await;
            report(&results, args.json, display_ping)?
        }
        Command::Trace { .. } => {
            let results = coordinator.trace_all().await;
            report(&results, args.json, display_trace)?
        }
    };
    Ok(ok)
}

fn build_config(args: &Args) -> Result<ProbeConfig> {
    let mut builder = ProbeConfigBuilder::new()
        .max_workers(args.workers)
        .timeout(Duration::from_millis(args.timeout_ms));
    if args.single_shot {
        builder = builder.receive_policy(ReceivePolicy::SingleShot);
    }

    builder = match &args.command {
        Command::Ping {
            targets,
            count,
            retries,
            interval_ms,
            payload,
        } => {
            let builder = builder
                .targets(targets.iter().cloned())
                .count(*count)
                .retries(*retries)
                .interval(Duration::from_millis(*interval_ms));
            match payload {
                Some(p) => builder.payload(p.as_bytes()),
                None => builder,
            }
        }
        Command::Trace {
            targets,
            max_hops,
            queries,
            protocol,
            parallel,
            send_interval_ms,
            no_rdns,
        } => builder
            .targets(targets.iter().cloned())
            .max_hops(*max_hops)
            .retries(*queries)
            .protocol(match protocol {
                ProtocolArg::Icmp => ProbeProtocol::Icmp,
                ProtocolArg::Udp => ProbeProtocol::Udp,
            })
            .sweep_mode(if *parallel {
                SweepMode::Parallel
            } else {
                SweepMode::Sequential
            })
            .send_interval(Duration::from_millis(*send_interval_ms))
            .resolve_hostnames(!no_rdns),
    };

    Ok(builder.build()?)
}

/// Print every result; returns whether all targets succeeded
fn report<S: serde::Serialize>(
    results: &[TargetResult<S>],
    json: bool,
    display: fn(&S),
) -> Result<bool> {
    let mut all_ok = true;
    for (target, result) in results {
        match result {
            Ok(session) if json => println!("{}", serde_json::to_string(session)?),
            Ok(session) => display(session),
            Err(e) => {
                all_ok = false;
                report_error(target, e);
            }
        }
    }
    Ok(all_ok)
}

fn report_error(target: &str, error: &ProbeError) {
    match error {
        ProbeError::Transport(TransportError::InsufficientPermissions {
            required,
            suggestion,
        }) => {
            eprintln!("\n{}: Insufficient permissions", target);
            eprintln!("Required: {}", required);
            eprintln!("Suggestion: {}", suggestion);
            eprintln!(
                "\nTo run with elevated privileges: sudo {}",
                std::env::args().collect::<Vec<_>>().join(" ")
            );
        }
        ProbeError::Resolution(e) => {
            eprintln!("\n{}: {}", target, e);
            eprintln!("Please check the hostname and your network connection.");
        }
        e => eprintln!("\n{}: {}", target, e),
    }
}

fn display_ping(session: &PingSession) {
    println!("PING {} ({})", session.destination, session.resolved_ip);
    for (i, outcome) in session.samples.iter().enumerate() {
        let seq = i + 1;
        match outcome {
            Outcome::Success { rtt_ms, responder } => {
                println!("reply from {}: seq={} time={:.3} ms", responder, seq, rtt_ms);
            }
            Outcome::Unreachable { code, responder, .. } => {
                println!(
                    "from {}: seq={} {}",
                    responder,
                    seq,
                    netprobe::classify::unreachable_code_name(*code)
                );
            }
            other => println!("seq={} {}", seq, other.label()),
        }
    }

    let s = &session.summary;
    println!("--- {} ping statistics ---", session.destination);
    println!(
        "{} sent, {} received, {:.1}% loss{}",
        s.sent,
        s.received,
        s.loss_pct,
        if session.cancelled { " (interrupted)" } else { "" }
    );
    if let Some(rtt) = &s.rtt {
        println!(
            "rtt min/avg/max = {:.3}/{:.3}/{:.3} ms",
            rtt.min_ms, rtt.avg_ms, rtt.max_ms
        );
    }
    println!();
}

fn display_trace(session: &TracerouteSession) {
    println!(
        "traceroute to {} ({}), {} mode, {}",
        session.destination,
        session.resolved_ip,
        session.mode.description(),
        session.protocol.description()
    );
    for hop in &session.hops {
        println!("{}", format_hop(hop));
    }
    if session.cancelled {
        println!("(interrupted)");
    } else if !session.reached_destination {
        println!("destination not reached");
    }
    println!();
}

fn format_hop(hop: &HopResult) -> String {
    let Some(name) = hop.display_name() else {
        return format!("{:2}  *", hop.ttl);
    };
    let rtts: Vec<String> = hop
        .rtt_samples
        .iter()
        .map(|r| format!("{:.3} ms", r))
        .collect();
    format!(
        "{:2}  {}  {}  ({:.0}% loss)",
        hop.ttl,
        name,
        rtts.join("  "),
        hop.loss_pct()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_map_onto_config() {
        let args = Args::try_parse_from([
            "netprobe", "trace", "--protocol", "udp", "--parallel", "-q", "2", "-m", "12",
            "--no-rdns", "example.com",
        ])
        .unwrap();
        let config = build_config(&args).unwrap();
        assert_eq!(config.targets, vec!["example.com".to_string()]);
        assert_eq!(config.protocol, ProbeProtocol::Udp);
        assert_eq!(config.sweep_mode, SweepMode::Parallel);
        assert_eq!(config.retries, 2);
        assert_eq!(config.max_hops, 12);
        assert!(!config.resolve_hostnames);
    }

    #[test]
    fn test_ping_defaults() {
        let args = Args::try_parse_from(["netprobe", "ping", "192.0.2.1", "192.0.2.2"]).unwrap();
        let config = build_config(&args).unwrap();
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.count, 4);
        assert_eq!(config.retries, 3);
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.receive_policy, ReceivePolicy::UntilDeadline);
    }

    #[test]
    fn test_zero_count_rejected() {
        let args = Args::try_parse_from(["netprobe", "ping", "-c", "0", "192.0.2.1"]).unwrap();
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn test_format_hop() {
        let silent = HopResult::new(4, None, vec![], 3);
        assert_eq!(format_hop(&silent), " 4  *");

        let mut hop = HopResult::new(2, Some("192.0.2.1".parse().unwrap()), vec![1.5], 2);
        hop.hostname = Some("gw.example".to_string());
        assert_eq!(
            format_hop(&hop),
            " 2  gw.example (192.0.2.1)  1.500 ms  (50% loss)"
        );
    }
}
