use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mping::cli::Args;
use mping::config::Config;
use mping::ping::{ProbeEngine, StatsReporter, spawn_receiver};
use mping::probe::{ProbeSocket, SocketOptions, find_default_interface, validate_interface};
use mping::state::Session;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise logging (RUST_LOG=debug etc.)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let config = Config::from(&args);
    if config.packet_size != args.size {
        warn!(
            requested = args.size,
            size = config.packet_size,
            "Packet size raised to fit the probe header"
        );
    }

    let targets = resolve_targets(&args.targets);
    if targets.is_empty() {
        anyhow::bail!("No valid targets specified");
    }

    // Interface: explicit name is validated and bound, otherwise one must exist
    let interface = match config.interface {
        Some(ref name) => Some(validate_interface(name)?),
        None => {
            let info = find_default_interface().context("No usable network interface")?;
            info!(interface = %info.name, address = %info.ipv4, "Using default interface");
            None
        }
    };

    let socket = ProbeSocket::open(&SocketOptions {
        read_timeout: config.timeout,
        write_timeout: config.timeout,
        tos: config.tos,
        interface,
    })
    .context("Failed to open ICMP socket")?;
    let socket = Arc::new(socket);

    let session = Arc::new(Session::new(config, targets)?);
    info!(
        targets = session.targets().len(),
        identifier = session.identifier,
        size = session.config.packet_size,
        rate = session.config.rate,
        timestamps = %socket.timestamp_mode(),
        dgram = socket.is_dgram(),
        "Probing {}",
        session
            .targets()
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let receiver_handle = spawn_receiver(session.clone(), socket.clone(), cancel.clone());
    let reporter_handle =
        tokio::spawn(StatsReporter::new(session.clone(), cancel.clone()).run());

    let engine = ProbeEngine::new(session.clone(), socket, cancel.clone());
    let summary = engine.run().await;
    // Stop the other roles however the sender ended
    cancel.cancel();

    reporter_handle.await??;
    let received = receiver_handle.join().map_err(|e| {
        // This branch shouldn't be reached since we use catch_unwind in the receiver,
        // but handle it just in case something panics outside the protected region
        let msg = e
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| e.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        anyhow::anyhow!("Receiver thread failed: {}", msg)
    })??;

    let summary = summary?;
    info!(
        rounds = summary.rounds,
        sent = summary.sent,
        failed = summary.failed,
        received,
        "Done"
    );
    Ok(())
}

/// Resolve target strings to unique IPv4 addresses, skipping bad entries
fn resolve_targets(inputs: &[String]) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for input in inputs.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        match resolve_target(input) {
            Ok(addr) => {
                if !seen.insert(addr) {
                    warn!(target_name = input, %addr, "Duplicate target, skipping");
                    continue;
                }
                targets.push(addr);
            }
            Err(e) => warn!(target_name = input, error = %e, "Invalid target, skipping"),
        }
    }

    targets
}

fn resolve_target(target: &str) -> Result<Ipv4Addr> {
    // Try parsing as IP address first
    if let Ok(ip) = target.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => anyhow::bail!("IPv6 targets are not supported"),
        };
    }

    // Resolve hostname
    let addr = format!("{}:0", target)
        .to_socket_addrs()?
        .find_map(|s| match s.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        });

    addr.ok_or_else(|| anyhow::anyhow!("No IPv4 addresses found for hostname"))
}
