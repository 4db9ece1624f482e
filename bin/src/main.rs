// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `dnsfwd` process: loads a configuration file, binds the
//! client-facing listen address, and runs the forwarding engine until
//! interrupted.
//!
//! Modeled on `hickory-dns.rs`'s `clap::Parser`-driven CLI and
//! `tracing-subscriber`-backed logging; the config/CLI layer here is
//! intentionally thin, since spec.md §1 keeps configuration parsing and
//! process wiring out of the core crates.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use dnsfwd_proto::clock::TokioClock;
use dnsfwd_proto::transport::{Connector, TcpConnector, UdpConnector};
use dnsfwd_server::{Forwarder, Listener};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// A DNS forwarding proxy: routes downstream queries to upstream
/// nameservers by zone and multiplexes them onto persistent connections.
#[derive(Debug, Parser)]
#[command(name = "dnsfwd", version, about)]
struct Args {
    /// Path to the TOML configuration file describing upstream servers
    /// and their zones.
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    /// Address to listen on for downstream queries, on both UDP and TCP.
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:53")]
    listen: SocketAddr,

    /// Transport used for the upstream hop; a single forwarder instance
    /// forwards every query over one transport (spec §6: "there is a UDP
    /// forwarder and a TCP forwarder").
    #[arg(long, value_enum, default_value = "udp")]
    upstream_transport: UpstreamTransport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum UpstreamTransport {
    Udp,
    Tcp,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let args = Args::parse();

    let configuration = match config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, path = %args.config.display(), "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let result = match args.upstream_transport {
        UpstreamTransport::Udp => {
            run(UdpConnector, TokioClock, configuration, args.listen, shutdown_rx).await
        }
        UpstreamTransport::Tcp => {
            run(TcpConnector, TokioClock, configuration, args.listen, shutdown_rx).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "dnsfwd exited with an error");
            ExitCode::FAILURE
        }
    }
}

/// Wires one [`Forwarder`]/[`Listener`] pair and serves UDP and TCP
/// downstream until `shutdown` fires or either accept loop errors (spec
/// §7: a bind failure fails "the whole server with `msg(\"please supply a
/// free port number\")`").
async fn run<C, CL>(
    connector: C,
    clock: CL,
    configuration: dnsfwd_proto::config::Configuration,
    listen: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> Result<(), dnsfwd_proto::Error>
where
    C: Connector,
    CL: dnsfwd_proto::clock::Clock,
{
    let forwarder = Forwarder::new(configuration, connector, clock);
    let listener = Listener::new(forwarder);

    tracing::info!(%listen, "dnsfwd listening");

    let udp = listener.serve_udp(listen, shutdown.clone());
    let tcp = listener.serve_tcp(listen, shutdown);

    tokio::try_join!(udp, tcp)?;
    Ok(())
}
