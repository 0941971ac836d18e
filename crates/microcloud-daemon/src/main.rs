//! microcloudd: Per-host cluster trust-establishment daemon.
//!
//! Runs the session engine behind a TLS listener for peers and a Unix
//! control socket for the interactive front-end.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use microcloud_core::ServiceType;
use microcloud_daemon::{Daemon, DaemonConfig, DEFAULT_PORT};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "microcloudd")]
#[command(about = "Cluster trust-establishment daemon")]
struct Args {
    /// This node's name
    #[arg(long, env = "MICROCLOUD_NAME")]
    name: String,

    /// Address advertised to peers (host or host:port)
    #[arg(long, env = "MICROCLOUD_ADDRESS")]
    address: String,

    /// Bind address of the TLS listener
    #[arg(long, default_value = "0.0.0.0")]
    listen: String,

    /// Port of the TLS listener
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// State directory (server identity, control socket)
    #[arg(long, env = "MICROCLOUD_STATE_DIR", default_value = "/var/lib/microcloud")]
    state_dir: PathBuf,

    /// Control socket path (defaults to <state-dir>/control.socket)
    #[arg(long)]
    unix_socket: Option<PathBuf>,

    /// Additional service offered by this member (repeatable)
    #[arg(long = "service", value_name = "TYPE")]
    services: Vec<ServiceType>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,microcloud_daemon=debug"
    } else {
        "info,microcloud_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting microcloudd");
    info!("Node name: {}", args.name);
    info!("Advertised address: {}", args.address);

    let mut config = DaemonConfig::new(args.name, args.address, args.state_dir);
    config.listen = args.listen;
    config.port = args.port;
    config.unix_socket = args.unix_socket;
    config.services = args.services;

    let daemon = Daemon::spawn(config).await?;

    info!("Daemon running. Press Ctrl+C to stop.");
    shutdown_signal().await;

    info!("Shutting down");
    daemon.shutdown();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
