//! snaptap gRPC Server
//!
//! Serves the containerd snapshots API on a Unix domain socket, backed by a
//! directory snapshotter, and records every call to an intercept log.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use snaptap_grpc::{
    Config, DEFAULT_INTERCEPT_LOG, DEFAULT_ROOT, DEFAULT_SOCKET_PATH, LocalSnapshotter, Server,
};

/// snaptap - containerd snapshotter that records every call it serves
#[derive(Parser, Debug)]
#[command(name = "snaptap-grpc")]
#[command(about = "Snapshots gRPC server that logs every request and response")]
struct Args {
    /// Unix domain socket to listen on
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    addr: PathBuf,

    /// Storage directory
    #[arg(long, default_value = DEFAULT_ROOT)]
    root: PathBuf,

    /// Intercept log file
    #[arg(long, default_value = DEFAULT_INTERCEPT_LOG)]
    intercepts: PathBuf,

    /// Tag each request/response pair in the log with a shared call_id
    #[arg(long)]
    correlation_ids: bool,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            socket_path: args.addr,
            root: args.root,
            intercept_log: args.intercepts,
            correlation_ids: args.correlation_ids,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = Config::from(Args::parse());

    let server = Server::start(config, LocalSnapshotter::new)
        .inspect_err(|e| tracing::error!("Failed to start snapshotter: {}", e))
        .context("starting snapshotter")?;

    server.run().await.context("serving snapshots API")?;

    Ok(())
}
