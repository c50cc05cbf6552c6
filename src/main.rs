//! agent-bridge: session bridge for agent runtimes

use agent_bridge::{BridgeConfig, Cli, ProcessRuntime, Server, Transport};
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = BridgeConfig::from(Cli::parse());

    // Initialize logging. stdout carries the wire protocol.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(config).await {
        error!("{}", e);
        std::process::exit(1);
    }
    // The stdin reader blocks on a runtime thread that dropping the runtime
    // would wait for. Output and the traffic log are already flushed.
    std::process::exit(0);
}

async fn run(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Arc::new(ProcessRuntime::new(config.runtime));
    let server = Server::new(runtime, config.server);
    spawn_signal_handler(server.shutdown_token())?;

    match config.transport {
        Transport::Stdio => server.serve_stdio().await?,
        Transport::Socket(path) => server.serve_socket(&path).await?,
    }
    Ok(())
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) -> std::io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
        shutdown.cancel();
    });
    Ok(())
}
