mod config;
mod registry;
mod relay;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use trench_core::SignalResult;

use config::ServerConfig;
use registry::ConnectionRegistry;
use relay::RelayHandler;

/// Signaling relay server for trench voice sessions.
#[derive(Parser, Debug)]
#[command(name = "trench-server", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind to
    #[arg(short, long)]
    bind: Option<String>,

    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> SignalResult<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::load(cli.config.as_deref(), cli.port, cli.bind.as_deref())?;
    let addr = config.socket_addr()?;

    let registry = Arc::new(ConnectionRegistry::new());
    let relay = Arc::new(RelayHandler::new(registry));

    tokio::select! {
        result = ws::run(addr, relay, config.queue_depth) => {
            if let Err(e) = &result {
                error!(error = %e, "listener terminated");
            }
            result
        }
        _ = shutdown_signal() => {
            info!("shutting down");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
