use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use jsonrpc_proxy::config::load_config;
use jsonrpc_proxy::lifecycle::{shutdown_signal, Shutdown};
use jsonrpc_proxy::observability::{logging, metrics};
use jsonrpc_proxy::plugins::build_chain;
use jsonrpc_proxy::ProxyServer;

#[derive(Parser)]
#[command(name = "jsonrpc-proxy")]
#[command(about = "Bidirectional JSON-RPC reverse proxy", long_about = None)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override listener.bind_address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "jsonrpc-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        path = %config.listener.path,
        upstream = ?config.upstream.kind,
        targets = config.upstream.targets.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let chain = Arc::new(build_chain(&config)?);
    chain.on_start().await?;

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.trigger();
    });

    ProxyServer::new(&config, chain, shutdown).run(listener).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
