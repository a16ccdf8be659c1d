//! kinlink-relay binary entry point.
//!
//! Usage:
//! ```bash
//! kinlink-relay --config relay.toml
//! kinlink-relay --bind 127.0.0.1:9000
//! kinlink-relay --help
//! ```

use anyhow::Context;
use clap::Parser;
use kinlink_relay::cleanup::spawn_cleanup_task;
use kinlink_relay::config::Config;
use kinlink_relay::http::{self, health};
use kinlink_relay::server::LinkRelay;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Pairing-gated WebSocket relay for guardian and elder devices.
#[derive(Debug, Parser)]
#[command(name = "kinlink-relay", version, about, long_about = None)]
struct Cli {
    /// Configuration file; defaults are used if it does not exist
    #[arg(long, default_value = "relay.toml")]
    config: PathBuf,

    /// Override `server.bind_address`
    #[arg(long)]
    bind: Option<String>,
}

fn load_config(cli: &Cli) -> kinlink_relay::error::Result<Config> {
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        tracing::warn!("{} not found; using default configuration", cli.config.display());
        Config::default()
    };

    if let Some(bind) = &cli.bind {
        config.server.bind_address = bind.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kinlink_relay=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let relay = LinkRelay::open(config.clone())
        .await
        .with_context(|| format!("opening {}", config.storage.database.display()))?;
    let relay = Arc::new(relay);
    health::init_start_time();

    let cleanup = spawn_cleanup_task(
        relay.storage_arc(),
        relay.rate_limits().clone(),
        config.cleanup.clone(),
    );

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("binding {}", config.server.bind_address))?;
    tracing::info!(
        "kinlink-relay v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?
    );

    let signal_relay = relay.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl+C; shutting down");
                signal_relay.shutdown();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    http::serve(listener, relay.clone()).await?;

    cleanup.abort();
    relay.storage().close().await;
    tracing::info!("kinlink-relay stopped");
    Ok(())
}
