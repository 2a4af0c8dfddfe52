//! Market Data Stream
//!
//! Connects to a market data WebSocket stream, authenticates, subscribes to
//! the configured streams and prints every message to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use marketdata_stream::config::StreamConfig;
use marketdata_stream::marketdata::MarketDataClient;

/// Market Data Stream
///
/// Prints market data stream messages as they arrive
#[derive(Parser, Debug)]
#[command(name = "marketdata-stream")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file (default: ./.marketdata/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stream endpoint URL
    #[arg(long)]
    url: Option<String>,

    /// API key ID
    #[arg(long, env = "APCA_API_KEY_ID", hide_env_values = true)]
    key_id: Option<String>,

    /// API secret key
    #[arg(long, env = "APCA_API_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Stream to listen to, e.g. T.AAPL (repeatable)
    #[arg(short, long = "stream")]
    streams: Vec<String>,

    /// Exit instead of reconnecting after an unexpected close
    #[arg(long)]
    no_reconnect: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Load the config file and apply command line overrides
    fn into_config(self) -> anyhow::Result<StreamConfig> {
        let mut config = match &self.config {
            Some(path) => StreamConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => StreamConfig::load_from_dir(&std::env::current_dir()?)?,
        };

        if let Some(url) = self.url {
            config.url = url;
        }
        if self.key_id.is_some() {
            config.key_id = self.key_id;
        }
        if self.secret_key.is_some() {
            config.secret_key = self.secret_key;
        }
        if !self.streams.is_empty() {
            config.streams = self.streams;
        }
        if self.no_reconnect {
            config.reconnect.enabled = false;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout carries the messages, so logs go to stderr
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("Market Data Stream v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config()?;
    if config.streams.is_empty() {
        warn!("No streams configured; only control messages will arrive");
    }

    let client = Arc::new(MarketDataClient::new(&config)?);

    // Print messages as they arrive
    let mut messages = client.subscribe();
    tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(message) => println!("{}", message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Output lagged, dropped {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Spawn shutdown signal handler
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        let _ = shutdown_tx.send(());
    });

    client.run_until_shutdown(shutdown_rx).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
