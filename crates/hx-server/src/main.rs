//! hepx server daemon
//!
//! Accepts control connections from hepx clients and exposes the tunnels
//! they register.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hx_core::config::{self, ServerConfig};
use hx_server::Service;

#[derive(Parser)]
#[command(name = "hxs")]
#[command(about = "hepx rendezvous server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(long)]
    bind_addr: Option<String>,

    /// Bind port (overrides config)
    #[arg(short = 'p', long)]
    bind_port: Option<u16>,

    /// Auth token (overrides config)
    #[arg(short, long)]
    token: Option<String>,

    /// Log level (error, warn, info, debug, trace); defaults to the config value
    #[arg(long)]
    log_level: Option<String>,
}

fn load(args: &Args) -> Result<ServerConfig> {
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_server_config_path();
        if default_path.exists() {
            config::load_config(&default_path)
                .with_context(|| format!("Failed to load config from {:?}", default_path))?
        } else {
            ServerConfig::default()
        }
    };

    if let Some(addr) = &args.bind_addr {
        config.bind_addr = addr.clone();
    }
    if let Some(port) = args.bind_port {
        config.bind_port = port;
    }
    if let Some(token) = &args.token {
        config.auth.token = token.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    config.validate().context("Invalid server configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load(&args)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("hxs {} starting...", env!("CARGO_PKG_VERSION"));
    if config.auth.token.is_empty() {
        tracing::warn!("No auth token configured - any client can log in");
    }

    let service = Arc::new(Service::new(config));
    let listener = service.bind().await.context("Failed to bind control port")?;

    let cancel = service.cancel_token();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });

    service.run(listener).await?;
    service.close().await;

    tracing::info!("hxs shutdown complete");
    Ok(())
}
