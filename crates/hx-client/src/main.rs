//! hepx client daemon
//!
//! Connects to a hepx server and exposes the local services named in its
//! configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hx_client::Service;
use hx_core::config::{self, ClientConfig};
use hx_core::nathole;

#[derive(Parser)]
#[command(name = "hxc")]
#[command(about = "hepx client - expose local services through a hepx server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Server address (overrides config)
    #[arg(short, long)]
    server_addr: Option<String>,

    /// Server port (overrides config)
    #[arg(short = 'P', long)]
    server_port: Option<u16>,

    /// Auth token (overrides config)
    #[arg(short, long)]
    token: Option<String>,

    /// Log level (error, warn, info, debug, trace); defaults to the config value
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Check the configuration file and exit
    Verify,

    /// NAT traversal diagnostics
    Nathole {
        #[command(subcommand)]
        command: NatholeCommand,
    },
}

#[derive(Subcommand)]
enum NatholeCommand {
    /// Probe a STUN server and classify this host's NAT
    Discover {
        /// STUN server address (defaults to the config value)
        #[arg(long)]
        stun_server: Option<String>,

        /// Local UDP address to probe from
        #[arg(long)]
        local_addr: Option<String>,
    },
}

fn load(args: &Args) -> Result<ClientConfig> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_client_config_path);

    let mut config = if config_path.exists() {
        config::load_config(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else if args.config.is_some() {
        anyhow::bail!("Config file {:?} not found", config_path);
    } else {
        ClientConfig::default()
    };

    if let Some(addr) = &args.server_addr {
        config.server_addr = addr.clone();
    }
    if let Some(port) = args.server_port {
        config.server_port = port;
    }
    if let Some(token) = &args.token {
        config.auth.token = token.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    config.validate().context("Invalid client configuration")?;
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

    match args.command {
        Some(Command::Verify) => {
            println!(
                "Configuration is valid: {} proxies, {} visitors",
                config.proxies.len(),
                config.visitors.len()
            );
            Ok(())
        }
        Some(Command::Nathole {
            command: NatholeCommand::Discover {
                stun_server,
                local_addr,
            },
        }) => {
            let server = stun_server.unwrap_or_else(|| config.nat_hole_stun_server.clone());
            discover(server, local_addr).await
        }
        None => run(config).await,
    }
}

async fn run(config: ClientConfig) -> Result<()> {
    tracing::info!("hxc {} starting...", env!("CARGO_PKG_VERSION"));
    tracing::info!("Connecting to server at {}", config.server_address());

    let service = Arc::new(Service::new(config));

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

    service.run().await.context("Client failed")?;
    tracing::info!("hxc shutdown complete");
    Ok(())
}

async fn discover(stun_server: String, local_addr: Option<String>) -> Result<()> {
    let (addresses, local) = nathole::discover(&[stun_server.clone()], local_addr.as_deref())
        .await
        .with_context(|| format!("STUN discovery via {} failed", stun_server))?;

    let local_ips = nathole::list_local_ips_for_nat_hole(10).unwrap_or_else(|e| {
        tracing::warn!("Failed to list local addresses: {}", e);
        Vec::new()
    });

    println!("STUN server: {}", stun_server);
    println!("External addresses: {}", addresses.join(", "));
    println!("Local address: {}", local);

    match nathole::classify_nat_feature(&addresses, &local_ips) {
        Ok(feature) => {
            println!("NAT type: {}", feature.nat_type);
            println!("Behavior: {}", feature.behavior);
            if feature.ports_difference > 0 {
                println!(
                    "Ports difference: {} (regular: {})",
                    feature.ports_difference, feature.regular_ports_change
                );
            }
            println!("Public network: {}", feature.public_network);
        }
        Err(e) => println!("Unable to classify NAT: {}", e),
    }
    Ok(())
}
