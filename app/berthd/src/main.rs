//! Berth daemon.
//!
//! Serves the container lifecycle API on a Unix socket (and optionally TCP),
//! backed by the local process manager.

mod config;

use anyhow::{Context, Result};
use berth_api::{ApiServer, ServerConfig};
use berth_container::{DetachKeys, LocalManager, LocalManagerOptions};
use clap::Parser;
use config::Config;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "berthd")]
#[command(author, version, about, long_about = None)]
pub struct DaemonArgs {
    /// Configuration file (default: ~/.config/berth/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Unix socket path for the API (default: ~/.berth/berth.sock).
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Also listen on this TCP address. Unauthenticated; use loopback.
    #[arg(long)]
    pub tcp: Option<SocketAddr>,

    /// Log level, used when RUST_LOG is not set.
    #[arg(long)]
    pub log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = DaemonArgs::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(socket) = args.socket {
        config.api.socket_path = socket;
    }
    if let Some(tcp) = args.tcp {
        config.api.tcp_addr = Some(tcp);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_tracing(&config);
    run(config).await
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Starting Berth daemon...");

    let default_detach_keys = config
        .manager
        .default_detach_keys
        .as_deref()
        .map(DetachKeys::parse)
        .transpose()
        .context("Invalid manager.default_detach_keys")?;

    let manager = Arc::new(LocalManager::new(LocalManagerOptions {
        default_detach_keys,
    }));

    let server = ApiServer::new(
        ServerConfig {
            socket_path: config.api.socket_path.clone(),
            tcp_addr: config.api.tcp_addr,
        },
        manager.clone(),
    );

    let shutdown = CancellationToken::new();
    let mut server_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.run(shutdown).await })
    };

    println!("Berth daemon started");
    println!("  API: {}", config.api.socket_path.display());
    if let Some(addr) = config.api.tcp_addr {
        println!("  TCP: {addr}");
    }
    println!("Press Ctrl+C to stop.");

    tokio::select! {
        () = shutdown_signal() => info!("Shutdown signal received"),
        result = &mut server_handle => {
            // The server only returns early on a bind or accept failure.
            return result
                .context("API server task panicked")?
                .context("API server failed");
        }
    }

    info!("Shutting down...");
    shutdown.cancel();
    server_handle
        .await
        .context("API server task panicked")?
        .context("API server failed")?;

    manager
        .stop_all(Duration::from_secs(config.manager.shutdown_timeout_secs))
        .await;

    info!("Berth daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
