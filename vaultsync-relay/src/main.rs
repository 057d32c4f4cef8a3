//! VaultSync Relay Server
//!
//! Accepts authenticated secret writes from registered devices and streams
//! every change to the owner's other live devices. Secret payloads are
//! opaque: the relay stores and forwards them without interpreting them.

mod auth;
mod cleanup;
mod config;
mod error;
mod handlers;
mod rate_limit;
mod server;
mod storage;
#[cfg(test)]
mod test_support;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "vaultsync-relay", about = "VaultSync secret sync relay server")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Keep secrets in memory instead of the database
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        config::RelayConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        config::RelayConfig::default()
    };

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        cfg.storage_path = database;
    }
    if cli.in_memory {
        cfg.in_memory_secrets = true;
    }

    tracing::info!("Starting VaultSync relay on {}", cfg.listen_addr);

    let storage = storage::RelayStorage::open(&cfg.storage_path)?;
    let listen_addr = cfg.listen_addr.clone();
    let cleanup_interval = Duration::from_secs(cfg.cleanup_interval_secs);
    let nonce_retention_secs = cfg.nonce_retention_secs;

    let state = server::AppState::new(storage.clone(), cfg)?;
    let controller = state.controller.clone();
    let shutdown = CancellationToken::new();

    let cleanup = cleanup::spawn_cleanup_task(
        storage,
        state.rate_limiter.clone(),
        cleanup_interval,
        nonce_retention_secs,
        shutdown.clone(),
    );

    let app = server::build_router(state);
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;

    {
        let shutdown = shutdown.clone();
        let controller = controller.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
            shutdown.cancel();
            // Live update streams never end on their own.
            controller.shutdown().await;
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    controller.shutdown().await;
    cleanup.await?;

    tracing::info!("Relay stopped");
    Ok(())
}
