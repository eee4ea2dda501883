#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tunneld
//!
//! Tunnel process supervisor. tunneld keeps one network-exposure agent
//! process per configured tunnel running, persists the definitions across
//! restarts, and reconciles each tunnel's declared configuration against the
//! observed state of its process and relay registration.
//!
//! ## Subcommands
//!
//! - `tunneld run` (default) — restore persisted tunnels and supervise them
//!   until SIGINT/SIGTERM
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap subcommands, signal-driven shutdown
//! config.rs      — TOML + env-var configuration
//! store.rs       — durable tunnel definitions (tunnels.json)
//! relay.rs       — read-only relay API client (live registrations)
//! tunnels/
//!   mod.rs       — TunnelManager (lifecycle, session flags, status derivation)
//!   agent.rs     — AgentProcess (process groups, log capture, graceful stop)
//!   poller.rs    — per-spawn relay confirmation poller
//!   logs.rs      — per-tunnel log tail helpers
//! ```

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use tunneld::config::Settings;
use tunneld::tunnels::TunnelManager;

/// Tunnel process supervisor.
#[derive(Parser)]
#[command(name = "tunneld", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore persisted tunnels and supervise them (default).
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Run { config }) => config,
        None => None,
    };
    run(config_path.as_deref()).await;
}

async fn run(config_path: Option<&str>) {
    let settings = Settings::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| settings.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("tunneld v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Relay host: {}", settings.relay.host);
    info!("Data dir: {}", settings.storage.data_dir);
    if !settings.has_api_key() {
        warn!("No relay API key configured — tunnels will stay stopped until one is set");
    }

    let manager = TunnelManager::new(settings);
    if let Err(e) = manager.restore_all().await {
        error!("Failed to restore tunnels: {e}");
        std::process::exit(1);
    }

    // Wait for SIGINT or SIGTERM
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }

    info!("Shutting down...");
    manager.shutdown_all().await;
    info!("Goodbye");
}
