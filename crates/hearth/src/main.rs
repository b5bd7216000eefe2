//! Hearth hub
//!
//! Hosts add-ons: loads every installed package, supervises the add-on
//! processes and serves the IPC port they connect back on.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hearth::settings::RedbSettings;
use hearth::{AddonManager, HubConfig};

/// Hearth add-on host
#[derive(Parser, Debug)]
#[command(name = "hearth")]
#[command(about = "IoT hub add-on host", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Profile directory (overrides the config file)
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// IPC listen address (overrides the config file)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hearth=info"));
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = HubConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(base_dir) = args.base_dir {
        config.base_dir = base_dir;
    }
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("Starting Hearth v{}", env!("CARGO_PKG_VERSION"));

    let profile = config.profile();
    profile
        .ensure_dirs()
        .with_context(|| format!("Failed to create profile in {}", profile.base_dir.display()))?;
    let settings = RedbSettings::open(&profile.settings_db())
        .with_context(|| format!("Failed to open {}", profile.settings_db().display()))?;

    let manager = AddonManager::new(config, Arc::new(settings));
    let addr = manager.start().await.context("Failed to start plugin server")?;
    info!("Add-ons connect on {}", addr);

    manager.load_addons().await?;
    let installed = manager.installed_addons();
    if installed.is_empty() {
        warn!("No add-ons installed in {}", profile.addons_dir.display());
    } else {
        info!("Installed add-ons: {}", installed.join(", "));
    }

    shutdown_signal().await;

    manager.unload_addons().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
