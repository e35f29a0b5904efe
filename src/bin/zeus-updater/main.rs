//! zeus-updater CLI entry point.

mod cli;

use clap::Parser;
use cli::{Cli, CliLogFormat};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zeus_updater::release::GitHubReleases;
use zeus_updater::storage::{BootSelection, DirectoryStorage, FirmwareStorage};
use zeus_updater::UpdateManager;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();
    let config = cli.to_config()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let (text_layer, json_layer) = match cli.log_format {
        CliLogFormat::Text => (Some(fmt::layer()), None),
        CliLogFormat::Json => (None, Some(fmt::layer().json())),
    };
    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(filter)
        .init();

    info!("zeus-updater v{}", env!("CARGO_PKG_VERSION"));
    info!("{}", GitHubReleases::new(config.repo_url.clone()).support_message());

    // Pick the running slot; an unconfirmed image from the last start is
    // rolled back here.
    let storage = Arc::new(DirectoryStorage::open(&config.storage_dir)?);
    match storage.select_boot_slot()? {
        BootSelection::Unchanged { running } => info!("Running firmware slot {running}"),
        BootSelection::Promoted { running, previous } => {
            info!("Booted new firmware slot {running} (previous {previous})");
        }
        BootSelection::RolledBack { failed, restored } => {
            warn!("Firmware in slot {failed} failed to start, restored slot {restored}");
        }
    }

    // The running image is confirmed once its own header is readable.
    let running = storage.running_metadata()?;
    storage.mark_running_valid()?;
    info!(
        "Firmware {} ({}, built {})",
        running.raw_version, running.project_name, running.compiled_at
    );

    let manager = {
        let config = config.clone();
        let storage: Arc<dyn FirmwareStorage> = storage;
        tokio::task::spawn_blocking(move || UpdateManager::from_config(&config, storage))
            .await??
    };
    let manager = Arc::new(manager);

    if cli.once {
        let worker = Arc::clone(&manager);
        let outcome = tokio::task::spawn_blocking(move || worker.update_trylock()).await??;
        println!("{outcome}");
        return Ok(());
    }

    if !config.trigger.enabled {
        info!("Periodic updates disabled, nothing to do");
        return Ok(());
    }

    let trigger = manager.update_init(config.trigger.interval_minutes);
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping update trigger");
    trigger.shutdown();
    trigger.join().await?;

    info!("Goodbye!");
    Ok(())
}
