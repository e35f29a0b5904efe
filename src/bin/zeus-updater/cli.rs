//! Command-line interface definition.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use zeus_updater::config::UpdaterConfig;
use zeus_updater::UpdateChannel;

/// Firmware self-update manager for Zeus devices.
#[derive(Parser, Debug)]
#[command(name = "zeus-updater")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(long, short, env = "ZEUS_UPDATER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Release channel: `latest` or a release tag.
    #[arg(long, env = "ZEUS_UPDATE_CHANNEL")]
    pub channel: Option<String>,

    /// Firmware asset name within a release.
    #[arg(long, env = "ZEUS_FIRMWARE_FILE")]
    pub firmware_file: Option<String>,

    /// Release repository URL.
    #[arg(long, env = "ZEUS_REPO_URL")]
    pub repo_url: Option<String>,

    /// Directory holding the firmware slots.
    #[arg(long, env = "ZEUS_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Minutes between periodic update checks.
    #[arg(long, env = "ZEUS_UPDATE_INTERVAL")]
    pub interval_minutes: Option<u64>,

    /// Device identifier used to spread update checks across a fleet.
    #[arg(long, env = "ZEUS_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Run a single update check and exit.
    #[arg(long)]
    pub once: bool,

    /// Log level.
    #[arg(long, env = "ZEUS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "ZEUS_LOG_FORMAT")]
    pub log_format: CliLogFormat,
}

/// Log format CLI enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Merge CLI arguments over the configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn to_config(&self) -> color_eyre::Result<UpdaterConfig> {
        let mut config = if let Some(ref path) = self.config {
            UpdaterConfig::from_file(path)?
        } else {
            UpdaterConfig::default()
        };

        if let Some(ref channel) = self.channel {
            config.channel = UpdateChannel::from(channel.as_str());
        }
        if let Some(ref file) = self.firmware_file {
            config.firmware_file.clone_from(file);
        }
        if let Some(ref url) = self.repo_url {
            config.repo_url.clone_from(url);
        }
        if let Some(ref dir) = self.storage_dir {
            config.storage_dir.clone_from(dir);
        }
        if let Some(minutes) = self.interval_minutes {
            config.trigger.interval_minutes = minutes;
        }
        if let Some(ref id) = self.device_id {
            config.trigger.device_id = Some(id.clone());
        }
        if let Some(ref level) = self.log_level {
            config.log_level.clone_from(level);
        }

        Ok(config)
    }
}
