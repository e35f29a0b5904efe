//! Configuration for zeus-updater.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Sentinel channel name tracking the newest release.
pub const LATEST_CHANNEL: &str = "latest";

/// Release channel the device follows.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UpdateChannel {
    /// Newest release; only upgrades are installed.
    #[default]
    Latest,
    /// A pinned release tag; upgrades and downgrades are installed.
    Tag(String),
}

impl UpdateChannel {
    /// Whether this is the `latest` channel.
    #[must_use]
    pub fn is_latest(&self) -> bool {
        matches!(self, Self::Latest)
    }

    /// Channel name as used in release URLs.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Latest => LATEST_CHANNEL,
            Self::Tag(tag) => tag,
        }
    }
}

impl From<String> for UpdateChannel {
    fn from(value: String) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed == LATEST_CHANNEL {
            Self::Latest
        } else {
            Self::Tag(trimmed.to_string())
        }
    }
}

impl From<&str> for UpdateChannel {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<UpdateChannel> for String {
    fn from(channel: UpdateChannel) -> Self {
        match channel {
            UpdateChannel::Latest => LATEST_CHANNEL.to_string(),
            UpdateChannel::Tag(tag) => tag,
        }
    }
}

impl FromStr for UpdateChannel {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for UpdateChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Updater configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Release channel.
    #[serde(default)]
    pub channel: UpdateChannel,

    /// Firmware asset name within a release.
    #[serde(default = "default_firmware_file")]
    pub firmware_file: String,

    /// Release repository URL.
    #[serde(default = "default_repo_url")]
    pub repo_url: String,

    /// Directory holding the firmware slots and boot record.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Periodic trigger configuration.
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Download configuration.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Periodic update trigger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Run the periodic trigger.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minutes between update attempts.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,

    /// Seconds to wait before the first attempt.
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,

    /// Window over which devices spread their first attempt (0 disables).
    #[serde(default)]
    pub rollout_window_minutes: u64,

    /// Device identifier seeding the rollout offset.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Download configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Whole-download timeout in seconds.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Maximum redirects followed per request.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            channel: UpdateChannel::default(),
            firmware_file: default_firmware_file(),
            repo_url: default_repo_url(),
            storage_dir: default_storage_dir(),
            trigger: TriggerConfig::default(),
            fetch: FetchConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: default_interval_minutes(),
            settle_delay_secs: default_settle_delay_secs(),
            rollout_window_minutes: 0,
            device_id: None,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            max_redirects: default_max_redirects(),
        }
    }
}

fn default_firmware_file() -> String {
    "zeus-esp32.bin".to_string()
}

fn default_repo_url() -> String {
    "https://github.com/nicklasfrahm/zeus".to_string()
}

fn default_storage_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "zeus")
        .map(|dirs| dirs.data_dir().join("firmware"))
        .unwrap_or_else(|| PathBuf::from(".zeus/firmware"))
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_interval_minutes() -> u64 {
    5
}

const fn default_settle_delay_secs() -> u64 {
    10
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_download_timeout_secs() -> u64 {
    600
}

const fn default_max_redirects() -> usize {
    crate::fetch::DEFAULT_MAX_REDIRECTS
}

impl UpdaterConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
