//! Firmware self-update.
//!
//! This module handles:
//! - Serialising update attempts behind a single-flight guard
//! - Downloading the channel's release image and deciding whether to install it
//! - Writing the image to the inactive slot and switching the boot target
//! - Re-running the check on a fixed interval

mod lock;
mod orchestrator;
mod rollout;
mod trigger;

pub use lock::{Busy, SingleFlight};
pub use orchestrator::BUFFER_SIZE;
pub use rollout::RolloutOffset;
pub use trigger::TriggerHandle;

use crate::config::{UpdateChannel, UpdaterConfig};
use crate::error::{FetchError, UpdateError};
use crate::event::{create_event_channel, UpdateEvent, UpdateEventsChannel, UpdateEventsSender};
use crate::fetch::{Fetcher, HttpTransport, ReqwestTransport};
use crate::release::{GitHubReleases, ProcessControl, SupervisorRestart, UrlBuilder};
use crate::storage::FirmwareStorage;
use crate::version::{UpdateDirection, Version};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Result of an update attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The channel offers nothing to install.
    UpToDate {
        /// Running version.
        running: Version,
        /// Version offered by the channel.
        candidate: Version,
        /// How the candidate compares to the running version.
        direction: UpdateDirection,
    },
    /// A new image was written and selected for the next boot.
    Installed {
        /// Installed version.
        version: Version,
        /// Bytes written to the slot.
        bytes_written: u64,
    },
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate {
                running,
                candidate,
                direction,
            } => write!(f, "up to date: running {running}, offered {candidate} ({direction})"),
            Self::Installed {
                version,
                bytes_written,
            } => write!(f, "installed {version} ({bytes_written} B)"),
        }
    }
}

/// Builder for an [`UpdateManager`].
pub struct UpdateManagerBuilder {
    storage: Arc<dyn FirmwareStorage>,
    fetcher: Fetcher,
    channel: UpdateChannel,
    firmware_file: String,
    urls: Arc<dyn UrlBuilder>,
    process: Arc<dyn ProcessControl>,
    settle_delay: Duration,
    rollout: RolloutOffset,
}

impl UpdateManagerBuilder {
    /// Release channel (default: `latest`).
    #[must_use]
    pub fn channel(mut self, channel: UpdateChannel) -> Self {
        self.channel = channel;
        self
    }

    /// Firmware asset name.
    #[must_use]
    pub fn firmware_file(mut self, file: impl Into<String>) -> Self {
        self.firmware_file = file.into();
        self
    }

    /// Download URL and user agent source.
    #[must_use]
    pub fn urls(mut self, urls: Arc<dyn UrlBuilder>) -> Self {
        self.urls = urls;
        self
    }

    /// Restart hook invoked after a successful install.
    #[must_use]
    pub fn process(mut self, process: Arc<dyn ProcessControl>) -> Self {
        self.process = process;
        self
    }

    /// Delay before the periodic trigger's first attempt.
    #[must_use]
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Additional per-device delay before the first periodic attempt.
    #[must_use]
    pub fn rollout(mut self, rollout: RolloutOffset) -> Self {
        self.rollout = rollout;
        self
    }

    /// Build the manager.
    #[must_use]
    pub fn build(self) -> UpdateManager {
        let (events_tx, _) = create_event_channel();
        UpdateManager {
            lock: SingleFlight::new(),
            channel: self.channel,
            firmware_file: self.firmware_file,
            storage: self.storage,
            fetcher: self.fetcher,
            urls: self.urls,
            process: self.process,
            events_tx,
            settle_delay: self.settle_delay,
            rollout: self.rollout,
        }
    }
}

/// Owns everything an update attempt needs and serialises attempts.
///
/// Constructed once at startup and shared by reference between the periodic
/// trigger and manual callers.
pub struct UpdateManager {
    lock: SingleFlight,
    channel: UpdateChannel,
    firmware_file: String,
    storage: Arc<dyn FirmwareStorage>,
    fetcher: Fetcher,
    urls: Arc<dyn UrlBuilder>,
    process: Arc<dyn ProcessControl>,
    events_tx: UpdateEventsSender,
    settle_delay: Duration,
    rollout: RolloutOffset,
}

impl UpdateManager {
    /// Start building a manager over `storage`, downloading through
    /// `fetcher`.
    #[must_use]
    pub fn builder(storage: Arc<dyn FirmwareStorage>, fetcher: Fetcher) -> UpdateManagerBuilder {
        let defaults = UpdaterConfig::default();
        UpdateManagerBuilder {
            storage,
            fetcher,
            channel: defaults.channel,
            firmware_file: defaults.firmware_file,
            urls: Arc::new(GitHubReleases::new(defaults.repo_url)),
            process: Arc::new(SupervisorRestart),
            settle_delay: Duration::from_secs(defaults.trigger.settle_delay_secs),
            rollout: RolloutOffset::disabled(),
        }
    }

    /// Build a manager from configuration, downloading over HTTPS and
    /// restarting through the service supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn from_config(
        config: &UpdaterConfig,
        storage: Arc<dyn FirmwareStorage>,
    ) -> Result<Self, FetchError> {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(
            Duration::from_secs(config.fetch.connect_timeout_secs),
            Duration::from_secs(config.fetch.download_timeout_secs),
        )?);
        let fetcher = Fetcher::new(transport).with_max_redirects(config.fetch.max_redirects);

        Ok(Self::builder(storage, fetcher)
            .channel(config.channel.clone())
            .firmware_file(config.firmware_file.clone())
            .urls(Arc::new(GitHubReleases::new(config.repo_url.clone())))
            .settle_delay(Duration::from_secs(config.trigger.settle_delay_secs))
            .rollout(RolloutOffset::from_config(&config.trigger))
            .build())
    }

    /// The release channel.
    #[must_use]
    pub fn channel(&self) -> &UpdateChannel {
        &self.channel
    }

    /// Subscribe to update events.
    #[must_use]
    pub fn subscribe_events(&self) -> UpdateEventsChannel {
        self.events_tx.subscribe()
    }

    /// Whether an attempt is running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.lock.is_busy()
    }

    /// Run an attempt, waiting for any running attempt to finish first.
    ///
    /// Blocks the calling thread for the whole download.
    ///
    /// # Errors
    ///
    /// Returns the reason the attempt failed.
    pub fn update_lock(&self) -> Result<UpdateOutcome, UpdateError> {
        self.lock.run_exclusive(|| self.attempt())
    }

    /// Run an attempt unless one is already running.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Busy`] immediately if an attempt is running,
    /// otherwise the reason the attempt failed.
    pub fn update_trylock(&self) -> Result<UpdateOutcome, UpdateError> {
        self.lock
            .try_run_exclusive(|| self.attempt())
            .unwrap_or_else(|Busy| {
                info!("Update already in progress");
                self.emit(UpdateEvent::Busy);
                Err(UpdateError::Busy)
            })
    }

    /// Start the periodic trigger with an interval in minutes.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn update_init(self: &Arc<Self>, interval_minutes: u64) -> TriggerHandle {
        self.start_trigger(Duration::from_secs(interval_minutes.saturating_mul(60)))
    }

    /// Start the periodic trigger.
    ///
    /// The first attempt runs after the settling delay plus the rollout
    /// offset. Must be called from within a tokio runtime.
    #[must_use]
    pub fn start_trigger(self: &Arc<Self>, interval: Duration) -> TriggerHandle {
        let initial_delay = self.settle_delay.saturating_add(self.rollout.offset());
        trigger::spawn(Arc::clone(self), initial_delay, interval)
    }

    fn attempt(&self) -> Result<UpdateOutcome, UpdateError> {
        self.emit(UpdateEvent::CheckStarted {
            channel: self.channel.to_string(),
        });

        let result = self.execute();
        match &result {
            Ok(UpdateOutcome::UpToDate {
                running, candidate, ..
            }) => self.emit(UpdateEvent::UpToDate {
                running: running.to_string(),
                candidate: candidate.to_string(),
            }),
            Ok(UpdateOutcome::Installed { .. }) => {}
            Err(e) => {
                error!("Update failed: {e}");
                self.emit(UpdateEvent::UpdateFailed {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    fn emit(&self, event: UpdateEvent) {
        let _ = self.events_tx.send(event);
    }
}
