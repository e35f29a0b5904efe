//! Release download locations and process control.

use crate::config::UpdateChannel;
use tracing::info;

/// Exit code asking the service supervisor to restart onto the new slot.
pub const RESTART_EXIT_CODE: i32 = 75;

/// Builds download URLs and request identity for a release source.
pub trait UrlBuilder: Send + Sync {
    /// URL of `file` in the release selected by `channel`.
    fn download_url(&self, channel: &UpdateChannel, file: &str) -> String;

    /// Value for the `User-Agent` request header.
    fn user_agent(&self) -> String;
}

/// Restarts the running firmware.
pub trait ProcessControl: Send + Sync {
    /// Restart onto the selected boot slot.
    ///
    /// Does not return under normal operation.
    fn restart(&self);
}

/// Release assets hosted on a GitHub repository.
#[derive(Debug, Clone)]
pub struct GitHubReleases {
    repo_url: String,
    app_name: String,
    app_version: String,
}

impl GitHubReleases {
    /// Create a builder for `repo_url`, identifying as this crate.
    #[must_use]
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self::with_identity(
            repo_url,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        )
    }

    /// Create a builder with an explicit application name and version.
    #[must_use]
    pub fn with_identity(
        repo_url: impl Into<String>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        let repo_url: String = repo_url.into();
        Self {
            repo_url: repo_url.trim_end_matches('/').to_string(),
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }

    /// Repository URL without a trailing slash.
    #[must_use]
    pub fn repo_url(&self) -> &str {
        &self.repo_url
    }

    /// Where to report problems.
    #[must_use]
    pub fn support_message(&self) -> String {
        format!(
            "For support, please create an issue at: {}/issues",
            self.repo_url
        )
    }
}

impl UrlBuilder for GitHubReleases {
    fn download_url(&self, channel: &UpdateChannel, file: &str) -> String {
        match channel {
            UpdateChannel::Latest => {
                format!("{}/releases/latest/download/{file}", self.repo_url)
            }
            UpdateChannel::Tag(tag) => {
                format!("{}/releases/download/{tag}/{file}", self.repo_url)
            }
        }
    }

    fn user_agent(&self) -> String {
        format!("{}/{} (+{})", self.app_name, self.app_version, self.repo_url)
    }
}

/// Restart by exiting with [`RESTART_EXIT_CODE`] under a supervisor.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorRestart;

impl ProcessControl for SupervisorRestart {
    fn restart(&self) {
        info!("Restarting system ...");
        std::process::exit(RESTART_EXIT_CODE);
    }
}
