//! # zeus-updater
//!
//! Self-update manager for networked embedded devices with A/B firmware slots.
//!
//! The updater decides whether a newer firmware image is available, streams
//! it over HTTP(S) into the inactive slot, refuses images that previously
//! failed to boot, validates the written image and switches the boot target.
//!
//! ## Components
//!
//! - [`version`]: the permissive dotted-version grammar and its ordering
//! - [`update::SingleFlight`]: at most one update attempt at any instant
//! - [`fetch::Fetcher`]: redirect-following HTTP body streaming
//! - [`update::UpdateManager`]: the update state machine and its entry points
//! - [`update::TriggerHandle`]: the periodic trigger running on a background task
//!
//! Network link management, the HTTP client, firmware storage and process
//! restart are collaborators behind traits ([`fetch::HttpTransport`],
//! [`storage::FirmwareStorage`], [`release::UrlBuilder`],
//! [`release::ProcessControl`]). Host implementations are provided for each.

pub mod config;
pub mod error;
pub mod event;
pub mod fetch;
pub mod image;
pub mod release;
pub mod storage;
pub mod update;
pub mod version;

pub use config::{UpdateChannel, UpdaterConfig};
pub use error::{Error, Result, UpdateError};
pub use update::{TriggerHandle, UpdateManager, UpdateOutcome};
pub use version::{UpdateDirection, Version};
