//! A single update attempt.
//!
//! The attempt is straight-line blocking code run by whoever holds the
//! manager's single-flight guard:
//!
//! 1. Preflight: read the running image metadata and pick the inactive slot.
//! 2. Open the download through the redirect-following fetcher.
//! 3. Inspect the header in the first chunk and decide whether to install.
//! 4. Stream every chunk into a write session on the inactive slot.
//! 5. Finalize the session, select the slot for boot and restart.
//!
//! An open write session is aborted on every failure path, so a half-written
//! slot is never selected.

use super::{UpdateManager, UpdateOutcome};
use crate::error::{ReadError, StorageError, UpdateError};
use crate::event::UpdateEvent;
use crate::fetch::BodyStream;
use crate::image::{AppDescriptor, HEADER_SIZE};
use crate::storage::{SlotMetadata, WriteSession};
use crate::version::UpdateDirection;
use tracing::{debug, error, info, warn};

/// Read buffer size; comfortably larger than [`HEADER_SIZE`].
pub const BUFFER_SIZE: usize = 2048;

const _: () = assert!(BUFFER_SIZE >= HEADER_SIZE);

enum HeaderDecision {
    Install(SlotMetadata),
    Skip(UpdateOutcome),
}

/// Aborts the wrapped session when dropped without being finalized.
struct SessionGuard {
    session: Option<Box<dyn WriteSession>>,
}

impl SessionGuard {
    fn new(session: Box<dyn WriteSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        match self.session.as_mut() {
            Some(session) => session.write(data),
            None => Err(StorageError::State("write session already closed".to_string())),
        }
    }

    fn finalize(mut self) -> Result<(), StorageError> {
        match self.session.take() {
            Some(session) => session.finalize(),
            None => Err(StorageError::State("write session already closed".to_string())),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!("Aborting firmware write session");
            session.abort();
        }
    }
}

impl UpdateManager {
    /// Run one attempt. The caller must hold the single-flight guard.
    pub(super) fn execute(&self) -> Result<UpdateOutcome, UpdateError> {
        let running = self
            .storage
            .running_metadata()
            .map_err(UpdateError::RunningMetadata)?;
        info!(
            "Running firmware: {} (build {})",
            running.raw_version, running.build_id
        );

        let Some(target) = self.storage.inactive_slot() else {
            error!("Unsupported partitioning scheme: no inactive firmware slot");
            return Err(UpdateError::UnsupportedPartitioning);
        };
        debug!("Update target slot: {target}");

        let url = self.urls.download_url(&self.channel, &self.firmware_file);
        let user_agent = self.urls.user_agent();
        info!("Downloading firmware from {url}");
        let mut stream = self
            .fetcher
            .open(&url, &[("User-Agent", user_agent.as_str())])
            .map_err(|e| {
                error!("Failed to open firmware download: {e}");
                UpdateError::Request(e)
            })?;
        debug!("Resolved firmware URL: {}", stream.url());

        let mut buf = [0u8; BUFFER_SIZE];
        let mut session: Option<SessionGuard> = None;
        let mut candidate: Option<SlotMetadata> = None;
        let mut bytes_written: u64 = 0;

        loop {
            let n = stream.read(&mut buf).map_err(|e| {
                error!("Failed to receive firmware: {e}");
                UpdateError::TransportReadFailed(e)
            })?;

            if n > 0 {
                let chunk = &buf[..n];
                if session.is_none() {
                    let metadata = match self.inspect_header(chunk, &running)? {
                        HeaderDecision::Install(metadata) => metadata,
                        HeaderDecision::Skip(outcome) => return Ok(outcome),
                    };

                    info!("Writing firmware {} to slot {target}", metadata.raw_version);
                    let writer = self.storage.begin_write(&target).map_err(|e| {
                        error!("Failed to begin firmware write: {e}");
                        UpdateError::StorageBeginFailed(e)
                    })?;
                    session = Some(SessionGuard::new(writer));
                    self.emit(UpdateEvent::UpdateStarted {
                        version: metadata.raw_version.clone(),
                    });
                    candidate = Some(metadata);
                }

                if let Some(guard) = session.as_mut() {
                    guard.write(chunk).map_err(|e| {
                        error!("Failed to write firmware chunk: {e}");
                        UpdateError::StorageWriteFailed(e)
                    })?;
                }
                bytes_written += n as u64;
                debug!("Written image length: {bytes_written} B");
                continue;
            }

            if stream.is_complete() {
                break;
            }
            if !stream.is_connected() {
                return Err(connection_reset(&stream));
            }
        }

        let (Some(guard), Some(candidate)) = (session, candidate) else {
            error!("Firmware download ended before any data arrived");
            return Err(UpdateError::TruncatedImage {
                received: 0,
                required: HEADER_SIZE,
            });
        };

        info!("Firmware download complete: {bytes_written} B");
        guard.finalize().map_err(|e| {
            if e.is_validation() {
                error!("Firmware image is corrupted: {e}");
                UpdateError::ImageValidationFailed(e)
            } else {
                error!("Failed to finalize firmware write: {e}");
                UpdateError::StorageFinalizeFailed(e)
            }
        })?;

        self.storage.set_boot_target(&target).map_err(|e| {
            error!("Failed to set boot slot: {e}");
            UpdateError::BootTargetUpdateFailed(e)
        })?;
        info!("Slot {target} selected for next boot");

        self.emit(UpdateEvent::UpdateInstalled {
            version: candidate.raw_version.clone(),
            bytes_written,
        });
        self.process.restart();

        Ok(UpdateOutcome::Installed {
            version: candidate.version,
            bytes_written,
        })
    }

    /// Decode the candidate header from the first chunk and apply the
    /// channel and anti-rollback policies.
    fn inspect_header(
        &self,
        first: &[u8],
        running: &SlotMetadata,
    ) -> Result<HeaderDecision, UpdateError> {
        if first.len() < HEADER_SIZE {
            error!(
                "Firmware image incomplete: first read {} B, header needs {HEADER_SIZE} B",
                first.len()
            );
            return Err(UpdateError::TruncatedImage {
                received: first.len(),
                required: HEADER_SIZE,
            });
        }

        let candidate = AppDescriptor::from_image(first)
            .map_err(|e| {
                error!("Malformed firmware header: {e}");
                UpdateError::MalformedHeader(e)
            })?
            .metadata();
        info!(
            "New firmware: {} (build {})",
            candidate.raw_version, candidate.build_id
        );

        let direction = candidate.version.compare(&running.version);
        info!(
            "Update direction: {direction} ({} -> {})",
            running.raw_version, candidate.raw_version
        );

        let wanted = match direction {
            UpdateDirection::Upgrade => true,
            UpdateDirection::Downgrade => !self.channel.is_latest(),
            UpdateDirection::NoChange => false,
        };
        if !wanted {
            info!("Firmware is up to date on channel {}", self.channel);
            return Ok(HeaderDecision::Skip(UpdateOutcome::UpToDate {
                running: running.version.clone(),
                candidate: candidate.version,
                direction,
            }));
        }

        if let Some(failed) = self.storage.last_failed_metadata() {
            info!("Last invalid firmware: {}", failed.raw_version);
            if failed.raw_version == candidate.raw_version {
                warn!(
                    "New firmware {} previously failed to boot, not installing it again",
                    candidate.raw_version
                );
                return Err(UpdateError::KnownBadVersion {
                    version: candidate.raw_version,
                });
            }
        }

        Ok(HeaderDecision::Install(candidate))
    }
}

fn connection_reset(stream: &BodyStream) -> UpdateError {
    warn!(
        "Connection closed after {} B of {:?} B",
        stream.received(),
        stream.expected_len()
    );
    UpdateError::TransportReadFailed(ReadError::ConnectionReset {
        received: stream.received(),
        expected: stream.expected_len(),
    })
}
