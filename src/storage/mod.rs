//! Firmware storage abstraction.
//!
//! Storage owns the firmware slots. Exactly one slot is running; the updater
//! only ever writes to an inactive one, through a sequential [`WriteSession`].

mod directory;

pub use directory::{BootSelection, BootState, DirectoryStorage};

use crate::error::StorageError;
use crate::version::Version;
use std::fmt;

/// A firmware slot (partition) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Slot {
    /// Partition label, e.g. `ota_1`.
    pub label: String,
}

impl Slot {
    /// Create a slot handle from its label.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Metadata read from a firmware image header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMetadata {
    /// Parsed version.
    pub version: Version,
    /// Version string exactly as stored in the header.
    pub raw_version: String,
    /// Build identifier (hex SHA-256 of the application ELF).
    pub build_id: String,
    /// Project name.
    pub project_name: String,
    /// Compile date and time.
    pub compiled_at: String,
    /// SDK version.
    pub sdk_version: String,
}

/// Persistent firmware storage with an active and an inactive slot.
pub trait FirmwareStorage: Send + Sync {
    /// Metadata of the currently running image.
    ///
    /// # Errors
    ///
    /// Returns an error if the running image header cannot be read.
    fn running_metadata(&self) -> Result<SlotMetadata, StorageError>;

    /// Metadata of the last image that failed validation after boot, if any.
    fn last_failed_metadata(&self) -> Option<SlotMetadata>;

    /// The slot an update should be written to, or `None` if the device has
    /// no second slot.
    fn inactive_slot(&self) -> Option<Slot>;

    /// Open `slot` for sequential writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot cannot be prepared for writing.
    fn begin_write(&self, slot: &Slot) -> Result<Box<dyn WriteSession>, StorageError>;

    /// Select `slot` as the image to run after the next restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the boot selection cannot be persisted.
    fn set_boot_target(&self, slot: &Slot) -> Result<(), StorageError>;
}

/// An open, sequential write into an inactive slot.
///
/// A session ends with exactly one of [`finalize`](Self::finalize) or
/// [`abort`](Self::abort). An aborted session leaves the slot unselected.
pub trait WriteSession: Send {
    /// Append bytes to the slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes cannot be written.
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Close the session and run the storage integrity check.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Validation`] if the image is invalid, or
    /// another error if it cannot be closed.
    fn finalize(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard everything written in this session.
    fn abort(self: Box<Self>);
}
