//! File-backed A/B firmware storage.
//!
//! Each slot is a `<label>.bin` file in one directory, next to an
//! `otadata.toml` boot record. Updates are written to `<label>.bin.part` and
//! only renamed over the slot once they pass [`verify_image`].

use super::{FirmwareStorage, Slot, SlotMetadata, WriteSession};
use crate::error::StorageError;
use crate::image::{verify_image, AppDescriptor, HEADER_SIZE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const STATE_FILE: &str = "otadata.toml";

/// Persistent boot record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootState {
    /// Slot labels, in partition-table order.
    pub slots: Vec<String>,
    /// Slot the current process was started from.
    pub running: String,
    /// Slot to start on the next restart.
    pub boot: String,
    /// The running image has not yet been confirmed healthy.
    #[serde(default)]
    pub pending_verify: bool,
    /// Slot that ran before the unconfirmed image was promoted.
    #[serde(default)]
    pub previous: Option<String>,
    /// Slot holding the last image that failed to confirm.
    #[serde(default)]
    pub last_failed: Option<String>,
}

impl Default for BootState {
    fn default() -> Self {
        Self {
            slots: vec!["ota_0".to_string(), "ota_1".to_string()],
            running: "ota_0".to_string(),
            boot: "ota_0".to_string(),
            pending_verify: false,
            previous: None,
            last_failed: None,
        }
    }
}

impl BootState {
    fn validate(&self) -> Result<(), StorageError> {
        for label in [&self.running, &self.boot] {
            if !self.slots.contains(label) {
                return Err(StorageError::State(format!(
                    "slot {label} is not in the partition table {:?}",
                    self.slots
                )));
            }
        }
        Ok(())
    }
}

/// What [`DirectoryStorage::select_boot_slot`] decided at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootSelection {
    /// Running the same slot as before.
    Unchanged {
        /// Running slot.
        running: Slot,
    },
    /// A freshly installed slot became the running one, pending confirmation.
    Promoted {
        /// Newly running slot.
        running: Slot,
        /// Slot that ran before.
        previous: Slot,
    },
    /// The new image never confirmed itself; the previous slot is restored.
    RolledBack {
        /// Slot holding the failed image.
        failed: Slot,
        /// Slot running again.
        restored: Slot,
    },
}

/// A/B firmware slots stored as files in one directory.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
    state: Arc<Mutex<BootState>>,
}

impl DirectoryStorage {
    /// Open the storage directory, creating it with a default two-slot boot
    /// record if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or boot record cannot be created,
    /// read or parsed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let state_path = root.join(STATE_FILE);
        let state = if state_path.exists() {
            let content = fs::read_to_string(&state_path)?;
            toml::from_str(&content).map_err(|e| StorageError::State(e.to_string()))?
        } else {
            let state = BootState::default();
            write_state(&root, &state)?;
            state
        };
        state.validate()?;

        debug!("Opened firmware storage at {}", root.display());
        Ok(Self {
            root,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Open storage with an explicit partition table, replacing any existing
    /// boot record.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is empty or the record cannot be written.
    pub fn create(root: impl Into<PathBuf>, slots: &[&str]) -> Result<Self, StorageError> {
        let root = root.into();
        let first = slots
            .first()
            .ok_or_else(|| StorageError::State("partition table is empty".to_string()))?;
        fs::create_dir_all(&root)?;

        let state = BootState {
            slots: slots.iter().map(ToString::to_string).collect(),
            running: (*first).to_string(),
            boot: (*first).to_string(),
            ..BootState::default()
        };
        write_state(&root, &state)?;
        Ok(Self {
            root,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Storage directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot of the boot record.
    #[must_use]
    pub fn boot_state(&self) -> BootState {
        self.state.lock().clone()
    }

    /// Path of the image file for `slot`.
    #[must_use]
    pub fn slot_path(&self, slot: &Slot) -> PathBuf {
        slot_file(&self.root, &slot.label)
    }

    /// Decide which slot runs in this process. Call once at start-up.
    ///
    /// A slot selected by [`FirmwareStorage::set_boot_target`] is promoted
    /// to running but stays unconfirmed. If the process starts again before
    /// [`mark_running_valid`](Self::mark_running_valid) confirmed it, the
    /// image is recorded as failed and the previous slot is restored.
    ///
    /// # Errors
    ///
    /// Returns an error if the boot record cannot be persisted.
    pub fn select_boot_slot(&self) -> Result<BootSelection, StorageError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let selection = if state.boot != state.running {
            let previous = std::mem::replace(&mut state.running, state.boot.clone());
            state.previous = Some(previous.clone());
            state.pending_verify = true;
            info!("Promoted slot {} to running (was {previous})", state.running);
            BootSelection::Promoted {
                running: Slot::new(state.running.clone()),
                previous: Slot::new(previous),
            }
        } else if let (true, Some(previous)) = (state.pending_verify, state.previous.clone()) {
            let failed = std::mem::replace(&mut state.running, previous.clone());
            state.boot = previous.clone();
            state.last_failed = Some(failed.clone());
            state.pending_verify = false;
            state.previous = None;
            warn!("Firmware in slot {failed} was never confirmed, rolled back to {previous}");
            BootSelection::RolledBack {
                failed: Slot::new(failed),
                restored: Slot::new(previous),
            }
        } else {
            return Ok(BootSelection::Unchanged {
                running: Slot::new(state.running.clone()),
            });
        };

        write_state(&self.root, state)?;
        Ok(selection)
    }

    /// Confirm the running image as healthy, cancelling any pending rollback.
    ///
    /// # Errors
    ///
    /// Returns an error if the boot record cannot be persisted.
    pub fn mark_running_valid(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if !state.pending_verify {
            return Ok(());
        }
        state.pending_verify = false;
        state.previous = None;
        write_state(&self.root, &state)?;
        info!("Confirmed firmware in slot {}", state.running);
        Ok(())
    }

    fn read_metadata(&self, label: &str) -> Result<SlotMetadata, StorageError> {
        let path = slot_file(&self.root, label);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::EmptySlot(label.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut header = Vec::with_capacity(HEADER_SIZE);
        file.take(HEADER_SIZE as u64).read_to_end(&mut header)?;
        AppDescriptor::from_image(&header)
            .map(|desc| desc.metadata())
            .map_err(|source| StorageError::Header {
                slot: label.to_string(),
                source,
            })
    }
}

impl FirmwareStorage for DirectoryStorage {
    fn running_metadata(&self) -> Result<SlotMetadata, StorageError> {
        let running = self.state.lock().running.clone();
        self.read_metadata(&running)
    }

    fn last_failed_metadata(&self) -> Option<SlotMetadata> {
        let failed = self.state.lock().last_failed.clone()?;
        match self.read_metadata(&failed) {
            Ok(meta) => Some(meta),
            Err(e) => {
                debug!("No metadata for failed slot {failed}: {e}");
                None
            }
        }
    }

    fn inactive_slot(&self) -> Option<Slot> {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .find(|label| **label != state.running)
            .map(|label| Slot::new(label.clone()))
    }

    fn begin_write(&self, slot: &Slot) -> Result<Box<dyn WriteSession>, StorageError> {
        {
            let state = self.state.lock();
            if !state.slots.contains(&slot.label) {
                return Err(StorageError::UnknownSlot(slot.label.clone()));
            }
            if state.running == slot.label {
                return Err(StorageError::State(format!(
                    "refusing to write running slot {slot}"
                )));
            }
        }

        let part_path = part_file(&self.root, &slot.label);
        let file = File::create(&part_path)?;
        debug!("Writing slot {slot} via {}", part_path.display());

        Ok(Box::new(FileSession {
            writer: BufWriter::new(file),
            part_path,
            slot: slot.clone(),
            root: self.root.clone(),
            state: Arc::clone(&self.state),
            written: 0,
        }))
    }

    fn set_boot_target(&self, slot: &Slot) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if !state.slots.contains(&slot.label) {
            return Err(StorageError::UnknownSlot(slot.label.clone()));
        }
        if !slot_file(&self.root, &slot.label).exists() {
            return Err(StorageError::EmptySlot(slot.label.clone()));
        }

        let mut next = state.clone();
        next.boot = slot.label.clone();
        write_state(&self.root, &next)?;
        *state = next;
        info!("Next boot slot: {slot}");
        Ok(())
    }
}

/// Sequential write into `<slot>.bin.part`.
struct FileSession {
    writer: BufWriter<File>,
    part_path: PathBuf,
    slot: Slot,
    root: PathBuf,
    state: Arc<Mutex<BootState>>,
    written: u64,
}

impl WriteSession for FileSession {
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.writer.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<(), StorageError> {
        let Self {
            writer,
            part_path,
            slot,
            root,
            state,
            written,
        } = *self;

        if let Err(e) = commit_part(writer, &part_path, &slot_file(&root, &slot.label)) {
            remove_quietly(&part_path);
            return Err(e);
        }

        let mut state = state.lock();
        if state.last_failed.as_deref() == Some(slot.label.as_str()) {
            let mut next = state.clone();
            next.last_failed = None;
            write_state(&root, &next)?;
            *state = next;
        }
        info!("Finalized slot {slot}: {written} B");
        Ok(())
    }

    fn abort(self: Box<Self>) {
        let Self {
            writer,
            part_path,
            slot,
            written,
            ..
        } = *self;
        drop(writer);
        remove_quietly(&part_path);
        debug!("Aborted write to slot {slot} after {written} B");
    }
}

/// Flush and verify the part file, then move it over the slot image.
fn commit_part(writer: BufWriter<File>, part_path: &Path, slot_path: &Path) -> Result<(), StorageError> {
    let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()?;
    drop(file);

    let image = fs::read(part_path)?;
    verify_image(&image).map_err(StorageError::Validation)?;
    fs::rename(part_path, slot_path)?;
    Ok(())
}

fn slot_file(root: &Path, label: &str) -> PathBuf {
    root.join(format!("{label}.bin"))
}

fn part_file(root: &Path, label: &str) -> PathBuf {
    root.join(format!("{label}.bin.part"))
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {e}", path.display());
        }
    }
}

fn write_state(root: &Path, state: &BootState) -> Result<(), StorageError> {
    let content = toml::to_string_pretty(state).map_err(|e| StorageError::State(e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(root)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(root.join(STATE_FILE))
        .map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}
