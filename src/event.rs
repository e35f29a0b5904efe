//! Update event system.

use tokio::sync::broadcast;

/// Events emitted by the update manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    /// An update attempt started.
    CheckStarted {
        /// Channel being checked.
        channel: String,
    },

    /// The device already runs the wanted firmware.
    UpToDate {
        /// Running version.
        running: String,
        /// Version offered by the release channel.
        candidate: String,
    },

    /// A new image is being written.
    UpdateStarted {
        /// Version being installed.
        version: String,
    },

    /// The new image was written and selected for the next boot.
    UpdateInstalled {
        /// Installed version.
        version: String,
        /// Bytes written to the slot.
        bytes_written: u64,
    },

    /// The attempt failed.
    UpdateFailed {
        /// Error message.
        message: String,
    },

    /// A manual attempt was refused because another one is running.
    Busy,
}

/// Channel for receiving update events.
pub type UpdateEventsChannel = broadcast::Receiver<UpdateEvent>;

/// Sender for update events.
pub type UpdateEventsSender = broadcast::Sender<UpdateEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (UpdateEventsSender, UpdateEventsChannel) {
    broadcast::channel(256)
}
