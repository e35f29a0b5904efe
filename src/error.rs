//! Error types for zeus-updater.

use std::io;
use thiserror::Error;

/// Result type for crate-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error, used by configuration loading and the binary.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration could not be read, parsed or written.
    #[error("configuration error: {0}")]
    Config(String),

    /// Firmware storage error outside an update attempt.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// HTTP transport could not be constructed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// An update attempt failed.
    #[error(transparent)]
    Update(#[from] UpdateError),
}

/// Why an update attempt did not complete.
///
/// Every variant is returned to the caller of the attempt; none is retried
/// within the attempt. `Busy` is lock contention, not a failed attempt.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The device has no inactive slot to write to.
    #[error("unsupported partitioning scheme: no inactive firmware slot")]
    UnsupportedPartitioning,

    /// The running image's metadata could not be read.
    #[error("failed to read running firmware metadata: {0}")]
    RunningMetadata(#[source] StorageError),

    /// The download request could not be opened or resolved.
    #[error("firmware request failed: {0}")]
    Request(#[from] FetchError),

    /// The first chunk of the body did not cover the image header.
    #[error("firmware image incomplete: received {received} B, header needs {required} B")]
    TruncatedImage {
        /// Bytes in the first non-empty read.
        received: usize,
        /// Bytes required to decode the header.
        required: usize,
    },

    /// The candidate image header is not a recognised record.
    #[error("malformed firmware header: {0}")]
    MalformedHeader(#[source] ImageError),

    /// The candidate is the image that previously failed to boot.
    #[error("firmware {version} previously failed validation, refusing to install it again")]
    KnownBadVersion {
        /// Version string shared by the candidate and the failed image.
        version: String,
    },

    /// The inactive slot could not be opened for writing.
    #[error("failed to start update: {0}")]
    StorageBeginFailed(#[source] StorageError),

    /// Reading the response body failed.
    #[error("failed to receive update: {0}")]
    TransportReadFailed(#[from] ReadError),

    /// Writing a chunk to the inactive slot failed.
    #[error("failed to write update: {0}")]
    StorageWriteFailed(#[source] StorageError),

    /// Storage rejected the written image.
    #[error("failed to validate update: {0}")]
    ImageValidationFailed(#[source] StorageError),

    /// The written image passed validation but could not be committed.
    #[error("failed to finalize update: {0}")]
    StorageFinalizeFailed(#[source] StorageError),

    /// The written slot could not be selected for the next boot.
    #[error("failed to set boot partition: {0}")]
    BootTargetUpdateFailed(#[source] StorageError),

    /// Another update attempt holds the lock.
    #[error("an update is already in progress")]
    Busy,
}

impl UpdateError {
    /// Whether the transport closed before the complete body arrived.
    #[must_use]
    pub fn is_connection_reset(&self) -> bool {
        matches!(self, Self::TransportReadFailed(ReadError::ConnectionReset { .. }))
    }
}

/// Failure to obtain a readable body for a URL.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The HTTP client could not be built.
    #[error("failed to configure HTTP client: {0}")]
    Client(String),

    /// The URL (or a redirect target) is not a valid absolute URL.
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl {
        /// Offending URL or location.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// The connection could not be opened or the request not sent.
    #[error("failed to open HTTP connection to {url}: {reason}")]
    Connect {
        /// Requested URL.
        url: String,
        /// Transport message.
        reason: String,
    },

    /// A redirect response carried no usable `Location` header.
    #[error("redirect {status} from {url} has no Location header")]
    MissingLocation {
        /// Redirect status code.
        status: u16,
        /// URL that answered with the redirect.
        url: String,
    },

    /// The redirect chain exceeded the configured bound.
    #[error("too many redirects ({max}) starting at {url}")]
    TooManyRedirects {
        /// Configured maximum.
        max: usize,
        /// Originally requested URL.
        url: String,
    },

    /// The final response was not a success status.
    #[error("unexpected HTTP status {status} from {url}")]
    Status {
        /// Final status code.
        status: u16,
        /// Final URL.
        url: String,
    },
}

/// Failure while reading a response body.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The transport closed before the complete body was received.
    #[error("connection closed prematurely after {received} B")]
    ConnectionReset {
        /// Body bytes received before the close.
        received: u64,
        /// Declared body length, if any.
        expected: Option<u64>,
    },

    /// Any other transport error, including timeouts.
    #[error("transport read failed: {0}")]
    Io(#[source] io::Error),
}

/// Firmware storage failure.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O error.
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    /// A slot holds no readable image.
    #[error("no firmware image in slot {0}")]
    EmptySlot(String),

    /// A slot label is not part of the partition table.
    #[error("unknown slot {0}")]
    UnknownSlot(String),

    /// A stored image header could not be decoded.
    #[error("invalid image header in slot {slot}: {source}")]
    Header {
        /// Slot label.
        slot: String,
        /// Decode failure.
        #[source]
        source: ImageError,
    },

    /// The written image failed its integrity check.
    #[error("image validation failed: {0}")]
    Validation(#[source] ImageError),

    /// The boot-state record is unreadable or inconsistent.
    #[error("boot state error: {0}")]
    State(String),
}

impl StorageError {
    /// Whether this is an integrity-check failure of a written image.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Firmware image decode or integrity failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// The buffer ends before a required field.
    #[error("image too short: need {needed} B, have {available} B")]
    TooShort {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// The image header magic byte is wrong.
    #[error("bad image magic 0x{0:02x}")]
    BadMagic(u8),

    /// The application descriptor magic word is wrong.
    #[error("bad application descriptor magic 0x{0:08x}")]
    BadDescriptorMagic(u32),

    /// The header declares more segments than an image may have.
    #[error("image declares {0} segments")]
    TooManySegments(u8),

    /// The XOR checksum does not match.
    #[error("checksum mismatch: stored 0x{stored:02x}, computed 0x{computed:02x}")]
    ChecksumMismatch {
        /// Checksum byte in the image.
        stored: u8,
        /// Checksum over the segment data.
        computed: u8,
    },

    /// The appended SHA-256 does not match the image contents.
    #[error("appended SHA-256 does not match image contents")]
    HashMismatch,
}

