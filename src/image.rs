//! Firmware image header record and integrity check.
//!
//! Images follow the ESP32 application layout:
//!
//! ```text
//! offset  size  field
//! 0       24    image header (magic 0xE9, segment count, ..., hash_appended)
//! 24      8     first segment header (load address, data length)
//! 32      256   application descriptor (magic 0xABCD5432, version, ...)
//! ...           remaining segment data, further segments
//!               padding, XOR checksum byte (16-byte aligned end)
//!               optional SHA-256 of everything before it
//! ```
//!
//! Decoding is an explicit field-by-field read with bounds checks; nothing is
//! reinterpreted in place.

use crate::error::ImageError;
use crate::storage::SlotMetadata;
use crate::version::Version;
use sha2::{Digest, Sha256};

/// Image header magic byte.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Application descriptor magic word.
pub const APP_DESC_MAGIC: u32 = 0xABCD_5432;

/// Size of the image header.
pub const IMAGE_HEADER_LEN: usize = 24;

/// Size of a segment header.
pub const SEGMENT_HEADER_LEN: usize = 8;

/// Size of the application descriptor.
pub const APP_DESC_LEN: usize = 256;

/// Offset of the application descriptor within an image.
pub const APP_DESC_OFFSET: usize = IMAGE_HEADER_LEN + SEGMENT_HEADER_LEN;

/// Bytes needed to decode the candidate metadata.
pub const HEADER_SIZE: usize = APP_DESC_OFFSET + APP_DESC_LEN;

/// Maximum number of segments in an image.
pub const MAX_SEGMENTS: u8 = 16;

const CHECKSUM_SEED: u8 = 0xEF;
const HASH_LEN: usize = 32;
const HASH_APPENDED_OFFSET: usize = 23;

// Field layout of the application descriptor.
const VERSION_FIELD: (usize, usize) = (16, 32);
const PROJECT_NAME_FIELD: (usize, usize) = (48, 32);
const TIME_FIELD: (usize, usize) = (80, 16);
const DATE_FIELD: (usize, usize) = (96, 16);
const IDF_VERSION_FIELD: (usize, usize) = (112, 32);
const ELF_SHA256_FIELD: (usize, usize) = (144, 32);

/// Decoded application descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    /// Anti-rollback security version.
    pub secure_version: u32,
    /// Firmware version string.
    pub version: String,
    /// Project name.
    pub project_name: String,
    /// Compile time.
    pub time: String,
    /// Compile date.
    pub date: String,
    /// SDK version the image was built with.
    pub idf_version: String,
    /// SHA-256 of the application ELF.
    pub elf_sha256: [u8; 32],
}

impl AppDescriptor {
    /// Decode the descriptor from the start of an image.
    ///
    /// # Errors
    ///
    /// Returns an error if `image` is shorter than [`HEADER_SIZE`] or either
    /// magic value is wrong.
    pub fn from_image(image: &[u8]) -> Result<Self, ImageError> {
        if image.len() < HEADER_SIZE {
            return Err(ImageError::TooShort {
                needed: HEADER_SIZE,
                available: image.len(),
            });
        }
        if image[0] != IMAGE_MAGIC {
            return Err(ImageError::BadMagic(image[0]));
        }
        Self::parse(&image[APP_DESC_OFFSET..HEADER_SIZE])
    }

    /// Decode a bare descriptor record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is short or its magic word is wrong.
    pub fn parse(record: &[u8]) -> Result<Self, ImageError> {
        if record.len() < APP_DESC_LEN {
            return Err(ImageError::TooShort {
                needed: APP_DESC_LEN,
                available: record.len(),
            });
        }

        let magic = read_u32(record, 0);
        if magic != APP_DESC_MAGIC {
            return Err(ImageError::BadDescriptorMagic(magic));
        }

        let mut elf_sha256 = [0u8; 32];
        let (offset, len) = ELF_SHA256_FIELD;
        elf_sha256.copy_from_slice(&record[offset..offset + len]);

        Ok(Self {
            secure_version: read_u32(record, 4),
            version: read_cstr(record, VERSION_FIELD),
            project_name: read_cstr(record, PROJECT_NAME_FIELD),
            time: read_cstr(record, TIME_FIELD),
            date: read_cstr(record, DATE_FIELD),
            idf_version: read_cstr(record, IDF_VERSION_FIELD),
            elf_sha256,
        })
    }

    /// Encode the descriptor into its fixed-size record.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; APP_DESC_LEN] {
        let mut record = [0u8; APP_DESC_LEN];
        record[0..4].copy_from_slice(&APP_DESC_MAGIC.to_le_bytes());
        record[4..8].copy_from_slice(&self.secure_version.to_le_bytes());
        write_cstr(&mut record, VERSION_FIELD, &self.version);
        write_cstr(&mut record, PROJECT_NAME_FIELD, &self.project_name);
        write_cstr(&mut record, TIME_FIELD, &self.time);
        write_cstr(&mut record, DATE_FIELD, &self.date);
        write_cstr(&mut record, IDF_VERSION_FIELD, &self.idf_version);
        let (offset, len) = ELF_SHA256_FIELD;
        record[offset..offset + len].copy_from_slice(&self.elf_sha256);
        record
    }

    /// Slot metadata derived from this descriptor.
    #[must_use]
    pub fn metadata(&self) -> SlotMetadata {
        SlotMetadata {
            version: Version::parse(&self.version),
            raw_version: self.version.clone(),
            build_id: hex::encode(self.elf_sha256),
            project_name: self.project_name.clone(),
            compiled_at: format!("{} {}", self.date, self.time),
            sdk_version: self.idf_version.clone(),
        }
    }
}

/// Summary of a verified image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    /// Number of segments.
    pub segments: u8,
    /// Bytes covered by the checksum (and hash, when present).
    pub image_len: usize,
    /// Whether a SHA-256 digest was appended and checked.
    pub hash_checked: bool,
}

/// Verify the checksum and optional appended digest of a complete image.
///
/// Trailing bytes after the image (flash padding) are ignored.
///
/// # Errors
///
/// Returns an error if the image is malformed, truncated, or fails either
/// integrity check.
pub fn verify_image(image: &[u8]) -> Result<ImageSummary, ImageError> {
    if image.len() < IMAGE_HEADER_LEN {
        return Err(ImageError::TooShort {
            needed: IMAGE_HEADER_LEN,
            available: image.len(),
        });
    }
    if image[0] != IMAGE_MAGIC {
        return Err(ImageError::BadMagic(image[0]));
    }
    let segments = image[1];
    if segments > MAX_SEGMENTS {
        return Err(ImageError::TooManySegments(segments));
    }
    let hash_appended = image[HASH_APPENDED_OFFSET] == 1;

    let mut offset = IMAGE_HEADER_LEN;
    let mut computed = CHECKSUM_SEED;
    for _ in 0..segments {
        let header_end = offset + SEGMENT_HEADER_LEN;
        ensure_len(image, header_end)?;
        let data_len = read_u32(image, offset + 4) as usize;
        let data_end = header_end
            .checked_add(data_len)
            .ok_or(ImageError::TooShort {
                needed: usize::MAX,
                available: image.len(),
            })?;
        ensure_len(image, data_end)?;
        computed = image[header_end..data_end]
            .iter()
            .fold(computed, |acc, byte| acc ^ byte);
        offset = data_end;
    }

    let checksum_at = offset + (15 - offset % 16);
    ensure_len(image, checksum_at + 1)?;
    let stored = image[checksum_at];
    if stored != computed {
        return Err(ImageError::ChecksumMismatch { stored, computed });
    }
    let mut image_len = checksum_at + 1;

    if hash_appended {
        ensure_len(image, image_len + HASH_LEN)?;
        let digest = Sha256::digest(&image[..image_len]);
        if digest.as_slice() != &image[image_len..image_len + HASH_LEN] {
            return Err(ImageError::HashMismatch);
        }
        image_len += HASH_LEN;
    }

    Ok(ImageSummary {
        segments,
        image_len,
        hash_checked: hash_appended,
    })
}

/// Assembles well-formed images, for fixtures and local test releases.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    descriptor: AppDescriptor,
    payload: Vec<u8>,
    extra_segments: Vec<Vec<u8>>,
    append_hash: bool,
}

impl ImageBuilder {
    /// Start an image for the given version string.
    #[must_use]
    pub fn new(version: &str) -> Self {
        let mut elf_sha256 = [0u8; 32];
        elf_sha256.copy_from_slice(&Sha256::digest(version.as_bytes()));
        Self {
            descriptor: AppDescriptor {
                secure_version: 0,
                version: version.to_string(),
                project_name: "zeus".to_string(),
                time: "12:00:00".to_string(),
                date: "Jan  1 2025".to_string(),
                idf_version: "v5.1".to_string(),
                elf_sha256,
            },
            payload: Vec::new(),
            extra_segments: Vec::new(),
            append_hash: true,
        }
    }

    /// Application bytes following the descriptor in the first segment.
    #[must_use]
    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// Add another segment.
    #[must_use]
    pub fn segment(mut self, data: &[u8]) -> Self {
        self.extra_segments.push(data.to_vec());
        self
    }

    /// Whether to append a SHA-256 digest (default: yes).
    #[must_use]
    pub fn append_hash(mut self, append: bool) -> Self {
        self.append_hash = append;
        self
    }

    /// Serialise the image.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let mut first = self.descriptor.to_bytes().to_vec();
        first.extend_from_slice(&self.payload);
        let segments: Vec<&[u8]> = std::iter::once(first.as_slice())
            .chain(self.extra_segments.iter().map(Vec::as_slice))
            .collect();

        let mut image = vec![0u8; IMAGE_HEADER_LEN];
        image[0] = IMAGE_MAGIC;
        image[1] = segments.len() as u8;
        image[HASH_APPENDED_OFFSET] = u8::from(self.append_hash);

        let mut checksum = CHECKSUM_SEED;
        for (index, data) in segments.iter().enumerate() {
            let load_addr = 0x3F40_0020_u32 + (index as u32) * 0x1_0000;
            image.extend_from_slice(&load_addr.to_le_bytes());
            image.extend_from_slice(&(data.len() as u32).to_le_bytes());
            image.extend_from_slice(data);
            checksum = data.iter().fold(checksum, |acc, byte| acc ^ byte);
        }

        let padding = 15 - image.len() % 16;
        image.extend(std::iter::repeat(0).take(padding));
        image.push(checksum);

        if self.append_hash {
            let digest = Sha256::digest(&image);
            image.extend_from_slice(&digest);
        }
        image
    }
}

fn ensure_len(image: &[u8], needed: usize) -> Result<(), ImageError> {
    if image.len() < needed {
        return Err(ImageError::TooShort {
            needed,
            available: image.len(),
        });
    }
    Ok(())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn read_cstr(record: &[u8], (offset, len): (usize, usize)) -> String {
    let field = &record[offset..offset + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn write_cstr(record: &mut [u8], (offset, len): (usize, usize), value: &str) {
    // Keep room for the terminating NUL.
    let bytes = value.as_bytes();
    let n = bytes.len().min(len - 1);
    record[offset..offset + n].copy_from_slice(&bytes[..n]);
}
