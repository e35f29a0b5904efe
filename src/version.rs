//! Firmware version grammar and ordering.
//!
//! Release tags look like `v1.4.2`, `1.4.2-rc.3` or `1.4.2-12-gdeadbee-dirty`.
//! Parsing is permissive: it never fails, and missing segments read as zero
//! or empty. Release names come from a controlled pipeline, so a sloppy tag
//! should degrade into a comparable value rather than block updates.
//!
//! ## Known limitation
//!
//! Prerelease tags are ordered as raw byte strings, not by a precedence list.
//! `"alpha" < "beta" < "rc"` happens to hold, but an untagged release sorts
//! *below* any tagged build of the same triple (`""` < `"beta"`), and
//! `"RC"` sorts below `"alpha"`.

use std::cmp::Ordering;
use std::fmt;

/// Maximum stored length of a prerelease tag, in bytes.
pub const MAX_PRERELEASE_TAG_LEN: usize = 32;

/// Marker in a prerelease tag for builds from an unclean source tree.
pub const DIRTY_MARKER: &str = "dirty";

/// A parsed firmware version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
    /// Text between `-` and the next `.`, at most 32 bytes.
    pub prerelease_tag: String,
    /// Number following the prerelease tag.
    pub prerelease_number: u32,
}

/// Outcome of comparing a candidate version against the running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDirection {
    /// The candidate is newer.
    Upgrade,
    /// The candidate is older, or the running build is dirty.
    Downgrade,
    /// Both versions are identical.
    NoChange,
}

impl From<Ordering> for UpdateDirection {
    fn from(ordering: Ordering) -> Self {
        match ordering {
            Ordering::Greater => Self::Upgrade,
            Ordering::Less => Self::Downgrade,
            Ordering::Equal => Self::NoChange,
        }
    }
}

impl fmt::Display for UpdateDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upgrade => write!(f, "upgrade"),
            Self::Downgrade => write!(f, "downgrade"),
            Self::NoChange => write!(f, "no change"),
        }
    }
}

/// Cursor over the version text. Never indexes past the end.
struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn is_done(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    /// Skip any non-digit prefix, then read a run of digits.
    fn number(&mut self) -> u32 {
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() && !bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }

        let mut value: u32 = 0;
        while let Some(digit) = bytes.get(self.pos).filter(|b| b.is_ascii_digit()) {
            value = value
                .saturating_mul(10)
                .saturating_add(u32::from(digit - b'0'));
            self.pos += 1;
        }
        value
    }

    /// Read everything up to the next `.` or the end.
    fn segment(&mut self) -> &'a str {
        let rest = &self.text[self.pos..];
        let len = rest.find('.').unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }
}

impl Version {
    /// Create a release version without prerelease information.
    #[must_use]
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            ..Self::default()
        }
    }

    /// Parse a version string. Never fails; absent fields stay zero/empty.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut version = Self::default();
        let mut scanner = Scanner::new(text);

        version.major = scanner.number();
        if scanner.is_done() {
            return version;
        }
        version.minor = scanner.number();
        if scanner.is_done() {
            return version;
        }
        version.patch = scanner.number();

        if scanner.peek() != Some(b'-') {
            return version;
        }
        scanner.pos += 1;
        version.prerelease_tag = truncate_tag(scanner.segment());

        if scanner.is_done() {
            return version;
        }
        version.prerelease_number = scanner.number();
        version
    }

    /// Whether this is a build from an unclean source tree.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.prerelease_tag.contains(DIRTY_MARKER)
    }

    /// Compare `self` as a candidate against the running `reference`.
    ///
    /// A dirty reference always yields [`UpdateDirection::Downgrade`]: a
    /// locally modified build is never treated as the baseline for an
    /// automatic upgrade.
    #[must_use]
    pub fn compare(&self, reference: &Self) -> UpdateDirection {
        if reference.is_dirty() {
            return UpdateDirection::Downgrade;
        }

        (self.major, self.minor, self.patch)
            .cmp(&(reference.major, reference.minor, reference.patch))
            .then_with(|| {
                self.prerelease_tag
                    .as_bytes()
                    .cmp(reference.prerelease_tag.as_bytes())
            })
            .then_with(|| self.prerelease_number.cmp(&reference.prerelease_number))
            .into()
    }
}

/// Compare two version strings, `candidate` against `reference`.
#[must_use]
pub fn compare(candidate: &str, reference: &str) -> UpdateDirection {
    Version::parse(candidate).compare(&Version::parse(reference))
}

fn truncate_tag(tag: &str) -> String {
    if tag.len() <= MAX_PRERELEASE_TAG_LEN {
        return tag.to_string();
    }
    let mut end = MAX_PRERELEASE_TAG_LEN;
    while !tag.is_char_boundary(end) {
        end -= 1;
    }
    tag[..end].to_string()
}

impl From<&str> for Version {
    fn from(text: &str) -> Self {
        Self::parse(text)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.prerelease_tag.is_empty() {
            write!(f, "-{}", self.prerelease_tag)?;
            if self.prerelease_number > 0 {
                write!(f, ".{}", self.prerelease_number)?;
            }
        }
        Ok(())
    }
}
