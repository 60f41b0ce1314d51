#![forbid(unsafe_code)]
//! Error types for hammer2-rs.
//!
//! # Error Taxonomy
//!
//! hammer2-rs uses three layers:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `h2-types` | On-disk format violations detected during byte parsing |
//! | Engine | [`ErrorFlags`] | `h2-error` (this crate) | Composable bits carried on chains, cluster slots and XOP results |
//! | Runtime | [`H2Error`] | `h2-error` (this crate) | User-facing errors for the CLI and API consumers |
//!
//! Engine errors are bit flags because a single chain can accumulate more than
//! one condition (an I/O error on one member and a check failure on another
//! merge into one cluster error). They are sticky on the chain that produced
//! them and surface to whichever caller locks that chain next.
//!
//! ## Mapping Policy: ErrorFlags → H2Error
//!
//! `H2Error::Chain(flags)` wraps engine bits at API boundaries. `ENOENT` is the
//! ordinary end-of-iteration signal inside the engine; frontends translate it
//! to [`H2Error::NotFound`] with the name that was looked up. `EAGAIN` marks a
//! structural race that the chain engine retries internally and should never
//! be observed outside it. `ABORTED` means the XOP frontend detached; backends
//! stop feeding and it is not a failure.
//!
//! ## errno Mapping
//!
//! Every `H2Error` variant maps to exactly one POSIX errno via
//! [`H2Error::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw os error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `Checksum` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `UnsupportedFeature` | `EOPNOTSUPP` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `InvalidArgument` | `EINVAL` |
//! | `ReadOnly` | `EROFS` |
//! | `Chain` | [`ErrorFlags::to_errno`] |
//!
//! ## Design Constraints
//!
//! - `h2-error` MUST NOT depend on `h2-types` or `h2-ondisk`.
//! - The `ParseError` → `H2Error` conversion lives in `h2-core`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

bitflags! {
    /// Engine error bits.
    ///
    /// Zero means success. Values compose with `|` when results from several
    /// cluster members or several lookups are merged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ErrorFlags: u32 {
        /// Media I/O failure.
        const EIO         = 0x0000_0001;
        /// Check code mismatch on loaded media.
        const CHECK       = 0x0000_0002;
        /// Cluster could not be fully resolved.
        const INCOMPLETE  = 0x0000_0004;
        /// Recursion depth limit reached.
        const DEPTH       = 0x0000_0008;
        /// Blockref failed structural validation.
        const BADBREF     = 0x0000_0010;
        const ENOSPC      = 0x0000_0020;
        /// Not found; also the normal end-of-iteration marker.
        const ENOENT      = 0x0000_0040;
        const ENOTEMPTY   = 0x0000_0080;
        /// Structural race, retried internally.
        const EAGAIN      = 0x0000_0100;
        const ENOTDIR     = 0x0000_0200;
        const EISDIR      = 0x0000_0400;
        /// Operation still has pending results.
        const EINPROGRESS = 0x0000_0800;
        /// Frontend detached from the operation.
        const ABORTED     = 0x0000_1000;
        const EEXIST      = 0x0000_2000;
        const EINVAL      = 0x0000_4000;
        const EOPNOTSUPP  = 0x0000_8000;
    }
}

impl ErrorFlags {
    /// Bits that indicate damaged or unreadable media.
    pub const MEDIA: Self = Self::EIO.union(Self::CHECK).union(Self::BADBREF);

    /// True when no error bit is set.
    #[must_use]
    pub fn is_ok(self) -> bool {
        self.is_empty()
    }

    /// Convert to a `Result`, keeping the flags as the error payload.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }

    /// Map the most significant bit to a POSIX errno.
    ///
    /// Media errors win over logical ones so a damaged lookup is never
    /// reported as a plain miss.
    #[must_use]
    pub fn to_errno(self) -> libc::c_int {
        if self.is_empty() {
            0
        } else if self.intersects(Self::MEDIA | Self::INCOMPLETE | Self::DEPTH) {
            libc::EIO
        } else if self.contains(Self::ENOSPC) {
            libc::ENOSPC
        } else if self.contains(Self::ENOTDIR) {
            libc::ENOTDIR
        } else if self.contains(Self::EISDIR) {
            libc::EISDIR
        } else if self.contains(Self::ENOTEMPTY) {
            libc::ENOTEMPTY
        } else if self.contains(Self::EEXIST) {
            libc::EEXIST
        } else if self.contains(Self::EINVAL) {
            libc::EINVAL
        } else if self.contains(Self::EOPNOTSUPP) {
            libc::EOPNOTSUPP
        } else if self.contains(Self::ENOENT) {
            libc::ENOENT
        } else if self.contains(Self::EAGAIN) {
            libc::EAGAIN
        } else if self.contains(Self::EINPROGRESS) {
            libc::EINPROGRESS
        } else {
            libc::EINTR
        }
    }
}

impl fmt::Display for ErrorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("ok");
        }
        bitflags::parser::to_writer(self, f)
    }
}

/// Unified error type for all hammer2-rs operations.
#[derive(Debug, Error)]
pub enum H2Error {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known physical offset.
    #[error("corrupt metadata at offset {offset:#x}: {detail}")]
    Corruption { offset: u64, detail: String },

    /// A loaded block failed its check code.
    #[error("check code mismatch at offset {offset:#x}")]
    Checksum { offset: u64 },

    /// Invalid on-disk format (bad magic, unsupported version).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the user.
    #[error("parse error: {0}")]
    Parse(String),

    /// The image uses a feature this build does not support.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Filename exceeds the 256 byte name limit.
    #[error("name too long")]
    NameTooLong,

    /// Caller passed an argument the engine cannot honor.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A write was attempted against the read-only engine.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Engine error bits from a chain, cluster or XOP.
    #[error("chain error: {0}")]
    Chain(ErrorFlags),
}

impl H2Error {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::Checksum { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::UnsupportedFeature(_) => libc::EOPNOTSUPP,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::ReadOnly => libc::EROFS,
            Self::Chain(flags) => flags.to_errno(),
        }
    }

    /// Engine bits equivalent to this error, for merging into cluster state.
    #[must_use]
    pub fn to_flags(&self) -> ErrorFlags {
        match self {
            Self::Chain(flags) => *flags,
            Self::Io(_) => ErrorFlags::EIO,
            Self::Corruption { .. } => ErrorFlags::EIO | ErrorFlags::BADBREF,
            Self::Checksum { .. } => ErrorFlags::CHECK,
            Self::Format(_) | Self::Parse(_) | Self::InvalidArgument(_) | Self::NameTooLong => {
                ErrorFlags::EINVAL
            }
            Self::UnsupportedFeature(_) | Self::ReadOnly => ErrorFlags::EOPNOTSUPP,
            Self::NotFound(_) => ErrorFlags::ENOENT,
            Self::NotDirectory => ErrorFlags::ENOTDIR,
            Self::IsDirectory => ErrorFlags::EISDIR,
        }
    }
}

impl From<ErrorFlags> for H2Error {
    fn from(flags: ErrorFlags) -> Self {
        Self::Chain(flags)
    }
}

/// Result alias using `H2Error`.
pub type Result<T> = std::result::Result<T, H2Error>;
