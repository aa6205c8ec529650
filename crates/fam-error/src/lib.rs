#![forbid(unsafe_code)]
//! Error types for famfs.
//!
//! # Error Taxonomy
//!
//! famfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `fam-types` | Format violations detected while decoding bytes |
//! | Runtime | `FamError` | `fam-error` (this crate) | User-facing errors for the CLI and library callers |
//!
//! ## Mapping Policy: ParseError → FamError
//!
//! `fam-error` is independent of `fam-types` and `fam-ondisk` to avoid
//! cyclic dependencies. The conversion lives in `fam-ondisk`
//! (`parse_error_to_fam`), the first crate that sees both types.
//!
//! | ParseError Variant | FamError Variant |
//! |--------------------|------------------|
//! | `InvalidMagic` | `BadMagic` |
//! | `UnsupportedVersion` | `BadVersion` |
//! | `ChecksumMismatch` | `BadCrc` |
//! | `InsufficientData` / `IntegerConversion` | `Corruption` |
//! | `InvalidField` | `Format` |
//!
//! ## Error classes
//!
//! - Structural (`BadMagic`, `BadVersion`, `BadCrc`, `Corruption`,
//!   `Format`): the caller must not proceed with the region.
//! - Capacity (`NoSpace`, `LogFull`): ordinary, recoverable by the caller.
//! - Concurrency and permission (`WouldBlock`, `NotLogOwner`): returned
//!   immediately, nothing was modified.
//! - Programmer contract (`InvalidState`, `InvalidInput`): misuse of an API.
//!
//! ## errno Mapping
//!
//! Every `FamError` variant maps to exactly one POSIX errno via
//! [`FamError::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` / `BadMagic` / `BadVersion` / `BadCrc` | `EIO` |
//! | `Format` / `Parse` / `InvalidInput` | `EINVAL` |
//! | `NoSpace` / `LogFull` | `ENOSPC` |
//! | `WouldBlock` | `EWOULDBLOCK` |
//! | `NotLogOwner` / `ReadOnly` | `EROFS` |
//! | `InvalidState` | `EBADF` |
//! | `SuperblockExists` / `Exists` | `EEXIST` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `PermissionDenied` | `EACCES` |
//! | `NameTooLong` | `ENAMETOOLONG` |

use thiserror::Error;

/// Unified error type for all famfs operations.
#[derive(Debug, Error)]
pub enum FamError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata that decodes but is internally inconsistent or truncated.
    #[error("corrupt metadata at offset {offset:#x}: {detail}")]
    Corruption { offset: u64, detail: String },

    /// Structurally invalid on-disk format.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without further context.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("bad {structure} magic: expected {expected:#x}, found {actual:#x}")]
    BadMagic {
        structure: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("unsupported format version {actual} (expected {expected})")]
    BadVersion { expected: u32, actual: u32 },

    #[error("bad {structure} crc: stored {stored:#010x}, computed {computed:#010x}")]
    BadCrc {
        structure: &'static str,
        stored: u32,
        computed: u32,
    },

    /// No run of free allocation units large enough for the request.
    #[error("no space left on device (requested {requested} bytes)")]
    NoSpace { requested: u64 },

    /// Every log slot is in use.
    #[error("log full ({capacity} entries)")]
    LogFull { capacity: u64 },

    /// A non-blocking lock attempt found the log already locked.
    #[error("log is locked by another process")]
    WouldBlock,

    /// This host does not own the log and may not append to it.
    #[error("not the log owner: this host is a read-only client")]
    NotLogOwner,

    /// Operation issued in the wrong session state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Caller-supplied argument rejected (bad path, zero size, ...).
    #[error("invalid argument: {0}")]
    InvalidInput(String),

    /// mkfs found a valid superblock and was not told to overwrite it.
    #[error("valid superblock already present on {0} (use --force to overwrite)")]
    SuperblockExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists: {0}")]
    Exists(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("read-only filesystem")]
    ReadOnly,

    #[error("name too long")]
    NameTooLong,
}

impl FamError {
    /// Convert this error into a POSIX errno.
    ///
    /// - `LogFull` → `ENOSPC`: a full log is out of metadata space.
    /// - `NotLogOwner` → `EROFS`: clients see the instance read-only.
    /// - `InvalidState` → `EBADF`: the session handle is not usable.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. }
            | Self::BadMagic { .. }
            | Self::BadVersion { .. }
            | Self::BadCrc { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidInput(_) => libc::EINVAL,
            Self::NoSpace { .. } | Self::LogFull { .. } => libc::ENOSPC,
            Self::WouldBlock => libc::EWOULDBLOCK,
            Self::NotLogOwner | Self::ReadOnly => libc::EROFS,
            Self::InvalidState(_) => libc::EBADF,
            Self::SuperblockExists(_) | Self::Exists(_) => libc::EEXIST,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory(_) => libc::ENOTDIR,
            Self::PermissionDenied => libc::EACCES,
            Self::NameTooLong => libc::ENAMETOOLONG,
        }
    }

    /// True for errors that mean the on-disk structures cannot be trusted.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Corruption { .. }
                | Self::Format(_)
                | Self::BadMagic { .. }
                | Self::BadVersion { .. }
                | Self::BadCrc { .. }
        )
    }
}

/// Result alias using `FamError`.
pub type Result<T> = std::result::Result<T, FamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FamError, libc::c_int)> = vec![
            (FamError::Io(std::io::Error::other("test")), libc::EIO),
            (
                FamError::Corruption {
                    offset: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (FamError::Format("test".into()), libc::EINVAL),
            (FamError::Parse("test".into()), libc::EINVAL),
            (
                FamError::BadMagic {
                    structure: "superblock",
                    expected: 1,
                    actual: 2,
                },
                libc::EIO,
            ),
            (
                FamError::BadVersion {
                    expected: 47,
                    actual: 46,
                },
                libc::EIO,
            ),
            (
                FamError::BadCrc {
                    structure: "log header",
                    stored: 1,
                    computed: 2,
                },
                libc::EIO,
            ),
            (FamError::NoSpace { requested: 1 }, libc::ENOSPC),
            (FamError::LogFull { capacity: 4 }, libc::ENOSPC),
            (FamError::WouldBlock, libc::EWOULDBLOCK),
            (FamError::NotLogOwner, libc::EROFS),
            (FamError::InvalidState("closed".into()), libc::EBADF),
            (FamError::InvalidInput("size 0".into()), libc::EINVAL),
            (FamError::SuperblockExists("/dev/dax0.0".into()), libc::EEXIST),
            (FamError::NotFound("a".into()), libc::ENOENT),
            (FamError::Exists("a".into()), libc::EEXIST),
            (FamError::NotDirectory("a".into()), libc::ENOTDIR),
            (FamError::PermissionDenied, libc::EACCES),
            (FamError::ReadOnly, libc::EROFS),
            (FamError::NameTooLong, libc::ENAMETOOLONG),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(FamError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = FamError::BadCrc {
            structure: "superblock",
            stored: 0xdead_beef,
            computed: 0x1234_5678,
        };
        assert_eq!(
            err.to_string(),
            "bad superblock crc: stored 0xdeadbeef, computed 0x12345678"
        );
        assert_eq!(
            FamError::LogFull { capacity: 3 }.to_string(),
            "log full (3 entries)"
        );
        assert!(
            FamError::SuperblockExists("/dev/pmem0".into())
                .to_string()
                .contains("--force")
        );
    }

    #[test]
    fn structural_classification() {
        assert!(FamError::BadVersion { expected: 1, actual: 2 }.is_structural());
        assert!(!FamError::WouldBlock.is_structural());
        assert!(!FamError::NoSpace { requested: 0 }.is_structural());
    }
}
