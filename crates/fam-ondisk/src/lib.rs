#![forbid(unsafe_code)]
//! On-device format for famfs: superblock, log header, log entries and
//! extents.
//!
//! Pure encoding/decoding crate with no I/O. Every structure has a fixed
//! little-endian layout; decoders are bounds-checked and return
//! `ParseError`, and the `validate_*` entry points lift those into
//! `FamError` for callers that work at the device level.

pub mod extent;
pub mod log;
pub mod superblock;

pub use extent::{Extent, InterleavedExtent, SimpleExtent, validate_extent_list};
pub use log::{
    DirCreation, EntryAttrs, FileCreation, LOG_COUNTERS_OFFSET, LogEntry, LogEntryKind, LogHeader,
    LogView, entry_offset, last_index_for, validate_log_len, validate_relpath,
};
pub use superblock::{DeviceInfo, Superblock};

use fam_error::FamError;
use fam_types::ParseError;

/// Convert a `ParseError` into the user-facing `FamError`.
///
/// Magic, version and checksum failures keep their identity so callers can
/// report exactly which structural check failed.
#[must_use]
pub fn parse_error_to_fam(e: &ParseError) -> FamError {
    match e {
        ParseError::InvalidMagic { expected, actual } => FamError::BadMagic {
            structure: magic_owner(*expected),
            expected: *expected,
            actual: *actual,
        },
        ParseError::UnsupportedVersion { expected, actual } => FamError::BadVersion {
            expected: *expected,
            actual: *actual,
        },
        ParseError::ChecksumMismatch {
            structure,
            stored,
            computed,
        } => FamError::BadCrc {
            structure: *structure,
            stored: *stored,
            computed: *computed,
        },
        ParseError::InvalidField { field, reason } => {
            if *field == "relpath" {
                FamError::InvalidInput(format!("{field}: {reason}"))
            } else {
                FamError::Format(e.to_string())
            }
        }
        ParseError::InsufficientData { offset, .. } => FamError::Corruption {
            offset: *offset as u64,
            detail: e.to_string(),
        },
        ParseError::IntegerConversion { .. } => FamError::Corruption {
            offset: 0,
            detail: e.to_string(),
        },
    }
}

fn magic_owner(expected: u64) -> &'static str {
    if expected == fam_types::FAMFS_LOG_MAGIC {
        "log"
    } else {
        "superblock"
    }
}

/// Validate a superblock region: `BadMagic`, `BadVersion` or `BadCrc` on
/// failure (checked in that order).
pub fn validate_superblock(region: &[u8]) -> fam_error::Result<Superblock> {
    Superblock::parse_validated(region).map_err(|e| parse_error_to_fam(&e))
}

/// Validate a log header: `BadMagic` or `BadCrc` on failure.
pub fn validate_log_header(log: &[u8]) -> fam_error::Result<LogHeader> {
    LogHeader::parse_validated(log).map_err(|e| parse_error_to_fam(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_types::{FAMFS_LOG_LEN, FamUuid, GIB};

    #[test]
    fn structural_errors_keep_identity() {
        let mut sb = Superblock::new(
            FamUuid([3; 16]),
            FamUuid([4; 16]),
            FAMFS_LOG_LEN,
            DeviceInfo {
                name: "/dev/dax0.0".into(),
                size: GIB,
            },
        );
        let mut bytes = sb.encode().unwrap();
        validate_superblock(&bytes).unwrap();

        bytes[0] ^= 0xFF;
        assert!(matches!(
            validate_superblock(&bytes),
            Err(FamError::BadMagic {
                structure: "superblock",
                ..
            })
        ));
        bytes[0] ^= 0xFF;
        bytes[8] = 1;
        assert!(matches!(
            validate_superblock(&bytes),
            Err(FamError::BadVersion { actual: 1, .. })
        ));

        let mut log = LogHeader::new(FAMFS_LOG_LEN).unwrap().encode().unwrap();
        validate_log_header(&log).unwrap();
        log[0] ^= 0xFF;
        assert!(matches!(
            validate_log_header(&log),
            Err(FamError::BadMagic {
                structure: "log",
                ..
            })
        ));
    }

    #[test]
    fn relpath_errors_are_invalid_input() {
        let err = validate_relpath("/abs").unwrap_err();
        assert!(matches!(
            parse_error_to_fam(&err),
            FamError::InvalidInput(_)
        ));
    }

    #[test]
    fn truncation_is_corruption() {
        let err = validate_log_header(&[0_u8; 10]).unwrap_err();
        assert!(matches!(err, FamError::Corruption { .. }));
    }
}
