#![forbid(unsafe_code)]
//! Shared constants, unit-carrying newtypes and byte-level parse helpers for
//! the famfs on-device format.
//!
//! Nothing in this crate performs I/O. Higher crates (`fam-ondisk`,
//! `fam-alloc`, `fam-extent`) build on these definitions so that every
//! reader and writer of a deployment agrees on one layout.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

// ── Geometry ────────────────────────────────────────────────────────────────

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Platform page size assumed by interleaved chunk validation.
pub const PAGE_SIZE: u64 = 4 * KIB;

/// Allocation granularity. Matches PMD huge-page size so DAX faults stay
/// huge-page capable.
pub const FAMFS_ALLOC_UNIT: u64 = 2 * MIB;

/// Bytes reserved for the superblock region at device offset 0.
pub const FAMFS_SUPERBLOCK_SIZE: u64 = 2 * MIB;

/// Bytes of the superblock region that hold the encoded structure.
pub const FAMFS_SUPERBLOCK_STRUCT_SIZE: usize = 4096;

/// The log always starts right after the superblock region.
pub const FAMFS_LOG_OFFSET: u64 = FAMFS_SUPERBLOCK_SIZE;

/// Default log length chosen by mkfs.
pub const FAMFS_LOG_LEN: u64 = 8 * MIB;

/// Size of the log header slot; entries start immediately after it.
pub const FAMFS_LOG_HEADER_SIZE: usize = 2048;

/// Fixed stride of one log entry slot.
pub const FAMFS_LOG_ENTRY_SIZE: usize = 2048;

pub const FAMFS_SUPER_MAGIC: u64 = 0x0000_0000_0921_1963;
pub const FAMFS_LOG_MAGIC: u64 = 0x0000_0bad_caff_ee00;

/// On-device format version. Readers accept exactly this version.
pub const FAMFS_CURRENT_VERSION: u32 = 47;

/// Relative paths must be strictly shorter than this (the slot is NUL padded).
pub const FAMFS_MAX_PATHLEN: usize = 128;

/// Maximum number of extents carried by one log entry.
pub const FAMFS_MAX_EXTENTS: usize = 8;

/// Maximum number of strips in one interleaved extent.
pub const FAMFS_MAX_STRIPS: usize = 8;

/// Maximum number of backing devices listed in the superblock.
pub const FAMFS_MAX_DEVICES: usize = 8;

/// Bytes reserved for each device name in the superblock.
pub const FAMFS_DEVNAME_LEN: usize = 64;

/// Smallest log that can hold at least one entry.
pub const FAMFS_MIN_LOG_LEN: u64 = (FAMFS_LOG_HEADER_SIZE + FAMFS_LOG_ENTRY_SIZE) as u64;

// ── File types ──────────────────────────────────────────────────────────────

/// Kind of file backed by an extent list.
///
/// `Superblock` and `Log` are sentinels for the two meta files that exist
/// in every instance and are never created through the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    Superblock,
    Log,
}

impl FileType {
    #[must_use]
    pub fn to_raw(self) -> u32 {
        match self {
            Self::Regular => 0,
            Self::Superblock => 1,
            Self::Log => 2,
        }
    }

    pub fn from_raw(raw: u32) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Regular),
            1 => Ok(Self::Superblock),
            2 => Ok(Self::Log),
            _ => Err(ParseError::InvalidField {
                field: "file_type",
                reason: "unknown file type",
            }),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regular => write!(f, "regular"),
            Self::Superblock => write!(f, "superblock"),
            Self::Log => write!(f, "log"),
        }
    }
}

// ── Identifiers ─────────────────────────────────────────────────────────────

/// 128-bit identifier stored raw in the superblock (file-system UUID and
/// owning-host system UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct FamUuid(pub [u8; 16]);

impl FamUuid {
    pub const NIL: Self = Self([0; 16]);

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0 == [0; 16]
    }

    /// Generate a fresh identifier from the wall clock, the process id and a
    /// caller-provided seed (typically a device path).
    ///
    /// The version/variant nibbles are set as for an RFC 4122 v4 UUID so the
    /// value round-trips through other tooling.
    #[must_use]
    pub fn generate(seed: &[u8]) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        let mut hasher = blake3::Hasher::new();
        hasher.update(&nanos.to_le_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        hasher.update(seed);
        let digest = hasher.finalize();
        let mut bytes = [0_u8; 16];
        bytes.copy_from_slice(&digest.as_bytes()[..16]);
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        Self(bytes)
    }
}

impl fmt::Display for FamUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for FamUuid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: Vec<u8> = s.trim().bytes().filter(|b| *b != b'-').collect();
        if hex.len() != 32 {
            return Err(ParseError::InvalidField {
                field: "uuid",
                reason: "expected 32 hex digits",
            });
        }
        let mut out = [0_u8; 16];
        for (i, pair) in hex.chunks_exact(2).enumerate() {
            let hi = hex_digit(pair[0])?;
            let lo = hex_digit(pair[1])?;
            out[i] = (hi << 4) | lo;
        }
        Ok(Self(out))
    }
}

fn hex_digit(c: u8) -> Result<u8, ParseError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(ParseError::InvalidField {
            field: "uuid",
            reason: "non-hex digit",
        }),
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("unsupported version: expected {expected}, got {actual}")]
    UnsupportedVersion { expected: u32, actual: u32 },
    #[error("{structure} checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        structure: &'static str,
        stored: u32,
        computed: u32,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Little-endian readers / writers ─────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let available = data.len();
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > available {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: available.saturating_sub(offset),
        });
    }
    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Copy `src` into a NUL-padded field of `len` bytes at `offset`.
///
/// Fails if `src` does not leave room for at least one terminating NUL.
pub fn write_nul_padded(
    data: &mut [u8],
    offset: usize,
    len: usize,
    src: &[u8],
    field: &'static str,
) -> Result<(), ParseError> {
    if src.len() >= len {
        return Err(ParseError::InvalidField {
            field,
            reason: "string does not fit its fixed-size field",
        });
    }
    let dst = ensure_slice_mut(data, offset, len)?;
    dst.fill(0);
    dst[..src.len()].copy_from_slice(src);
    Ok(())
}

/// Bytes of a NUL-padded field up to (not including) the first NUL.
#[must_use]
pub fn nul_terminated(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    String::from_utf8_lossy(nul_terminated(bytes)).trim().to_owned()
}

// ── Checked arithmetic helpers ──────────────────────────────────────────────

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

#[must_use]
pub fn is_unit_aligned(value: u64) -> bool {
    value % FAMFS_ALLOC_UNIT == 0
}

/// Number of allocation units needed to cover `bytes`.
#[must_use]
pub fn units_for_bytes(bytes: u64) -> u64 {
    bytes.div_ceil(FAMFS_ALLOC_UNIT)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}
