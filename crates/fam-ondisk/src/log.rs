//! Log header, log entries and a snapshot reader over the log region.
//!
//! The log is a header slot followed by fixed-stride entry slots:
//!
//! ```text
//! [ header 2048 ][ entry 0 ][ entry 1 ] ... [ entry last_index ]
//! ```
//!
//! Entries are append-only. `next_index` counts the valid entries; readers
//! snapshot it once and never look past it.

use crate::extent::{EXTENT_SLOT_SIZE, Extent, validate_extent_list};
use fam_types::{
    FAMFS_ALLOC_UNIT, FAMFS_LOG_ENTRY_SIZE, FAMFS_LOG_HEADER_SIZE, FAMFS_LOG_MAGIC,
    FAMFS_MAX_EXTENTS, FAMFS_MAX_PATHLEN, FAMFS_MIN_LOG_LEN, ParseError, ensure_slice,
    nul_terminated, read_le_u32, read_le_u64, u64_to_usize, write_le_u32, write_le_u64,
    write_nul_padded,
};
use serde::{Deserialize, Serialize};

// ── Header ──────────────────────────────────────────────────────────────────

const HDR_MAGIC: usize = 0;
const HDR_LEN: usize = 8;
const HDR_CRC: usize = 16;
const HDR_NEXT_SEQNUM: usize = 24;
const HDR_NEXT_INDEX: usize = 32;
const HDR_LAST_INDEX: usize = 40;

/// Byte offset (within the log) of the `next_seqnum`/`next_index` pair that
/// the append path rewrites.
pub const LOG_COUNTERS_OFFSET: u64 = HDR_NEXT_SEQNUM as u64;

/// Highest usable entry index for a log of `log_len` bytes.
#[must_use]
pub fn last_index_for(log_len: u64) -> Option<u64> {
    let slots = log_len.checked_sub(FAMFS_LOG_HEADER_SIZE as u64)? / FAMFS_LOG_ENTRY_SIZE as u64;
    slots.checked_sub(1)
}

/// Log lengths must hold at least one entry and keep the data region unit
/// aligned.
pub fn validate_log_len(log_len: u64) -> Result<(), ParseError> {
    if log_len < FAMFS_MIN_LOG_LEN {
        return Err(ParseError::InvalidField {
            field: "log_len",
            reason: "too small to hold one entry",
        });
    }
    if log_len % FAMFS_ALLOC_UNIT != 0 {
        return Err(ParseError::InvalidField {
            field: "log_len",
            reason: "not a multiple of the allocation unit",
        });
    }
    Ok(())
}

/// Byte offset of entry `index` within the log.
#[must_use]
pub fn entry_offset(index: u64) -> Option<u64> {
    index
        .checked_mul(FAMFS_LOG_ENTRY_SIZE as u64)?
        .checked_add(FAMFS_LOG_HEADER_SIZE as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogHeader {
    pub magic: u64,
    pub len: u64,
    pub crc: u32,
    pub next_seqnum: u64,
    pub next_index: u64,
    pub last_index: u64,
}

impl LogHeader {
    /// A fresh, empty header for a log of `log_len` bytes.
    pub fn new(log_len: u64) -> Result<Self, ParseError> {
        validate_log_len(log_len)?;
        let last_index = last_index_for(log_len).ok_or(ParseError::InvalidField {
            field: "log_len",
            reason: "too small to hold one entry",
        })?;
        let mut hdr = Self {
            magic: FAMFS_LOG_MAGIC,
            len: log_len,
            crc: 0,
            next_seqnum: 0,
            next_index: 0,
            last_index,
        };
        hdr.crc = hdr.compute_crc();
        Ok(hdr)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, FAMFS_LOG_HEADER_SIZE)?;
        Ok(Self {
            magic: read_le_u64(bytes, HDR_MAGIC)?,
            len: read_le_u64(bytes, HDR_LEN)?,
            crc: read_le_u32(bytes, HDR_CRC)?,
            next_seqnum: read_le_u64(bytes, HDR_NEXT_SEQNUM)?,
            next_index: read_le_u64(bytes, HDR_NEXT_INDEX)?,
            last_index: read_le_u64(bytes, HDR_LAST_INDEX)?,
        })
    }

    /// Decode and validate (magic, then CRC, then index bounds).
    pub fn parse_validated(bytes: &[u8]) -> Result<Self, ParseError> {
        let hdr = Self::parse(bytes)?;
        hdr.validate()?;
        Ok(hdr)
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        if self.magic != FAMFS_LOG_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: FAMFS_LOG_MAGIC,
                actual: self.magic,
            });
        }
        let computed = self.compute_crc();
        if computed != self.crc {
            return Err(ParseError::ChecksumMismatch {
                structure: "log header",
                stored: self.crc,
                computed,
            });
        }
        if last_index_for(self.len) != Some(self.last_index) {
            return Err(ParseError::InvalidField {
                field: "last_index",
                reason: "inconsistent with log length",
            });
        }
        if self.next_index > self.capacity() {
            return Err(ParseError::InvalidField {
                field: "next_index",
                reason: "beyond last_index + 1",
            });
        }
        Ok(())
    }

    /// crc32c over the static fields (`magic`, `len`, `last_index`).
    #[must_use]
    pub fn compute_crc(&self) -> u32 {
        let mut crc = crc32c::crc32c(&self.magic.to_le_bytes());
        crc = crc32c::crc32c_append(crc, &self.len.to_le_bytes());
        crc32c::crc32c_append(crc, &self.last_index.to_le_bytes())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let mut buf = vec![0_u8; FAMFS_LOG_HEADER_SIZE];
        write_le_u64(&mut buf, HDR_MAGIC, self.magic)?;
        write_le_u64(&mut buf, HDR_LEN, self.len)?;
        write_le_u32(&mut buf, HDR_CRC, self.crc)?;
        write_le_u64(&mut buf, HDR_LAST_INDEX, self.last_index)?;
        buf[HDR_NEXT_SEQNUM..HDR_LAST_INDEX].copy_from_slice(&self.encode_counters());
        Ok(buf)
    }

    /// The `next_seqnum`/`next_index` pair as written by an append, to be
    /// placed at [`LOG_COUNTERS_OFFSET`].
    #[must_use]
    pub fn encode_counters(&self) -> [u8; 16] {
        let mut out = [0_u8; 16];
        out[..8].copy_from_slice(&self.next_seqnum.to_le_bytes());
        out[8..].copy_from_slice(&self.next_index.to_le_bytes());
        out
    }

    /// Number of entry slots.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.last_index.saturating_add(1)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.next_index > self.last_index
    }
}

// ── Entries ─────────────────────────────────────────────────────────────────

const ENT_SEQNUM: usize = 0;
const ENT_TYPE: usize = 8;
const ENT_CRC: usize = 12;
const ENT_FLAGS: usize = 16;
const ENT_MODE: usize = 20;
const ENT_UID: usize = 24;
const ENT_GID: usize = 28;
const ENT_SIZE: usize = 32;
const ENT_EXTENT_COUNT: usize = 40;
const ENT_RELPATH: usize = 48;
const ENT_EXTENTS: usize = ENT_RELPATH + FAMFS_MAX_PATHLEN;

const TYPE_FILE: u32 = 1;
const TYPE_MKDIR: u32 = 2;
const TYPE_ACCESS: u32 = 3;

/// Ownership and permission bits recorded with every created object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryAttrs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCreation {
    pub relpath: String,
    pub size: u64,
    pub flags: u32,
    pub attrs: EntryAttrs,
    pub extents: Vec<Extent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirCreation {
    pub relpath: String,
    pub attrs: EntryAttrs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntryKind {
    File(FileCreation),
    Mkdir(DirCreation),
    /// Reserved; decoded and otherwise ignored.
    Access,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Stamped by the append path; ignored on encode input.
    pub seqnum: u64,
    pub kind: LogEntryKind,
}

impl LogEntry {
    #[must_use]
    pub fn file(file: FileCreation) -> Self {
        Self {
            seqnum: 0,
            kind: LogEntryKind::File(file),
        }
    }

    #[must_use]
    pub fn mkdir(dir: DirCreation) -> Self {
        Self {
            seqnum: 0,
            kind: LogEntryKind::Mkdir(dir),
        }
    }

    #[must_use]
    pub fn relpath(&self) -> Option<&str> {
        match &self.kind {
            LogEntryKind::File(f) => Some(&f.relpath),
            LogEntryKind::Mkdir(d) => Some(&d.relpath),
            LogEntryKind::Access => None,
        }
    }

    /// Check the invariants an entry must hold before it may be appended.
    pub fn validate(&self) -> Result<(), ParseError> {
        match &self.kind {
            LogEntryKind::File(f) => {
                validate_relpath(&f.relpath)?;
                if f.extents.is_empty() || f.extents.len() > FAMFS_MAX_EXTENTS {
                    return Err(ParseError::InvalidField {
                        field: "extent_count",
                        reason: "file needs between 1 and 8 extents",
                    });
                }
                let total = validate_extent_list(&f.extents)?;
                if f.size > total {
                    return Err(ParseError::InvalidField {
                        field: "size",
                        reason: "larger than the extent list",
                    });
                }
                Ok(())
            }
            LogEntryKind::Mkdir(d) => validate_relpath(&d.relpath),
            LogEntryKind::Access => Ok(()),
        }
    }

    /// Encode into a full entry slot, CRC included.
    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        self.validate()?;
        let mut slot = vec![0_u8; FAMFS_LOG_ENTRY_SIZE];
        write_le_u64(&mut slot, ENT_SEQNUM, self.seqnum)?;
        match &self.kind {
            LogEntryKind::File(f) => {
                write_le_u32(&mut slot, ENT_TYPE, TYPE_FILE)?;
                write_le_u32(&mut slot, ENT_FLAGS, f.flags)?;
                encode_attrs(&mut slot, f.attrs)?;
                write_le_u64(&mut slot, ENT_SIZE, f.size)?;
                let count = u32::try_from(f.extents.len())
                    .map_err(|_| ParseError::IntegerConversion { field: "extent_count" })?;
                write_le_u32(&mut slot, ENT_EXTENT_COUNT, count)?;
                write_nul_padded(
                    &mut slot,
                    ENT_RELPATH,
                    FAMFS_MAX_PATHLEN,
                    f.relpath.as_bytes(),
                    "relpath",
                )?;
                for (i, ext) in f.extents.iter().enumerate() {
                    let at = ENT_EXTENTS + i * EXTENT_SLOT_SIZE;
                    ext.encode_into(&mut slot[at..at + EXTENT_SLOT_SIZE])?;
                }
            }
            LogEntryKind::Mkdir(d) => {
                write_le_u32(&mut slot, ENT_TYPE, TYPE_MKDIR)?;
                encode_attrs(&mut slot, d.attrs)?;
                write_nul_padded(
                    &mut slot,
                    ENT_RELPATH,
                    FAMFS_MAX_PATHLEN,
                    d.relpath.as_bytes(),
                    "relpath",
                )?;
            }
            LogEntryKind::Access => write_le_u32(&mut slot, ENT_TYPE, TYPE_ACCESS)?,
        }
        let crc = entry_crc(&slot)?;
        write_le_u32(&mut slot, ENT_CRC, crc)?;
        Ok(slot)
    }

    /// Decode one entry slot. The slot CRC is checked first.
    pub fn decode(slot: &[u8]) -> Result<Self, ParseError> {
        let stored = read_le_u32(slot, ENT_CRC)?;
        let computed = entry_crc(slot)?;
        if stored != computed {
            return Err(ParseError::ChecksumMismatch {
                structure: "log entry",
                stored,
                computed,
            });
        }

        let seqnum = read_le_u64(slot, ENT_SEQNUM)?;
        let kind = match read_le_u32(slot, ENT_TYPE)? {
            TYPE_FILE => {
                let count = read_le_u32(slot, ENT_EXTENT_COUNT)? as usize;
                if count > FAMFS_MAX_EXTENTS {
                    return Err(ParseError::InvalidField {
                        field: "extent_count",
                        reason: "more than 8 extents",
                    });
                }
                let extents = (0..count)
                    .map(|i| {
                        let at = ENT_EXTENTS + i * EXTENT_SLOT_SIZE;
                        Extent::decode(ensure_slice(slot, at, EXTENT_SLOT_SIZE)?)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                LogEntryKind::File(FileCreation {
                    relpath: decode_relpath(slot)?,
                    size: read_le_u64(slot, ENT_SIZE)?,
                    flags: read_le_u32(slot, ENT_FLAGS)?,
                    attrs: decode_attrs(slot)?,
                    extents,
                })
            }
            TYPE_MKDIR => LogEntryKind::Mkdir(DirCreation {
                relpath: decode_relpath(slot)?,
                attrs: decode_attrs(slot)?,
            }),
            TYPE_ACCESS => LogEntryKind::Access,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "entry_type",
                    reason: "unknown log entry type",
                });
            }
        };
        let entry = Self { seqnum, kind };
        entry.validate()?;
        Ok(entry)
    }
}

fn encode_attrs(slot: &mut [u8], attrs: EntryAttrs) -> Result<(), ParseError> {
    write_le_u32(slot, ENT_MODE, attrs.mode)?;
    write_le_u32(slot, ENT_UID, attrs.uid)?;
    write_le_u32(slot, ENT_GID, attrs.gid)
}

fn decode_attrs(slot: &[u8]) -> Result<EntryAttrs, ParseError> {
    Ok(EntryAttrs {
        mode: read_le_u32(slot, ENT_MODE)?,
        uid: read_le_u32(slot, ENT_UID)?,
        gid: read_le_u32(slot, ENT_GID)?,
    })
}

fn decode_relpath(slot: &[u8]) -> Result<String, ParseError> {
    let raw = ensure_slice(slot, ENT_RELPATH, FAMFS_MAX_PATHLEN)?;
    String::from_utf8(nul_terminated(raw).to_vec()).map_err(|_| ParseError::InvalidField {
        field: "relpath",
        reason: "not valid UTF-8",
    })
}

fn entry_crc(slot: &[u8]) -> Result<u32, ParseError> {
    let bytes = ensure_slice(slot, 0, FAMFS_LOG_ENTRY_SIZE)?;
    let mut crc = crc32c::crc32c(&bytes[..ENT_CRC]);
    crc = crc32c::crc32c_append(crc, &[0_u8; 4]);
    Ok(crc32c::crc32c_append(crc, &bytes[ENT_CRC + 4..]))
}

/// A log-relative path: non-empty, not absolute, shorter than
/// [`FAMFS_MAX_PATHLEN`], no `.`/`..` or empty components, no NUL bytes.
pub fn validate_relpath(relpath: &str) -> Result<(), ParseError> {
    if relpath.is_empty() {
        return Err(ParseError::InvalidField {
            field: "relpath",
            reason: "empty path",
        });
    }
    if relpath.starts_with('/') {
        return Err(ParseError::InvalidField {
            field: "relpath",
            reason: "absolute path",
        });
    }
    if relpath.len() >= FAMFS_MAX_PATHLEN {
        return Err(ParseError::InvalidField {
            field: "relpath",
            reason: "path too long",
        });
    }
    if relpath.contains('\0') {
        return Err(ParseError::InvalidField {
            field: "relpath",
            reason: "embedded NUL",
        });
    }
    if relpath
        .split('/')
        .any(|c| c.is_empty() || c == "." || c == "..")
    {
        return Err(ParseError::InvalidField {
            field: "relpath",
            reason: "empty, '.' or '..' component",
        });
    }
    Ok(())
}

// ── Snapshot reader ─────────────────────────────────────────────────────────

/// Read-only view of a log region with `next_index` snapshotted at
/// construction.
#[derive(Debug, Clone, Copy)]
pub struct LogView<'a> {
    bytes: &'a [u8],
    header: LogHeader,
}

impl<'a> LogView<'a> {
    /// Validate the header and take the snapshot.
    pub fn new(bytes: &'a [u8]) -> Result<Self, ParseError> {
        let header = LogHeader::parse_validated(bytes)?;
        Ok(Self { bytes, header })
    }

    #[must_use]
    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// Entries covered by the snapshot.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.header.next_index
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.next_index == 0
    }

    /// Decode entry `index`. Fails for slots outside the snapshot.
    pub fn entry(&self, index: u64) -> Result<LogEntry, ParseError> {
        if index >= self.header.next_index {
            return Err(ParseError::InvalidField {
                field: "index",
                reason: "beyond next_index",
            });
        }
        let at = entry_offset(index).ok_or(ParseError::IntegerConversion {
            field: "entry offset",
        })?;
        let at = u64_to_usize(at, "entry offset")?;
        LogEntry::decode(ensure_slice(self.bytes, at, FAMFS_LOG_ENTRY_SIZE)?)
    }

    /// Iterate `(index, decode result)` over the snapshot.
    pub fn entries(&self) -> impl Iterator<Item = (u64, Result<LogEntry, ParseError>)> + '_ {
        (0..self.header.next_index).map(move |i| (i, self.entry(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::SimpleExtent;
    use fam_types::{FAMFS_LOG_LEN, MIB};

    fn file_entry(path: &str, offset: u64, len: u64) -> LogEntry {
        LogEntry::file(FileCreation {
            relpath: path.into(),
            size: len,
            flags: 0,
            attrs: EntryAttrs {
                mode: 0o644,
                uid: 1000,
                gid: 1000,
            },
            extents: vec![Extent::Simple(SimpleExtent::new(offset, len))],
        })
    }

    fn log_with(entries: &[LogEntry]) -> Vec<u8> {
        let mut log = vec![0_u8; 64 * 1024];
        let mut hdr = LogHeader::new(FAMFS_LOG_LEN).unwrap();
        for (i, e) in entries.iter().enumerate() {
            let mut e = e.clone();
            e.seqnum = hdr.next_seqnum;
            let at = usize::try_from(entry_offset(i as u64).unwrap()).unwrap();
            log[at..at + FAMFS_LOG_ENTRY_SIZE].copy_from_slice(&e.encode().unwrap());
            hdr.next_seqnum += 1;
            hdr.next_index += 1;
        }
        log[..FAMFS_LOG_HEADER_SIZE].copy_from_slice(&hdr.encode().unwrap());
        log
    }

    #[test]
    fn header_geometry() {
        let hdr = LogHeader::new(FAMFS_LOG_LEN).unwrap();
        assert_eq!(hdr.last_index, (FAMFS_LOG_LEN - 2048) / 2048 - 1);
        assert_eq!(hdr.capacity(), 4095);
        assert!(!hdr.is_full());
        assert_eq!(entry_offset(0), Some(2048));
        assert_eq!(entry_offset(3), Some(2048 * 4));
        assert!(LogHeader::new(MIB).is_err());
        assert!(LogHeader::new(3 * MIB).is_err());
    }

    #[test]
    fn header_round_trip_and_validation() {
        let mut hdr = LogHeader::new(FAMFS_LOG_LEN).unwrap();
        hdr.next_seqnum = 7;
        hdr.next_index = 3;
        let bytes = hdr.encode().unwrap();
        assert_eq!(LogHeader::parse_validated(&bytes).unwrap(), hdr);

        let mut bad_magic = bytes.clone();
        bad_magic[0] ^= 1;
        assert!(matches!(
            LogHeader::parse_validated(&bad_magic),
            Err(ParseError::InvalidMagic { .. })
        ));

        let mut bad_crc = bytes.clone();
        bad_crc[HDR_CRC] ^= 1;
        assert!(matches!(
            LogHeader::parse_validated(&bad_crc),
            Err(ParseError::ChecksumMismatch { .. })
        ));
        bad_crc[HDR_CRC] ^= 1;
        LogHeader::parse_validated(&bad_crc).expect("restored header validates");
    }

    #[test]
    fn counters_do_not_affect_crc() {
        let mut hdr = LogHeader::new(FAMFS_LOG_LEN).unwrap();
        let crc = hdr.crc;
        hdr.next_index = 100;
        hdr.next_seqnum = 200;
        assert_eq!(hdr.compute_crc(), crc);
        hdr.validate().unwrap();
    }

    #[test]
    fn next_index_past_capacity_rejected() {
        let mut hdr = LogHeader::new(FAMFS_LOG_LEN).unwrap();
        hdr.next_index = hdr.last_index + 1;
        hdr.validate().unwrap();
        assert!(hdr.is_full());
        hdr.next_index += 1;
        assert!(hdr.validate().is_err());
    }

    #[test]
    fn entry_round_trip_and_crc() {
        let mut e = file_entry("dir/file", 10 * MIB, 2 * MIB);
        e.seqnum = 42;
        let slot = e.encode().unwrap();
        assert_eq!(LogEntry::decode(&slot).unwrap(), e);

        let mut torn = slot.clone();
        torn[ENT_RELPATH] ^= 0x20;
        assert!(matches!(
            LogEntry::decode(&torn),
            Err(ParseError::ChecksumMismatch {
                structure: "log entry",
                ..
            })
        ));
    }

    #[test]
    fn mkdir_entry_round_trip() {
        let e = LogEntry::mkdir(DirCreation {
            relpath: "a/b".into(),
            attrs: EntryAttrs {
                mode: 0o755,
                uid: 0,
                gid: 0,
            },
        });
        assert_eq!(LogEntry::decode(&e.encode().unwrap()).unwrap(), e);
    }

    #[test]
    fn relpath_rules() {
        validate_relpath("a").unwrap();
        validate_relpath("a/b/c.txt").unwrap();
        for bad in ["", "/abs", "a//b", "a/../b", "./a", "a/"] {
            assert!(validate_relpath(bad).is_err(), "{bad:?} accepted");
        }
        assert!(validate_relpath(&"x".repeat(FAMFS_MAX_PATHLEN)).is_err());
        validate_relpath(&"x".repeat(FAMFS_MAX_PATHLEN - 1)).unwrap();
    }

    #[test]
    fn file_entry_invariants() {
        let mut e = file_entry("f", 10 * MIB, 2 * MIB);
        if let LogEntryKind::File(f) = &mut e.kind {
            f.size = 3 * MIB;
        }
        assert!(e.encode().is_err());

        let no_extents = LogEntry::file(FileCreation {
            relpath: "f".into(),
            size: 0,
            flags: 0,
            attrs: EntryAttrs::default(),
            extents: Vec::new(),
        });
        assert!(no_extents.validate().is_err());
    }

    #[test]
    fn view_snapshots_entries() {
        let log = log_with(&[
            file_entry("a", 10 * MIB, 2 * MIB),
            file_entry("b", 12 * MIB, 2 * MIB),
        ]);
        let view = LogView::new(&log).unwrap();
        assert_eq!(view.len(), 2);
        let paths: Vec<String> = view
            .entries()
            .map(|(_, e)| e.unwrap().relpath().unwrap().to_owned())
            .collect();
        assert_eq!(paths, ["a", "b"]);
        assert_eq!(view.entry(1).unwrap().seqnum, 1);
        assert!(view.entry(2).is_err());
    }
}
