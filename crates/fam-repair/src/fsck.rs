//! Offline consistency scan.
//!
//! The scan re-derives everything from the superblock and log bytes: it
//! validates both structures, replays the log into a fresh bitmap and turns
//! every anomaly into a typed [`Finding`]. Nothing is written back.
//!
//! # Usage
//!
//! ```ignore
//! let report = scan(&superblock_bytes, &log_bytes, false);
//! if report.tier() != HealthTier::Ok {
//!     eprintln!("{report}");
//! }
//! std::process::exit(report.fault_count() as i32);
//! ```

use fam_alloc::{BadEntry, Collision, build_bitmap};
use fam_ondisk::{DeviceInfo, LogView, Superblock};
use fam_types::{FAMFS_ALLOC_UNIT, FAMFS_LOG_HEADER_SIZE, FAMFS_SUPERBLOCK_STRUCT_SIZE, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

// ── Taxonomy ────────────────────────────────────────────────────────────────

/// Category of problem found by a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// A region could not be read at all.
    Unreadable,
    BadMagic,
    BadVersion,
    /// Stored CRC does not match the computed one.
    ChecksumMismatch,
    /// A structural field is out of range (geometry, lengths, counts).
    StructuralInvariant,
    /// Allocation units claimed by more than one entry.
    Collision,
    /// A log slot inside the snapshot that does not decode.
    BadEntry,
    /// Extents pointing past the end of the device.
    OutOfBounds,
    /// A meta file whose size disagrees with the superblock.
    MetaFileSize,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreadable => write!(f, "unreadable"),
            Self::BadMagic => write!(f, "bad_magic"),
            Self::BadVersion => write!(f, "bad_version"),
            Self::ChecksumMismatch => write!(f, "checksum_mismatch"),
            Self::StructuralInvariant => write!(f, "structural_invariant"),
            Self::Collision => write!(f, "collision"),
            Self::BadEntry => write!(f, "bad_entry"),
            Self::OutOfBounds => write!(f, "out_of_bounds"),
            Self::MetaFileSize => write!(f, "meta_file_size"),
        }
    }
}

/// Severity of a finding. `Critical` findings make the instance unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Overall health of a scanned instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthTier {
    Ok,
    /// Usable, but the log records collisions or undecodable entries.
    Degraded,
    /// A structure is invalid or unreadable.
    Fatal,
}

impl fmt::Display for HealthTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

// ── Findings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub detail: String,
}

impl Finding {
    #[must_use]
    pub fn new(kind: FindingKind, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            detail: detail.into(),
        }
    }

    fn critical(kind: FindingKind, detail: impl Into<String>) -> Self {
        Self::new(kind, Severity::Critical, detail)
    }

    /// Classify a structural decode failure of `region`.
    fn from_parse(region: &str, err: &ParseError) -> Self {
        let kind = match err {
            ParseError::InvalidMagic { .. } => FindingKind::BadMagic,
            ParseError::UnsupportedVersion { .. } => FindingKind::BadVersion,
            ParseError::ChecksumMismatch { .. } => FindingKind::ChecksumMismatch,
            ParseError::InsufficientData { .. } => FindingKind::Unreadable,
            ParseError::InvalidField { .. } | ParseError::IntegerConversion { .. } => {
                FindingKind::StructuralInvariant
            }
        };
        Self::critical(kind, format!("{region}: {err}"))
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.detail)
    }
}

// ── Report ──────────────────────────────────────────────────────────────────

/// Log utilization figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogUsage {
    pub log_len: u64,
    pub capacity: u64,
    pub used: u64,
    pub next_seqnum: u64,
}

/// Space figures from the replayed bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpaceUsage {
    pub device_capacity: u64,
    pub bitmap_units: u64,
    pub units_in_use: u64,
    pub allocated_bytes: u64,
    pub files: u64,
    pub dirs: u64,
    pub access_entries: u64,
}

/// Everything a scan learned about an instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FsckReport {
    pub fs_uuid: Option<String>,
    pub system_uuid: Option<String>,
    pub device: Option<DeviceInfo>,
    pub log: Option<LogUsage>,
    pub space: Option<SpaceUsage>,
    /// Units claimed twice (counted per unit).
    pub collisions: u64,
    pub collision_records: Vec<Collision>,
    pub bad_entries: Vec<BadEntry>,
    pub out_of_bounds: u64,
    pub findings: Vec<Finding>,
}

impl FsckReport {
    /// A report for an instance whose `region` could not be read.
    #[must_use]
    pub fn unreadable(region: &str, reason: &str) -> Self {
        let mut report = Self::default();
        report.push(Finding::critical(
            FindingKind::Unreadable,
            format!("{region}: {reason}"),
        ));
        report
    }

    pub fn push(&mut self, finding: Finding) {
        match finding.severity {
            Severity::Critical | Severity::Error => warn!(%finding, "fsck finding"),
            Severity::Warning | Severity::Info => debug!(%finding, "fsck finding"),
        }
        self.findings.push(finding);
    }

    #[must_use]
    pub fn tier(&self) -> HealthTier {
        if self.findings.iter().any(|f| f.severity == Severity::Critical) {
            HealthTier::Fatal
        } else if self.collisions > 0
            || !self.bad_entries.is_empty()
            || self.out_of_bounds > 0
            || self.count_at_severity(Severity::Error) > 0
        {
            HealthTier::Degraded
        } else {
            HealthTier::Ok
        }
    }

    #[must_use]
    pub fn count_at_severity(&self, min: Severity) -> usize {
        self.findings.iter().filter(|f| f.severity >= min).count()
    }

    /// Collisions plus bad entries plus out-of-bounds units plus fatal
    /// findings; zero means clean.
    #[must_use]
    pub fn fault_count(&self) -> u64 {
        let fatal = self
            .findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count() as u64;
        self.collisions + self.bad_entries.len() as u64 + self.out_of_bounds + fatal
    }

    /// Compare the sizes of the `.meta/.superblock` and `.meta/.log` files
    /// against the geometry the superblock records.
    pub fn check_meta_files(&mut self, superblock_file_len: u64, log_file_len: u64) {
        if superblock_file_len < FAMFS_SUPERBLOCK_STRUCT_SIZE as u64 {
            self.push(Finding::critical(
                FindingKind::MetaFileSize,
                format!(
                    "superblock file is {superblock_file_len} bytes, need at least {FAMFS_SUPERBLOCK_STRUCT_SIZE}"
                ),
            ));
        }
        if let Some(log) = self.log {
            if log_file_len < log.log_len {
                self.push(Finding::critical(
                    FindingKind::MetaFileSize,
                    format!("log file is {log_file_len} bytes, superblock says {}", log.log_len),
                ));
            } else if log_file_len > log.log_len {
                self.push(Finding::new(
                    FindingKind::MetaFileSize,
                    Severity::Warning,
                    format!("log file is {log_file_len} bytes, superblock says {}", log.log_len),
                ));
            }
        } else if log_file_len < FAMFS_LOG_HEADER_SIZE as u64 {
            self.push(Finding::critical(
                FindingKind::MetaFileSize,
                format!("log file is {log_file_len} bytes, too small for a header"),
            ));
        }
    }
}

impl fmt::Display for FsckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "famfs fsck: {}", self.tier())?;
        if let Some(uuid) = &self.fs_uuid {
            writeln!(f, "  fs uuid:      {uuid}")?;
        }
        if let Some(uuid) = &self.system_uuid {
            writeln!(f, "  system uuid:  {uuid}")?;
        }
        if let Some(dev) = &self.device {
            writeln!(f, "  device:       {} ({} bytes)", dev.name, dev.size)?;
        }
        if let Some(log) = &self.log {
            writeln!(
                f,
                "  log:          {}/{} entries used, {} bytes",
                log.used, log.capacity, log.log_len
            )?;
        }
        if let Some(space) = &self.space {
            writeln!(
                f,
                "  space:        {}/{} units in use, {} files, {} dirs",
                space.units_in_use, space.bitmap_units, space.files, space.dirs
            )?;
        }
        writeln!(
            f,
            "  faults:       {} collisions, {} bad entries, {} out of bounds",
            self.collisions,
            self.bad_entries.len(),
            self.out_of_bounds
        )?;
        for finding in &self.findings {
            writeln!(f, "  {finding}")?;
        }
        Ok(())
    }
}

// ── Scan ────────────────────────────────────────────────────────────────────

/// Scan an instance from its raw superblock and log bytes.
///
/// A structural failure in either region stops the scan at that point and
/// yields a `Fatal` report; otherwise the log is replayed to the end and
/// every anomaly is recorded.
#[must_use]
pub fn scan(superblock: &[u8], log: &[u8], verbose: bool) -> FsckReport {
    let mut report = FsckReport::default();

    let sb = match Superblock::parse_validated(superblock) {
        Ok(sb) => sb,
        Err(err) => {
            report.push(Finding::from_parse("superblock", &err));
            return report;
        }
    };
    report.fs_uuid = Some(sb.fs_uuid.to_string());
    report.system_uuid = Some(sb.system_uuid.to_string());
    report.device = sb.primary_device().cloned();

    let view = match LogView::new(log) {
        Ok(view) => view,
        Err(err) => {
            report.push(Finding::from_parse("log header", &err));
            return report;
        }
    };
    let header = *view.header();
    report.log = Some(LogUsage {
        log_len: header.len,
        capacity: header.capacity(),
        used: header.next_index,
        next_seqnum: header.next_seqnum,
    });
    if header.len != sb.log_len {
        report.push(Finding::critical(
            FindingKind::StructuralInvariant,
            format!(
                "log header length {} does not match superblock log_len {}",
                header.len, sb.log_len
            ),
        ));
        return report;
    }
    if (log.len() as u64) < header.len {
        report.push(Finding::critical(
            FindingKind::Unreadable,
            format!("log region is {} bytes, header says {}", log.len(), header.len),
        ));
        return report;
    }
    if header.next_seqnum < header.next_index {
        report.push(Finding::new(
            FindingKind::StructuralInvariant,
            Severity::Warning,
            format!(
                "next_seqnum {} is behind next_index {}",
                header.next_seqnum, header.next_index
            ),
        ));
    }

    let outcome = build_bitmap(&view, sb.device_capacity(), verbose);
    let units_in_use = outcome.bitmap.count_set();
    report.space = Some(SpaceUsage {
        device_capacity: sb.device_capacity(),
        bitmap_units: outcome.bitmap.nbits(),
        units_in_use,
        allocated_bytes: outcome.allocated_bytes,
        files: outcome.files,
        dirs: outcome.dirs,
        access_entries: outcome.access_entries,
    });

    for c in &outcome.collision_records {
        report.push(Finding::new(
            FindingKind::Collision,
            Severity::Error,
            format!(
                "entry {} ({}) reuses {} unit(s) at offset {:#x}",
                c.index, c.relpath, c.units, c.offset
            ),
        ));
    }
    for bad in &outcome.bad_entries {
        report.push(Finding::new(
            FindingKind::BadEntry,
            Severity::Error,
            format!("entry {}: {}", bad.index, bad.reason),
        ));
    }
    if outcome.out_of_bounds > 0 {
        report.push(Finding::new(
            FindingKind::OutOfBounds,
            Severity::Error,
            format!(
                "{} unit(s) ({} bytes) lie past the end of the device",
                outcome.out_of_bounds,
                outcome.out_of_bounds * FAMFS_ALLOC_UNIT
            ),
        ));
    }
    report.collisions = outcome.collisions;
    report.collision_records = outcome.collision_records;
    report.bad_entries = outcome.bad_entries;
    report.out_of_bounds = outcome.out_of_bounds;

    info!(
        tier = %report.tier(),
        entries = header.next_index,
        collisions = report.collisions,
        faults = report.fault_count(),
        "fsck complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_ondisk::{
        EntryAttrs, Extent, FileCreation, LogEntry, LogHeader, SimpleExtent, entry_offset,
    };
    use fam_types::{FAMFS_LOG_ENTRY_SIZE, FamUuid, GIB, MIB};

    const LOG_LEN: u64 = 2 * MIB;

    fn superblock() -> Vec<u8> {
        Superblock::new(
            FamUuid([7; 16]),
            FamUuid([8; 16]),
            LOG_LEN,
            DeviceInfo {
                name: "/dev/dax1.0".into(),
                size: GIB,
            },
        )
        .encode()
        .expect("encode")
    }

    fn file(path: &str, offset: u64, len: u64) -> LogEntry {
        LogEntry::file(FileCreation {
            relpath: path.into(),
            size: len,
            flags: 0,
            attrs: EntryAttrs::default(),
            extents: vec![Extent::Simple(SimpleExtent::new(offset, len))],
        })
    }

    fn log(entries: &[LogEntry]) -> Vec<u8> {
        let mut buf = vec![0_u8; usize::try_from(LOG_LEN).expect("len")];
        let mut hdr = LogHeader::new(LOG_LEN).expect("header");
        for (i, e) in entries.iter().enumerate() {
            let mut e = e.clone();
            e.seqnum = hdr.next_seqnum;
            let at = usize::try_from(entry_offset(i as u64).expect("offset")).expect("usize");
            buf[at..at + FAMFS_LOG_ENTRY_SIZE].copy_from_slice(&e.encode().expect("encode"));
            hdr.next_seqnum += 1;
            hdr.next_index += 1;
        }
        buf[..FAMFS_LOG_HEADER_SIZE].copy_from_slice(&hdr.encode().expect("header"));
        buf
    }

    #[test]
    fn clean_instance_is_ok() {
        let report = scan(
            &superblock(),
            &log(&[file("a", 100 * MIB, 4 * MIB), file("b", 104 * MIB, 2 * MIB)]),
            false,
        );
        assert_eq!(report.tier(), HealthTier::Ok);
        assert_eq!(report.fault_count(), 0);
        let space = report.space.expect("space");
        assert_eq!(space.files, 2);
        // 2 reserved units (superblock + 2 MiB log) plus 3 for the files
        assert_eq!(space.units_in_use, 5);
        assert_eq!(report.log.expect("log").used, 2);
    }

    #[test]
    fn collisions_degrade() {
        let report = scan(
            &superblock(),
            &log(&[file("a", 100 * MIB, 4 * MIB), file("b", 102 * MIB, 4 * MIB)]),
            false,
        );
        assert_eq!(report.tier(), HealthTier::Degraded);
        assert_eq!(report.collisions, 1);
        assert_eq!(report.fault_count(), 1);
        assert_eq!(report.collision_records[0].relpath, "b");
        assert!(report.findings.iter().any(|f| f.kind == FindingKind::Collision));
    }

    #[test]
    fn corrupt_entry_degrades() {
        let mut bytes = log(&[file("a", 100 * MIB, 4 * MIB), file("b", 200 * MIB, 2 * MIB)]);
        let at = usize::try_from(entry_offset(1).expect("offset")).expect("usize");
        bytes[at + 60] ^= 0xFF;
        let report = scan(&superblock(), &bytes, false);
        assert_eq!(report.tier(), HealthTier::Degraded);
        assert_eq!(report.bad_entries.len(), 1);
        assert_eq!(report.bad_entries[0].index, 1);
        assert_eq!(report.fault_count(), 1);
    }

    #[test]
    fn out_of_bounds_degrades() {
        let report = scan(&superblock(), &log(&[file("far", 2 * GIB, 2 * MIB)]), false);
        assert_eq!(report.tier(), HealthTier::Degraded);
        assert_eq!(report.out_of_bounds, 1);
    }

    #[test]
    fn invalid_structures_are_fatal() {
        let mut sb = superblock();
        sb[0] ^= 1;
        let report = scan(&sb, &log(&[]), false);
        assert_eq!(report.tier(), HealthTier::Fatal);
        assert_eq!(report.findings[0].kind, FindingKind::BadMagic);
        assert_eq!(report.fault_count(), 1);

        let mut bytes = log(&[]);
        bytes[16] ^= 1;
        let report = scan(&superblock(), &bytes, false);
        assert_eq!(report.tier(), HealthTier::Fatal);
        assert_eq!(report.findings[0].kind, FindingKind::ChecksumMismatch);
        assert!(report.fs_uuid.is_some());

        let report = scan(&superblock(), &log(&[])[..4096], false);
        assert_eq!(report.tier(), HealthTier::Fatal);
        assert_eq!(report.findings[0].kind, FindingKind::Unreadable);

        let report = FsckReport::unreadable("log", "permission denied");
        assert_eq!(report.tier(), HealthTier::Fatal);
    }

    #[test]
    fn meta_file_sizes() {
        let mut report = scan(&superblock(), &log(&[]), false);
        report.check_meta_files(FAMFS_SUPERBLOCK_STRUCT_SIZE as u64, LOG_LEN);
        assert_eq!(report.tier(), HealthTier::Ok);
        report.check_meta_files(100, LOG_LEN);
        assert_eq!(report.tier(), HealthTier::Fatal);

        let mut report = scan(&superblock(), &log(&[]), false);
        report.check_meta_files(FAMFS_SUPERBLOCK_STRUCT_SIZE as u64, LOG_LEN + 4096);
        assert_eq!(report.tier(), HealthTier::Ok);
        assert_eq!(report.count_at_severity(Severity::Warning), 1);
    }

    #[test]
    fn report_serializes() {
        let report = scan(&superblock(), &log(&[file("a", 100 * MIB, 4 * MIB)]), false);
        let json = serde_json::to_string(&report).expect("json");
        assert!(json.contains("\"units_in_use\":4"));
        let back: FsckReport = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, report);
        assert!(report.to_string().starts_with("famfs fsck: OK"));
    }
}
