//! Rebuild the allocation bitmap by replaying the log.
//!
//! The bitmap is never persisted: every allocating process and every fsck
//! derives it from entry 0 up to the snapshotted `next_index`.

use crate::bitmap::AllocBitmap;
use fam_ondisk::{LogEntryKind, LogView, SimpleExtent};
use fam_types::{FAMFS_ALLOC_UNIT, FAMFS_LOG_OFFSET, FAMFS_SUPERBLOCK_SIZE};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// One extent range that landed on units some earlier entry already owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collision {
    pub index: u64,
    pub relpath: String,
    pub offset: u64,
    /// Units of this range that were already allocated.
    pub units: u64,
}

/// A log slot inside the snapshot that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadEntry {
    pub index: u64,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub bitmap: AllocBitmap,
    /// Units found already set while replaying (double allocations).
    pub collisions: u64,
    pub collision_records: Vec<Collision>,
    /// Units referenced by the log that lie past the bitmap.
    pub out_of_bounds: u64,
    pub bad_entries: Vec<BadEntry>,
    pub files: u64,
    pub dirs: u64,
    pub access_entries: u64,
    /// Device bytes claimed by file extents.
    pub allocated_bytes: u64,
}

/// Bits in the bitmap for a device of `device_capacity` bytes with a log of
/// `log_len` bytes.
#[must_use]
pub fn bitmap_nbits(device_capacity: u64, log_len: u64) -> u64 {
    device_capacity
        .saturating_sub(FAMFS_SUPERBLOCK_SIZE)
        .saturating_sub(log_len)
        / FAMFS_ALLOC_UNIT
}

/// Replay `log` into a fresh bitmap.
///
/// Superblock and log units are pre-marked. Each `FILE` extent (strips of
/// interleaved extents individually) marks every unit it covers; a unit
/// that is already set counts as one collision. Replay always runs to the
/// end of the snapshot.
#[must_use]
pub fn build_bitmap(log: &LogView<'_>, device_capacity: u64, verbose: bool) -> ReplayOutcome {
    let header = log.header();
    let nbits = bitmap_nbits(device_capacity, header.len);
    let mut bitmap = AllocBitmap::new(nbits);
    let reserved = FAMFS_LOG_OFFSET.saturating_add(header.len) / FAMFS_ALLOC_UNIT;
    bitmap.set_range(0, reserved);

    let mut outcome = ReplayOutcome {
        bitmap,
        collisions: 0,
        collision_records: Vec::new(),
        out_of_bounds: 0,
        bad_entries: Vec::new(),
        files: 0,
        dirs: 0,
        access_entries: 0,
        allocated_bytes: 0,
    };

    for (index, decoded) in log.entries() {
        let entry = match decoded {
            Ok(entry) => entry,
            Err(err) => {
                warn!(index, error = %err, "skipping undecodable log entry");
                outcome.bad_entries.push(BadEntry {
                    index,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        match &entry.kind {
            LogEntryKind::File(file) => {
                outcome.files += 1;
                if verbose {
                    debug!(index, seqnum = entry.seqnum, path = %file.relpath, size = file.size, extents = file.extents.len(), "replay file");
                }
                for extent in &file.extents {
                    for range in extent.device_ranges() {
                        mark_range(&mut outcome, index, &file.relpath, range);
                    }
                }
            }
            LogEntryKind::Mkdir(dir) => {
                outcome.dirs += 1;
                if verbose {
                    debug!(index, seqnum = entry.seqnum, path = %dir.relpath, "replay mkdir");
                }
            }
            LogEntryKind::Access => outcome.access_entries += 1,
        }
    }

    debug!(
        entries = log.len(),
        nbits,
        collisions = outcome.collisions,
        out_of_bounds = outcome.out_of_bounds,
        bad_entries = outcome.bad_entries.len(),
        "log replay complete"
    );
    outcome
}

fn mark_range(outcome: &mut ReplayOutcome, index: u64, relpath: &str, range: &SimpleExtent) {
    outcome.allocated_bytes = outcome.allocated_bytes.saturating_add(range.len);
    let first = range.offset / FAMFS_ALLOC_UNIT;
    let end = range
        .offset
        .saturating_add(range.len)
        .div_ceil(FAMFS_ALLOC_UNIT);
    let mut collided = 0_u64;
    for unit in first..end {
        if unit >= outcome.bitmap.nbits() {
            outcome.out_of_bounds += 1;
        } else if !outcome.bitmap.test_and_set(unit) {
            collided += 1;
        }
    }
    trace!(index, offset = range.offset, len = range.len, "marked range");
    if collided > 0 {
        warn!(index, path = relpath, offset = range.offset, units = collided, "double allocation");
        outcome.collisions += collided;
        outcome.collision_records.push(Collision {
            index,
            relpath: relpath.to_owned(),
            offset: range.offset,
            units: collided,
        });
    }
}
