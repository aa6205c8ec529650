#![forbid(unsafe_code)]
//! Extent mapping: file offset to device offset resolution.
//!
//! Resolves logical file offsets against a file's extent list, for both
//! simple and interleaved (striped) extents, and carries the fmap wire
//! codec that hands a file's map to fault-handling collaborators.
//!
//! Resolution is lock-free and allocation-free; it only reads an
//! already-validated extent list.

pub mod fmap;

use fam_ondisk::{Extent, FileCreation, InterleavedExtent, validate_extent_list};
use fam_types::{FAMFS_MAX_EXTENTS, FileType, ParseError};
use serde::{Deserialize, Serialize};

pub use fmap::{decode_fmap, encode_fmap};

// ── Resolution ──────────────────────────────────────────────────────────────

/// Result of resolving a file offset.
///
/// `contiguous_len == 0` means the offset lies past the end of the extent
/// list (or nothing was requested).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MappedRange {
    pub dev_index: u64,
    pub device_offset: u64,
    pub contiguous_len: u64,
}

impl MappedRange {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contiguous_len == 0
    }
}

#[inline]
fn ck(value: Option<u64>, what: &str) -> u64 {
    match value {
        Some(v) => v,
        None => panic!("extent arithmetic overflow computing {what}"),
    }
}

/// Resolve `file_offset` against `extents`, mapping at most `requested_len`
/// bytes.
///
/// The containing extent is the first whose logical range covers
/// `file_offset`. For interleaved extents the returned range never crosses
/// a chunk boundary. Offsets past the end of all extents resolve to a
/// zero-length mapping, as does an offset inside a malformed interleaved
/// extent (no strips or a zero chunk size).
///
/// # Panics
///
/// Panics on 64-bit overflow, which a list accepted by
/// [`validate_extent_list`] cannot produce.
#[must_use]
pub fn resolve(extents: &[Extent], file_offset: u64, requested_len: u64) -> MappedRange {
    let mut consumed = 0_u64;
    for extent in extents {
        let len = extent.logical_len();
        let end = ck(consumed.checked_add(len), "extent end");
        if file_offset < end {
            let local = file_offset - consumed;
            return match extent {
                Extent::Simple(s) => MappedRange {
                    dev_index: s.dev_index,
                    device_offset: ck(s.offset.checked_add(local), "device offset"),
                    contiguous_len: requested_len.min(len - local),
                },
                Extent::Interleaved(ie) => resolve_interleaved(ie, local, requested_len),
            };
        }
        consumed = end;
    }
    MappedRange::default()
}

/// Byte `local` of an interleaved extent lives in chunk `local / C`, which
/// sits on strip `chunk % N` at stripe `chunk / N`.
fn resolve_interleaved(ie: &InterleavedExtent, local: u64, requested_len: u64) -> MappedRange {
    let chunk_size = ie.chunk_size;
    let nstrips = ie.strips.len() as u64;
    if chunk_size == 0 || nstrips == 0 {
        return MappedRange::default();
    }
    let chunk = local / chunk_size;
    let within = local % chunk_size;
    let strip_idx = chunk % nstrips;
    let stripe = chunk / nstrips;
    #[expect(clippy::cast_possible_truncation)]
    let strip = &ie.strips[strip_idx as usize];
    let strip_offset = ck(
        ck(stripe.checked_mul(chunk_size), "stripe offset").checked_add(within),
        "strip offset",
    );
    MappedRange {
        dev_index: strip.dev_index,
        device_offset: ck(strip.offset.checked_add(strip_offset), "device offset"),
        contiguous_len: requested_len
            .min(chunk_size - within)
            .min(ie.nbytes - local),
    }
}

// ── File maps ───────────────────────────────────────────────────────────────

/// A file's validated extent list plus its type and declared size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMap {
    file_type: FileType,
    size: u64,
    extents: Vec<Extent>,
}

impl FileMap {
    pub fn new(file_type: FileType, size: u64, extents: Vec<Extent>) -> Result<Self, ParseError> {
        if extents.len() > FAMFS_MAX_EXTENTS {
            return Err(ParseError::InvalidField {
                field: "extent_count",
                reason: "more than 8 extents",
            });
        }
        let total = validate_extent_list(&extents)?;
        if size > total {
            return Err(ParseError::InvalidField {
                field: "size",
                reason: "larger than the extent list",
            });
        }
        Ok(Self {
            file_type,
            size,
            extents,
        })
    }

    pub fn from_file_creation(file: &FileCreation) -> Result<Self, ParseError> {
        Self::new(FileType::Regular, file.size, file.extents.clone())
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Logical bytes covered by the extents (at least `size`).
    #[must_use]
    pub fn mapped_len(&self) -> u64 {
        self.extents.iter().map(Extent::logical_len).sum()
    }

    #[must_use]
    pub fn resolve(&self, file_offset: u64, requested_len: u64) -> MappedRange {
        resolve(&self.extents, file_offset, requested_len)
    }

    /// Iterate the device ranges backing `[file_offset, file_offset + len)`,
    /// stopping early at the end of the extent list.
    #[must_use]
    pub fn mappings(&self, file_offset: u64, len: u64) -> Mappings<'_> {
        Mappings {
            map: self,
            next: file_offset,
            remaining: len,
        }
    }
}

/// Iterator returned by [`FileMap::mappings`]; yields `(file_offset, range)`.
#[derive(Debug, Clone)]
pub struct Mappings<'a> {
    map: &'a FileMap,
    next: u64,
    remaining: u64,
}

impl Iterator for Mappings<'_> {
    type Item = (u64, MappedRange);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let range = self.map.resolve(self.next, self.remaining);
        if range.is_empty() {
            self.remaining = 0;
            return None;
        }
        let at = self.next;
        self.next += range.contiguous_len;
        self.remaining -= range.contiguous_len;
        Some((at, range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_ondisk::SimpleExtent;
    use fam_types::MIB;

    fn simple(offset_mib: u64, len_mib: u64) -> Extent {
        Extent::Simple(SimpleExtent::new(offset_mib * MIB, len_mib * MIB))
    }

    fn striped_4x2() -> Extent {
        Extent::Interleaved(InterleavedExtent {
            chunk_size: 2 * MIB,
            nbytes: 16 * MIB,
            strips: vec![
                SimpleExtent::new(100 * MIB, 4 * MIB),
                SimpleExtent::new(200 * MIB, 4 * MIB),
                SimpleExtent::new(300 * MIB, 4 * MIB),
                SimpleExtent::new(400 * MIB, 4 * MIB),
            ],
        })
    }

    #[test]
    fn simple_extents_walk_in_order() {
        let extents = vec![simple(10, 4), simple(40, 2)];
        assert_eq!(
            resolve(&extents, 0, MIB),
            MappedRange {
                dev_index: 0,
                device_offset: 10 * MIB,
                contiguous_len: MIB
            }
        );
        let r = resolve(&extents, 3 * MIB, 8 * MIB);
        assert_eq!(r.device_offset, 13 * MIB);
        assert_eq!(r.contiguous_len, MIB);
        let r = resolve(&extents, 4 * MIB + 5, 100);
        assert_eq!(r.device_offset, 40 * MIB + 5);
        assert_eq!(r.contiguous_len, 100);
    }

    #[test]
    fn past_end_is_zero_length() {
        let extents = vec![simple(10, 4)];
        assert!(resolve(&extents, 4 * MIB, 10).is_empty());
        assert!(resolve(&extents, u64::MAX, 10).is_empty());
        assert!(resolve(&[], 0, 10).is_empty());
        assert!(resolve(&extents, 0, 0).is_empty());
    }

    #[test]
    fn striped_scenario() {
        let extents = vec![striped_4x2()];

        // 4 MiB -> chunk 2 -> strip 2, stripe 0, strip offset 0
        let r = resolve(&extents, 4 * MIB, 16 * MIB);
        assert_eq!(r.device_offset, 300 * MIB);
        assert_eq!(r.contiguous_len, 2 * MIB);

        // 15 MiB -> chunk 7 -> strip 3, stripe 1, strip offset 3 MiB
        let r = resolve(&extents, 15 * MIB, 16 * MIB);
        assert_eq!(r.device_offset, 403 * MIB);
        assert_eq!(r.contiguous_len, MIB);
    }

    #[test]
    fn interleaved_never_crosses_chunk() {
        let extents = vec![striped_4x2()];
        let mut off = 0;
        while off < 16 * MIB {
            let r = resolve(&extents, off, u64::MAX);
            assert!(r.contiguous_len > 0);
            assert!((off % (2 * MIB)) + r.contiguous_len <= 2 * MIB);
            off += r.contiguous_len;
        }
        assert_eq!(off, 16 * MIB);
    }

    #[test]
    fn malformed_interleaved_maps_nothing() {
        let no_strips = vec![Extent::Interleaved(InterleavedExtent {
            chunk_size: 2 * MIB,
            nbytes: 4 * MIB,
            strips: Vec::new(),
        })];
        assert!(resolve(&no_strips, 0, MIB).is_empty());

        let zero_chunk = vec![Extent::Interleaved(InterleavedExtent {
            chunk_size: 0,
            nbytes: 4 * MIB,
            strips: vec![SimpleExtent::new(50 * MIB, 4 * MIB)],
        })];
        assert!(resolve(&zero_chunk, MIB, MIB).is_empty());
    }

    #[test]
    fn single_strip_matches_simple() {
        let striped = vec![Extent::Interleaved(InterleavedExtent {
            chunk_size: 2 * MIB,
            nbytes: 6 * MIB,
            strips: vec![SimpleExtent::new(50 * MIB, 6 * MIB)],
        })];
        let plain = vec![simple(50, 6)];
        for off in [0, MIB, 2 * MIB + 7, 5 * MIB] {
            assert_eq!(
                resolve(&striped, off, 1).device_offset,
                resolve(&plain, off, 1).device_offset
            );
        }
    }

    #[test]
    fn file_map_validation() {
        assert!(FileMap::new(FileType::Regular, 5 * MIB, vec![simple(10, 4)]).is_err());
        assert!(FileMap::new(FileType::Regular, MIB, vec![simple(11, 4)]).is_err());
        let map = FileMap::new(FileType::Regular, 3 * MIB, vec![simple(10, 4)]).expect("map");
        assert_eq!(map.mapped_len(), 4 * MIB);
        assert_eq!(map.size(), 3 * MIB);
    }

    #[test]
    fn mappings_cover_request() {
        let map = FileMap::new(
            FileType::Regular,
            6 * MIB,
            vec![simple(10, 4), simple(40, 2)],
        )
        .expect("map");
        let ranges: Vec<_> = map.mappings(3 * MIB, 10 * MIB).collect();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], (3 * MIB, MappedRange {
            dev_index: 0,
            device_offset: 13 * MIB,
            contiguous_len: MIB,
        }));
        assert_eq!(ranges[1].0, 4 * MIB);
        assert_eq!(ranges[1].1.contiguous_len, 2 * MIB);
    }
}
