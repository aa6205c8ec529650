//! First-fit allocation over a replayed bitmap.

use crate::bitmap::AllocBitmap;
use fam_error::{FamError, Result};
use fam_ondisk::{InterleavedExtent, SimpleExtent};
use fam_types::{FAMFS_ALLOC_UNIT, FAMFS_MAX_STRIPS, PAGE_SIZE, units_for_bytes};
use tracing::debug;

/// Allocate `ceil(requested / unit)` contiguous units, first-fit from unit 0.
///
/// Returns the device offset of the run. On failure the bitmap is left
/// unchanged.
pub fn alloc_contiguous(bitmap: &mut AllocBitmap, requested_bytes: u64) -> Result<u64> {
    if requested_bytes == 0 {
        return Err(FamError::InvalidInput("zero-byte allocation".into()));
    }
    let units = units_for_bytes(requested_bytes);
    let start = bitmap
        .find_clear_run(units, 0)
        .ok_or(FamError::NoSpace {
            requested: requested_bytes,
        })?;
    bitmap.set_range(start, start + units);
    let offset = start * FAMFS_ALLOC_UNIT;
    debug!(offset, units, requested_bytes, "allocated contiguous run");
    Ok(offset)
}

/// Allocate a simple extent covering `requested_bytes`, with its length
/// rounded up to whole allocation units.
pub fn alloc_simple(bitmap: &mut AllocBitmap, requested_bytes: u64) -> Result<SimpleExtent> {
    let offset = alloc_contiguous(bitmap, requested_bytes)?;
    Ok(SimpleExtent::new(
        offset,
        units_for_bytes(requested_bytes) * FAMFS_ALLOC_UNIT,
    ))
}

/// Allocate an interleaved extent of `bytes` logical bytes striped across
/// `nstrips` strips in `chunk_size` pieces.
///
/// Each strip is a contiguous first-fit run sized to its share of `bytes`.
/// If any strip cannot be placed, strips already taken are released and the
/// bitmap is left unchanged.
pub fn alloc_interleaved(
    bitmap: &mut AllocBitmap,
    nstrips: u32,
    chunk_size: u64,
    bytes: u64,
) -> Result<InterleavedExtent> {
    if nstrips == 0 || nstrips as usize > FAMFS_MAX_STRIPS {
        return Err(FamError::InvalidInput(format!(
            "strip count {nstrips} not in 1..={FAMFS_MAX_STRIPS}"
        )));
    }
    if chunk_size == 0 || chunk_size % PAGE_SIZE != 0 {
        return Err(FamError::InvalidInput(format!(
            "chunk size {chunk_size} is not a nonzero multiple of {PAGE_SIZE}"
        )));
    }
    if bytes == 0 {
        return Err(FamError::InvalidInput("zero-byte allocation".into()));
    }
    let share = InterleavedExtent::strip_share(bytes, u64::from(nstrips), chunk_size)
        .ok_or_else(|| FamError::InvalidInput("strip size overflows".into()))?;
    let strip_len = units_for_bytes(share) * FAMFS_ALLOC_UNIT;

    let mut strips: Vec<SimpleExtent> = Vec::with_capacity(nstrips as usize);
    for _ in 0..nstrips {
        match alloc_contiguous(bitmap, strip_len) {
            Ok(offset) => strips.push(SimpleExtent::new(offset, strip_len)),
            Err(err) => {
                for taken in &strips {
                    let first = taken.offset / FAMFS_ALLOC_UNIT;
                    bitmap.clear_range(first, first + units_for_bytes(taken.len));
                }
                debug!(nstrips, chunk_size, bytes, placed = strips.len(), "interleaved allocation rolled back");
                return Err(match err {
                    FamError::NoSpace { .. } => FamError::NoSpace { requested: bytes },
                    other => other,
                });
            }
        }
    }
    Ok(InterleavedExtent {
        chunk_size,
        nbytes: bytes,
        strips,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_types::MIB;

    fn premarked(nbits: u64, reserved: u64) -> AllocBitmap {
        let mut bm = AllocBitmap::new(nbits);
        bm.set_range(0, reserved);
        bm
    }

    #[test]
    fn first_fit_after_reserved() {
        let mut bm = premarked(64, 5);
        assert_eq!(alloc_contiguous(&mut bm, 1).expect("alloc"), 10 * MIB);
        assert_eq!(alloc_contiguous(&mut bm, 4 * MIB).expect("alloc"), 12 * MIB);
        assert_eq!(alloc_contiguous(&mut bm, 3 * MIB).expect("alloc"), 16 * MIB);
        assert_eq!(bm.count_set(), 5 + 1 + 2 + 2);
    }

    #[test]
    fn first_fit_reuses_earliest_hole() {
        let mut bm = premarked(64, 5);
        bm.set_range(7, 9);
        // hole of two units at 5..7
        assert_eq!(alloc_contiguous(&mut bm, 4 * MIB).expect("alloc"), 10 * MIB);
        assert_eq!(alloc_contiguous(&mut bm, 6 * MIB).expect("alloc"), 18 * MIB);
    }

    #[test]
    fn exhaustion_leaves_bitmap_unchanged() {
        let mut bm = premarked(8, 5);
        let before = bm.clone();
        assert!(matches!(
            alloc_contiguous(&mut bm, 8 * MIB),
            Err(FamError::NoSpace { requested }) if requested == 8 * MIB
        ));
        assert_eq!(bm, before);
    }

    #[test]
    fn zero_byte_request_rejected() {
        let mut bm = premarked(8, 5);
        assert!(matches!(
            alloc_contiguous(&mut bm, 0),
            Err(FamError::InvalidInput(_))
        ));
    }

    #[test]
    fn simple_extent_rounds_len() {
        let mut bm = premarked(16, 5);
        let ext = alloc_simple(&mut bm, 3 * MIB).expect("alloc");
        assert_eq!(ext, SimpleExtent::new(10 * MIB, 4 * MIB));
    }

    #[test]
    fn interleaved_places_every_strip() {
        let mut bm = premarked(64, 5);
        let ext = alloc_interleaved(&mut bm, 4, 2 * MIB, 16 * MIB).expect("alloc");
        assert_eq!(ext.strips.len(), 4);
        assert!(ext.strips.iter().all(|s| s.len == 4 * MIB));
        assert_eq!(ext.strips[0].offset, 10 * MIB);
        assert_eq!(ext.strips[3].offset, 22 * MIB);
        fam_ondisk::Extent::Interleaved(ext)
            .validate()
            .expect("valid extent");
    }

    #[test]
    fn interleaved_failure_rolls_back() {
        // 5 reserved + 6 free units: room for three 2-unit strips, not four.
        let mut bm = premarked(11, 5);
        let before = bm.clone();
        assert!(matches!(
            alloc_interleaved(&mut bm, 4, 2 * MIB, 16 * MIB),
            Err(FamError::NoSpace { .. })
        ));
        assert_eq!(bm, before);
    }

    #[test]
    fn interleaved_rejects_bad_geometry() {
        let mut bm = premarked(64, 5);
        assert!(alloc_interleaved(&mut bm, 0, 2 * MIB, MIB).is_err());
        assert!(alloc_interleaved(&mut bm, 9, 2 * MIB, MIB).is_err());
        assert!(alloc_interleaved(&mut bm, 2, 1000, MIB).is_err());
        assert!(alloc_interleaved(&mut bm, 2, 2 * MIB, 0).is_err());
    }
}
