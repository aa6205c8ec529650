//! Extent variants and their fixed-size on-disk slot encoding.
//!
//! Each slot is [`EXTENT_SLOT_SIZE`] bytes:
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | `tag u32` (1 simple, 2 interleaved) |
//! | 4 | `nstrips u32` |
//! | 8 | `chunk_size u64` |
//! | 16 | `nbytes u64` |
//! | 24 | up to 8 × `{dev_index u64, offset u64, len u64}` |

use fam_types::{
    FAMFS_ALLOC_UNIT, FAMFS_MAX_STRIPS, PAGE_SIZE, ParseError, is_unit_aligned, read_le_u32,
    read_le_u64, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const EXTENT_SLOT_SIZE: usize = 224;
const SIMPLE_DESC_SIZE: usize = 24;
const STRIPS_OFFSET: usize = 24;

const TAG_SIMPLE: u32 = 1;
const TAG_INTERLEAVED: u32 = 2;

/// A contiguous run on one backing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleExtent {
    pub dev_index: u64,
    pub offset: u64,
    pub len: u64,
}

impl SimpleExtent {
    #[must_use]
    pub fn new(offset: u64, len: u64) -> Self {
        Self {
            dev_index: 0,
            offset,
            len,
        }
    }

    /// Exclusive end offset, `None` on overflow.
    #[must_use]
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.len)
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        if self.dev_index != 0 {
            return Err(ParseError::InvalidField {
                field: "dev_index",
                reason: "only device 0 is supported",
            });
        }
        if self.offset == 0 {
            return Err(ParseError::InvalidField {
                field: "extent.offset",
                reason: "offset 0 is the superblock",
            });
        }
        if self.len == 0 {
            return Err(ParseError::InvalidField {
                field: "extent.len",
                reason: "zero-length extent",
            });
        }
        if self.end().is_none() {
            return Err(ParseError::IntegerConversion {
                field: "extent.offset+len",
            });
        }
        Ok(())
    }
}

/// An extent striped round-robin across `strips` in `chunk_size` pieces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterleavedExtent {
    pub chunk_size: u64,
    /// Logical bytes covered by this extent.
    pub nbytes: u64,
    pub strips: Vec<SimpleExtent>,
}

impl InterleavedExtent {
    #[must_use]
    pub fn nstrips(&self) -> usize {
        self.strips.len()
    }

    /// Bytes each strip must hold to carry its share of `nbytes`:
    /// `ceil(ceil(nbytes / chunk) / nstrips) * chunk`.
    #[must_use]
    pub fn strip_share(nbytes: u64, nstrips: u64, chunk_size: u64) -> Option<u64> {
        if nstrips == 0 || chunk_size == 0 {
            return None;
        }
        let chunks = nbytes.div_ceil(chunk_size);
        chunks.div_ceil(nstrips).checked_mul(chunk_size)
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        let n = self.strips.len();
        if n == 0 || n > FAMFS_MAX_STRIPS {
            return Err(ParseError::InvalidField {
                field: "nstrips",
                reason: "strip count out of range",
            });
        }
        if self.chunk_size == 0 || self.chunk_size % PAGE_SIZE != 0 {
            return Err(ParseError::InvalidField {
                field: "chunk_size",
                reason: "must be a nonzero multiple of the page size",
            });
        }
        if self.nbytes == 0 {
            return Err(ParseError::InvalidField {
                field: "nbytes",
                reason: "zero-length interleaved extent",
            });
        }
        let share = Self::strip_share(self.nbytes, n as u64, self.chunk_size).ok_or(
            ParseError::IntegerConversion {
                field: "strip share",
            },
        )?;
        for strip in &self.strips {
            strip.validate()?;
            if strip.len < share {
                return Err(ParseError::InvalidField {
                    field: "strip.len",
                    reason: "strip too short for its share of nbytes",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extent {
    Simple(SimpleExtent),
    Interleaved(InterleavedExtent),
}

impl Extent {
    /// Logical file bytes this extent contributes.
    #[must_use]
    pub fn logical_len(&self) -> u64 {
        match self {
            Self::Simple(s) => s.len,
            Self::Interleaved(i) => i.nbytes,
        }
    }

    /// The device ranges backing this extent (one for simple, one per strip
    /// for interleaved).
    #[must_use]
    pub fn device_ranges(&self) -> &[SimpleExtent] {
        match self {
            Self::Simple(s) => std::slice::from_ref(s),
            Self::Interleaved(i) => &i.strips,
        }
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        match self {
            Self::Simple(s) => s.validate(),
            Self::Interleaved(i) => i.validate(),
        }
    }

    pub fn decode(slot: &[u8]) -> Result<Self, ParseError> {
        let tag = read_le_u32(slot, 0)?;
        let nstrips = read_le_u32(slot, 4)?;
        let chunk_size = read_le_u64(slot, 8)?;
        let nbytes = read_le_u64(slot, 16)?;
        match tag {
            TAG_SIMPLE => Ok(Self::Simple(decode_simple(slot, STRIPS_OFFSET)?)),
            TAG_INTERLEAVED => {
                let n = nstrips as usize;
                if n == 0 || n > FAMFS_MAX_STRIPS {
                    return Err(ParseError::InvalidField {
                        field: "nstrips",
                        reason: "strip count out of range",
                    });
                }
                let strips = (0..n)
                    .map(|i| decode_simple(slot, STRIPS_OFFSET + i * SIMPLE_DESC_SIZE))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Interleaved(InterleavedExtent {
                    chunk_size,
                    nbytes,
                    strips,
                }))
            }
            _ => Err(ParseError::InvalidField {
                field: "extent.tag",
                reason: "unknown extent type",
            }),
        }
    }

    /// Encode into a zeroed slot of at least [`EXTENT_SLOT_SIZE`] bytes.
    pub fn encode_into(&self, slot: &mut [u8]) -> Result<(), ParseError> {
        match self {
            Self::Simple(s) => {
                write_le_u32(slot, 0, TAG_SIMPLE)?;
                write_le_u32(slot, 4, 0)?;
                write_le_u64(slot, 8, 0)?;
                write_le_u64(slot, 16, s.len)?;
                encode_simple(slot, STRIPS_OFFSET, s)
            }
            Self::Interleaved(i) => {
                if i.strips.len() > FAMFS_MAX_STRIPS {
                    return Err(ParseError::InvalidField {
                        field: "nstrips",
                        reason: "strip count out of range",
                    });
                }
                let nstrips = u32::try_from(i.strips.len())
                    .map_err(|_| ParseError::IntegerConversion { field: "nstrips" })?;
                write_le_u32(slot, 0, TAG_INTERLEAVED)?;
                write_le_u32(slot, 4, nstrips)?;
                write_le_u64(slot, 8, i.chunk_size)?;
                write_le_u64(slot, 16, i.nbytes)?;
                for (idx, strip) in i.strips.iter().enumerate() {
                    encode_simple(slot, STRIPS_OFFSET + idx * SIMPLE_DESC_SIZE, strip)?;
                }
                Ok(())
            }
        }
    }
}

fn decode_simple(slot: &[u8], at: usize) -> Result<SimpleExtent, ParseError> {
    Ok(SimpleExtent {
        dev_index: read_le_u64(slot, at)?,
        offset: read_le_u64(slot, at + 8)?,
        len: read_le_u64(slot, at + 16)?,
    })
}

fn encode_simple(slot: &mut [u8], at: usize, s: &SimpleExtent) -> Result<(), ParseError> {
    write_le_u64(slot, at, s.dev_index)?;
    write_le_u64(slot, at + 8, s.offset)?;
    write_le_u64(slot, at + 16, s.len)
}

/// Validate a whole extent list as carried by a `FILE` entry.
///
/// Every extent must be individually valid, device offsets must be
/// allocation-unit aligned, every extent but the last must have a unit
/// aligned length, and the logical total must not overflow. Returns the
/// logical total.
pub fn validate_extent_list(extents: &[Extent]) -> Result<u64, ParseError> {
    let mut total = 0_u64;
    let last = extents.len().saturating_sub(1);
    for (idx, extent) in extents.iter().enumerate() {
        extent.validate()?;
        for range in extent.device_ranges() {
            if !is_unit_aligned(range.offset) {
                return Err(ParseError::InvalidField {
                    field: "extent.offset",
                    reason: "not aligned to the allocation unit",
                });
            }
        }
        if idx != last && extent.logical_len() % FAMFS_ALLOC_UNIT != 0 {
            return Err(ParseError::InvalidField {
                field: "extent.len",
                reason: "non-final extent not aligned to the allocation unit",
            });
        }
        total = total
            .checked_add(extent.logical_len())
            .ok_or(ParseError::IntegerConversion {
                field: "extent list length",
            })?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_types::MIB;

    fn strip(offset_mib: u64, len_mib: u64) -> SimpleExtent {
        SimpleExtent::new(offset_mib * MIB, len_mib * MIB)
    }

    #[test]
    fn simple_slot_round_trip() {
        let ext = Extent::Simple(strip(10, 4));
        let mut slot = [0_u8; EXTENT_SLOT_SIZE];
        ext.encode_into(&mut slot).unwrap();
        assert_eq!(Extent::decode(&slot).unwrap(), ext);
    }

    #[test]
    fn interleaved_slot_round_trip() {
        let ext = Extent::Interleaved(InterleavedExtent {
            chunk_size: 2 * MIB,
            nbytes: 16 * MIB,
            strips: vec![strip(10, 4), strip(14, 4), strip(18, 4), strip(22, 4)],
        });
        let mut slot = [0_u8; EXTENT_SLOT_SIZE];
        ext.encode_into(&mut slot).unwrap();
        assert_eq!(Extent::decode(&slot).unwrap(), ext);
        ext.validate().unwrap();
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut slot = [0_u8; EXTENT_SLOT_SIZE];
        slot[0] = 7;
        assert!(matches!(
            Extent::decode(&slot),
            Err(ParseError::InvalidField {
                field: "extent.tag",
                ..
            })
        ));
    }

    #[test]
    fn simple_extent_rules() {
        assert!(SimpleExtent::new(0, MIB).validate().is_err());
        assert!(SimpleExtent::new(2 * MIB, 0).validate().is_err());
        let mut other_dev = SimpleExtent::new(2 * MIB, MIB);
        other_dev.dev_index = 1;
        assert!(other_dev.validate().is_err());
        assert!(SimpleExtent::new(u64::MAX, 2).validate().is_err());
    }

    #[test]
    fn interleaved_rules() {
        let good = InterleavedExtent {
            chunk_size: 2 * MIB,
            nbytes: 10 * MIB,
            strips: vec![strip(10, 4), strip(14, 4), strip(18, 4)],
        };
        good.validate().unwrap();

        let mut bad_chunk = good.clone();
        bad_chunk.chunk_size = 4097;
        assert!(bad_chunk.validate().is_err());

        let mut short_strip = good.clone();
        short_strip.strips[1].len = 2 * MIB;
        assert!(short_strip.validate().is_err());

        let mut none = good;
        none.strips.clear();
        assert!(none.validate().is_err());
    }

    #[test]
    fn strip_share_math() {
        assert_eq!(
            InterleavedExtent::strip_share(16 * MIB, 4, 2 * MIB),
            Some(4 * MIB)
        );
        assert_eq!(
            InterleavedExtent::strip_share(17 * MIB, 4, 2 * MIB),
            Some(6 * MIB)
        );
        assert_eq!(InterleavedExtent::strip_share(1, 0, 2 * MIB), None);
    }

    #[test]
    fn extent_list_alignment() {
        let list = vec![Extent::Simple(strip(10, 4)), Extent::Simple(strip(20, 3))];
        assert_eq!(validate_extent_list(&list).unwrap(), 7 * MIB);

        let unaligned_middle = vec![Extent::Simple(strip(10, 3)), Extent::Simple(strip(20, 4))];
        assert!(validate_extent_list(&unaligned_middle).is_err());

        let unaligned_offset = vec![Extent::Simple(strip(11, 4))];
        assert!(validate_extent_list(&unaligned_offset).is_err());
    }
}
