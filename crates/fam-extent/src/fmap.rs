//! fmap wire codec.
//!
//! A self-contained little-endian message describing one file's map, for
//! collaborators (fault handlers, FUSE servers) that resolve offsets on
//! their own:
//!
//! | Offset | Field |
//! |--------|-------|
//! | 0 | `magic u32` |
//! | 4 | `version u32` |
//! | 8 | `file_type u32` |
//! | 12 | `extent_count u32` |
//! | 16 | `size u64` |
//! | 24 | reserved (8 bytes) |
//! | 32 | `extent_count` extent slots, 224 bytes each |

use crate::FileMap;
use fam_ondisk::{Extent, extent::EXTENT_SLOT_SIZE};
use fam_types::{
    FAMFS_MAX_EXTENTS, FileType, ParseError, ensure_slice, read_le_u32, read_le_u64,
    write_le_u32, write_le_u64,
};

pub const FMAP_MAGIC: u32 = 0x464D_4150;
pub const FMAP_VERSION: u32 = 1;
pub const FMAP_HEADER_SIZE: usize = 32;

pub fn encode_fmap(map: &FileMap) -> Result<Vec<u8>, ParseError> {
    let count = map.extents().len();
    let mut buf = vec![0_u8; FMAP_HEADER_SIZE + count * EXTENT_SLOT_SIZE];
    write_le_u32(&mut buf, 0, FMAP_MAGIC)?;
    write_le_u32(&mut buf, 4, FMAP_VERSION)?;
    write_le_u32(&mut buf, 8, map.file_type().to_raw())?;
    let count_raw =
        u32::try_from(count).map_err(|_| ParseError::IntegerConversion { field: "extent_count" })?;
    write_le_u32(&mut buf, 12, count_raw)?;
    write_le_u64(&mut buf, 16, map.size())?;
    for (i, ext) in map.extents().iter().enumerate() {
        let at = FMAP_HEADER_SIZE + i * EXTENT_SLOT_SIZE;
        ext.encode_into(&mut buf[at..at + EXTENT_SLOT_SIZE])?;
    }
    Ok(buf)
}

/// Decode and validate an fmap message.
pub fn decode_fmap(buf: &[u8]) -> Result<FileMap, ParseError> {
    let magic = read_le_u32(buf, 0)?;
    if magic != FMAP_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(FMAP_MAGIC),
            actual: u64::from(magic),
        });
    }
    let version = read_le_u32(buf, 4)?;
    if version != FMAP_VERSION {
        return Err(ParseError::UnsupportedVersion {
            expected: FMAP_VERSION,
            actual: version,
        });
    }
    let file_type = FileType::from_raw(read_le_u32(buf, 8)?)?;
    let count = read_le_u32(buf, 12)? as usize;
    if count > FAMFS_MAX_EXTENTS {
        return Err(ParseError::InvalidField {
            field: "extent_count",
            reason: "more than 8 extents",
        });
    }
    let size = read_le_u64(buf, 16)?;
    let extents = (0..count)
        .map(|i| {
            let at = FMAP_HEADER_SIZE + i * EXTENT_SLOT_SIZE;
            Extent::decode(ensure_slice(buf, at, EXTENT_SLOT_SIZE)?)
        })
        .collect::<Result<Vec<_>, _>>()?;
    FileMap::new(file_type, size, extents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_ondisk::{InterleavedExtent, SimpleExtent};
    use fam_types::MIB;

    fn sample() -> FileMap {
        FileMap::new(
            FileType::Regular,
            9 * MIB,
            vec![
                Extent::Simple(SimpleExtent::new(10 * MIB, 4 * MIB)),
                Extent::Interleaved(InterleavedExtent {
                    chunk_size: 2 * MIB,
                    nbytes: 6 * MIB,
                    strips: vec![
                        SimpleExtent::new(20 * MIB, 4 * MIB),
                        SimpleExtent::new(30 * MIB, 4 * MIB),
                    ],
                }),
            ],
        )
        .expect("map")
    }

    #[test]
    fn fmap_round_trip() {
        let map = sample();
        let wire = encode_fmap(&map).expect("encode");
        assert_eq!(wire.len(), FMAP_HEADER_SIZE + 2 * EXTENT_SLOT_SIZE);
        let back = decode_fmap(&wire).expect("decode");
        assert_eq!(back, map);
        assert_eq!(back.resolve(5 * MIB, 1), map.resolve(5 * MIB, 1));
    }

    #[test]
    fn fmap_rejects_bad_header() {
        let wire = encode_fmap(&sample()).expect("encode");

        let mut bad = wire.clone();
        bad[0] ^= 1;
        assert!(matches!(decode_fmap(&bad), Err(ParseError::InvalidMagic { .. })));

        let mut bad = wire.clone();
        bad[4] = 9;
        assert!(matches!(
            decode_fmap(&bad),
            Err(ParseError::UnsupportedVersion { actual: 9, .. })
        ));

        assert!(matches!(
            decode_fmap(&wire[..FMAP_HEADER_SIZE + 10]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn fmap_decode_revalidates() {
        let mut wire = encode_fmap(&sample()).expect("encode");
        // declare a size larger than the extents cover
        wire[16..24].copy_from_slice(&(64 * MIB).to_le_bytes());
        assert!(decode_fmap(&wire).is_err());
    }
}
