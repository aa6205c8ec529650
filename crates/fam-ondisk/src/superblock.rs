//! The famfs superblock: identity, log geometry and backing devices.
//!
//! Encoded little-endian in the first [`FAMFS_SUPERBLOCK_STRUCT_SIZE`] bytes
//! of the device. The CRC is crc32c over those bytes with the `crc` field
//! zeroed.

use fam_types::{
    FAMFS_ALLOC_UNIT, FAMFS_CURRENT_VERSION, FAMFS_DEVNAME_LEN, FAMFS_LOG_OFFSET,
    FAMFS_MAX_DEVICES, FAMFS_SUPER_MAGIC, FAMFS_SUPERBLOCK_STRUCT_SIZE,
    FamUuid, ParseError, ensure_slice, read_fixed, read_le_u32, read_le_u64, trim_nul_padded,
    write_le_u32, write_le_u64, write_nul_padded,
};
use serde::{Deserialize, Serialize};

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_CRC: usize = 12;
const OFF_FS_UUID: usize = 16;
const OFF_SYSTEM_UUID: usize = 32;
const OFF_LOG_OFFSET: usize = 48;
const OFF_LOG_LEN: usize = 56;
const OFF_NUM_DEVICES: usize = 64;
const OFF_DEVICES: usize = 72;
const DEVICE_ENTRY_SIZE: usize = FAMFS_DEVNAME_LEN + 8;

/// One backing DAX device as recorded at mkfs time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u64,
    pub version: u32,
    pub crc: u32,
    pub fs_uuid: FamUuid,
    pub system_uuid: FamUuid,
    pub log_offset: u64,
    pub log_len: u64,
    /// Device count as recorded; `devices` holds at most
    /// [`FAMFS_MAX_DEVICES`] of them.
    pub num_devices: u32,
    pub devices: Vec<DeviceInfo>,
}

impl Superblock {
    /// Build a fresh superblock for a single-device instance. The CRC is
    /// filled in by [`Superblock::encode`].
    #[must_use]
    pub fn new(
        fs_uuid: FamUuid,
        system_uuid: FamUuid,
        log_len: u64,
        device: DeviceInfo,
    ) -> Self {
        Self {
            magic: FAMFS_SUPER_MAGIC,
            version: FAMFS_CURRENT_VERSION,
            crc: 0,
            fs_uuid,
            system_uuid,
            log_offset: FAMFS_LOG_OFFSET,
            log_len,
            num_devices: 1,
            devices: vec![device],
        }
    }

    /// Decode the fields of a superblock region without validating them.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(region, 0, FAMFS_SUPERBLOCK_STRUCT_SIZE)?;

        let num_devices = read_le_u32(region, OFF_NUM_DEVICES)?;
        let listed = (num_devices as usize).min(FAMFS_MAX_DEVICES);
        let mut devices = Vec::with_capacity(listed);
        for i in 0..listed {
            let at = OFF_DEVICES + i * DEVICE_ENTRY_SIZE;
            let name: [u8; FAMFS_DEVNAME_LEN] = read_fixed(region, at)?;
            devices.push(DeviceInfo {
                name: trim_nul_padded(&name),
                size: read_le_u64(region, at + FAMFS_DEVNAME_LEN)?,
            });
        }

        Ok(Self {
            magic: read_le_u64(region, OFF_MAGIC)?,
            version: read_le_u32(region, OFF_VERSION)?,
            crc: read_le_u32(region, OFF_CRC)?,
            fs_uuid: FamUuid(read_fixed(region, OFF_FS_UUID)?),
            system_uuid: FamUuid(read_fixed(region, OFF_SYSTEM_UUID)?),
            log_offset: read_le_u64(region, OFF_LOG_OFFSET)?,
            log_len: read_le_u64(region, OFF_LOG_LEN)?,
            num_devices,
            devices,
        })
    }

    /// Decode and validate a superblock region (magic, version, then CRC).
    pub fn parse_validated(region: &[u8]) -> Result<Self, ParseError> {
        let sb = Self::parse(region)?;
        if sb.magic != FAMFS_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: FAMFS_SUPER_MAGIC,
                actual: sb.magic,
            });
        }
        if sb.version != FAMFS_CURRENT_VERSION {
            return Err(ParseError::UnsupportedVersion {
                expected: FAMFS_CURRENT_VERSION,
                actual: sb.version,
            });
        }
        let computed = region_crc(region)?;
        if computed != sb.crc {
            return Err(ParseError::ChecksumMismatch {
                structure: "superblock",
                stored: sb.crc,
                computed,
            });
        }
        sb.validate_geometry()?;
        Ok(sb)
    }

    /// Check the log placement and device list against the fixed layout.
    /// The primary device must be large enough to hold the superblock and
    /// log regions.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.log_offset != FAMFS_LOG_OFFSET {
            return Err(ParseError::InvalidField {
                field: "log_offset",
                reason: "log must follow the superblock region",
            });
        }
        crate::log::validate_log_len(self.log_len)?;
        if self.num_devices == 0
            || self.num_devices as usize > FAMFS_MAX_DEVICES
            || self.devices.len() != self.num_devices as usize
        {
            return Err(ParseError::InvalidField {
                field: "num_devices",
                reason: "device count out of range",
            });
        }
        let end = self
            .log_offset
            .checked_add(self.log_len)
            .ok_or(ParseError::InvalidField {
                field: "log_len",
                reason: "log end overflows",
            })?;
        if self.device_capacity() < end {
            return Err(ParseError::InvalidField {
                field: "device.size",
                reason: "device smaller than the superblock and log regions",
            });
        }
        Ok(())
    }

    /// Encode into a [`FAMFS_SUPERBLOCK_STRUCT_SIZE`] buffer, computing and
    /// storing the CRC.
    pub fn encode(&mut self) -> Result<Vec<u8>, ParseError> {
        if self.devices.len() > FAMFS_MAX_DEVICES {
            return Err(ParseError::InvalidField {
                field: "num_devices",
                reason: "device count out of range",
            });
        }
        let mut buf = vec![0_u8; FAMFS_SUPERBLOCK_STRUCT_SIZE];
        write_le_u64(&mut buf, OFF_MAGIC, self.magic)?;
        write_le_u32(&mut buf, OFF_VERSION, self.version)?;
        buf[OFF_FS_UUID..OFF_FS_UUID + 16].copy_from_slice(&self.fs_uuid.0);
        buf[OFF_SYSTEM_UUID..OFF_SYSTEM_UUID + 16].copy_from_slice(&self.system_uuid.0);
        write_le_u64(&mut buf, OFF_LOG_OFFSET, self.log_offset)?;
        write_le_u64(&mut buf, OFF_LOG_LEN, self.log_len)?;
        let num_devices = u32::try_from(self.devices.len())
            .map_err(|_| ParseError::IntegerConversion { field: "num_devices" })?;
        write_le_u32(&mut buf, OFF_NUM_DEVICES, num_devices)?;
        self.num_devices = num_devices;
        for (i, dev) in self.devices.iter().enumerate() {
            let at = OFF_DEVICES + i * DEVICE_ENTRY_SIZE;
            write_nul_padded(&mut buf, at, FAMFS_DEVNAME_LEN, dev.name.as_bytes(), "device.name")?;
            write_le_u64(&mut buf, at + FAMFS_DEVNAME_LEN, dev.size)?;
        }
        self.crc = region_crc(&buf)?;
        write_le_u32(&mut buf, OFF_CRC, self.crc)?;
        Ok(buf)
    }

    /// Capacity of the primary device in bytes (0 if none is recorded).
    #[must_use]
    pub fn device_capacity(&self) -> u64 {
        self.devices.first().map_or(0, |d| d.size)
    }

    #[must_use]
    pub fn primary_device(&self) -> Option<&DeviceInfo> {
        self.devices.first()
    }

    /// First byte past the log; the data region starts here.
    #[must_use]
    pub fn data_offset(&self) -> u64 {
        self.log_offset.saturating_add(self.log_len)
    }

    /// Allocation units covered by the superblock and log regions.
    #[must_use]
    pub fn reserved_units(&self) -> u64 {
        self.data_offset() / FAMFS_ALLOC_UNIT
    }
}

/// crc32c over the encoded structure with the `crc` field treated as zero.
pub fn region_crc(region: &[u8]) -> Result<u32, ParseError> {
    let bytes = ensure_slice(region, 0, FAMFS_SUPERBLOCK_STRUCT_SIZE)?;
    let mut crc = crc32c::crc32c(&bytes[..OFF_CRC]);
    crc = crc32c::crc32c_append(crc, &[0_u8; 4]);
    Ok(crc32c::crc32c_append(crc, &bytes[OFF_CRC + 4..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_types::{FAMFS_LOG_LEN, GIB};

    fn sample() -> Superblock {
        Superblock::new(
            FamUuid([1; 16]),
            FamUuid([2; 16]),
            FAMFS_LOG_LEN,
            DeviceInfo {
                name: "/dev/dax0.0".into(),
                size: 8 * GIB,
            },
        )
    }

    #[test]
    fn encode_parse_validates() {
        let mut sb = sample();
        let bytes = sb.encode().unwrap();
        assert_eq!(bytes.len(), FAMFS_SUPERBLOCK_STRUCT_SIZE);
        let parsed = Superblock::parse_validated(&bytes).unwrap();
        assert_eq!(parsed, sb);
        assert_eq!(parsed.device_capacity(), 8 * GIB);
        assert_eq!(parsed.data_offset(), FAMFS_LOG_OFFSET + FAMFS_LOG_LEN);
        assert_eq!(parsed.reserved_units(), 5);
    }

    #[test]
    fn magic_version_crc_flips_toggle_validity() {
        let bytes = sample().encode().unwrap();

        for (offset, want) in [(OFF_MAGIC, "magic"), (OFF_VERSION, "version"), (OFF_CRC, "crc")] {
            let mut corrupt = bytes.clone();
            corrupt[offset] ^= 0x01;
            let err = Superblock::parse_validated(&corrupt).unwrap_err();
            match (want, &err) {
                ("magic", ParseError::InvalidMagic { .. })
                | ("version", ParseError::UnsupportedVersion { .. })
                | ("crc", ParseError::ChecksumMismatch { .. }) => {}
                _ => panic!("flip at {offset} produced {err:?}"),
            }
            corrupt[offset] ^= 0x01;
            Superblock::parse_validated(&corrupt).expect("restored bytes validate");
        }
    }

    #[test]
    fn body_corruption_breaks_crc() {
        let mut bytes = sample().encode().unwrap();
        bytes[OFF_DEVICES + 3] ^= 0xFF;
        assert!(matches!(
            Superblock::parse_validated(&bytes),
            Err(ParseError::ChecksumMismatch {
                structure: "superblock",
                ..
            })
        ));
    }

    #[test]
    fn zeroed_region_is_bad_magic() {
        let zeros = vec![0_u8; FAMFS_SUPERBLOCK_STRUCT_SIZE];
        assert!(matches!(
            Superblock::parse_validated(&zeros),
            Err(ParseError::InvalidMagic { actual: 0, .. })
        ));
    }

    #[test]
    fn truncated_region_rejected() {
        let short = vec![0_u8; 100];
        assert!(matches!(
            Superblock::parse(&short),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn overlong_device_name_rejected() {
        let mut sb = sample();
        sb.devices[0].name = "x".repeat(FAMFS_DEVNAME_LEN);
        assert!(sb.encode().is_err());
    }
}
