//! Formatting a device and exposing it at a mount point.

use crate::config::FamConfig;
use crate::meta::MetaPaths;
use fam_block::{ByteDevice, FileByteDevice, read_log_region, read_superblock_region};
use fam_error::{FamError, Result};
use fam_journal::Role;
use fam_ondisk::{
    DeviceInfo, LogHeader, Superblock, parse_error_to_fam, validate_log_header,
    validate_superblock,
};
use fam_types::{
    FAMFS_ALLOC_UNIT, FAMFS_DEVNAME_LEN, FAMFS_LOG_LEN, FAMFS_LOG_OFFSET,
    FAMFS_SUPERBLOCK_STRUCT_SIZE, FamUuid,
};
use serde::Serialize;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MkfsOptions {
    /// Overwrite a valid superblock.
    pub force: bool,
    /// Invalidate the superblock instead of writing a new one.
    pub kill: bool,
    pub log_len: u64,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            force: false,
            kill: false,
            log_len: FAMFS_LOG_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MkfsOutcome {
    Created {
        device: String,
        device_size: u64,
        fs_uuid: String,
        system_uuid: String,
        log_len: u64,
    },
    Killed {
        device: String,
    },
}

/// Format `device` with an empty log.
///
/// A valid superblock is only replaced with `force`. With `kill` the
/// superblock is zeroed and nothing new is written, after which a plain
/// `mkfs` succeeds again.
pub fn mkfs(config: &FamConfig, device: &Path, opts: &MkfsOptions) -> Result<MkfsOutcome> {
    let dev = FileByteDevice::open_writable(device)?;
    let existing = read_superblock_region(&dev)
        .ok()
        .and_then(|bytes| Superblock::parse_validated(&bytes).ok());
    if let Some(sb) = &existing {
        if !opts.force {
            return Err(FamError::SuperblockExists(device.display().to_string()));
        }
        debug!(device = %device.display(), fs_uuid = %sb.fs_uuid, "overwriting existing superblock");
    }

    if opts.kill {
        dev.write_all_at(0, &[0_u8; FAMFS_SUPERBLOCK_STRUCT_SIZE])?;
        dev.sync()?;
        info!(device = %device.display(), "superblock invalidated");
        return Ok(MkfsOutcome::Killed {
            device: device.display().to_string(),
        });
    }

    let header = LogHeader::new(opts.log_len).map_err(|e| parse_error_to_fam(&e))?;
    let device_size = dev.len_bytes();
    let minimum = FAMFS_LOG_OFFSET + opts.log_len + FAMFS_ALLOC_UNIT;
    if device_size < minimum {
        return Err(FamError::InvalidInput(format!(
            "{} is {device_size} bytes, need at least {minimum}",
            device.display()
        )));
    }
    let name = fs::canonicalize(device)?
        .to_str()
        .ok_or_else(|| FamError::InvalidInput(format!("{} is not valid UTF-8", device.display())))?
        .to_owned();
    if name.len() >= FAMFS_DEVNAME_LEN {
        return Err(FamError::NameTooLong);
    }

    let system_uuid = config.ensure_host_system_uuid()?;
    let fs_uuid = FamUuid::generate(name.as_bytes());
    let mut sb = Superblock::new(
        fs_uuid,
        system_uuid,
        opts.log_len,
        DeviceInfo {
            name: name.clone(),
            size: device_size,
        },
    );
    let sb_bytes = sb.encode().map_err(|e| parse_error_to_fam(&e))?;
    let hdr_bytes = header.encode().map_err(|e| parse_error_to_fam(&e))?;

    // The log goes down first so a valid superblock never points at garbage.
    dev.write_all_at(FAMFS_LOG_OFFSET, &hdr_bytes)?;
    dev.sync()?;
    dev.write_all_at(0, &sb_bytes)?;
    dev.sync()?;

    info!(device = %name, %fs_uuid, %system_uuid, log_len = opts.log_len, device_size, "formatted");
    Ok(MkfsOutcome::Created {
        device: name,
        device_size,
        fs_uuid: fs_uuid.to_string(),
        system_uuid: system_uuid.to_string(),
        log_len: opts.log_len,
    })
}

/// Create `.meta/.superblock` and `.meta/.log` under `mountpoint` from the
/// regions on `device`.
///
/// Rerunning against the same file system refreshes the meta files; meta
/// files of a different file system are left alone.
pub fn mkmeta(config: &FamConfig, device: &Path, mountpoint: &Path) -> Result<MetaPaths> {
    if !mountpoint.is_dir() {
        return Err(FamError::NotDirectory(mountpoint.display().to_string()));
    }
    let dev = FileByteDevice::open_read_only(device)?;
    let sb_bytes = read_superblock_region(&dev)?;
    let sb = validate_superblock(&sb_bytes)?;
    let log = read_log_region(&dev, sb.log_len)?;
    validate_log_header(&log)?;

    let meta = MetaPaths::for_mount(mountpoint);
    if meta.superblock.exists() {
        let current = fs::read(&meta.superblock)?;
        match validate_superblock(&current) {
            Ok(other) if other.fs_uuid != sb.fs_uuid => {
                return Err(FamError::Exists(format!(
                    "{} belongs to file system {}",
                    meta.meta_dir().display(),
                    other.fs_uuid
                )));
            }
            _ => debug!(mount = %mountpoint.display(), "refreshing meta files"),
        }
    }
    fs::create_dir_all(meta.meta_dir())?;

    let log_mode = match config.resolve_role(&sb) {
        Role::Owner => 0o644,
        Role::Client => 0o444,
    };
    replace_file(&meta.superblock, &sb_bytes, 0o444)?;
    replace_file(&meta.log, &log, log_mode)?;

    info!(mount = %mountpoint.display(), fs_uuid = %sb.fs_uuid, "meta files created");
    Ok(meta)
}

fn replace_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    fs::write(path, contents)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}
