//! fsck entry point: pick the regions to scan from a device or mount path.

use crate::meta::{LOG_FILE, META_DIR, MetaPaths, SUPERBLOCK_FILE, find_meta};
use fam_block::{ByteDevice, FileByteDevice, read_log_region, read_superblock_region};
use fam_error::Result;
use fam_ondisk::Superblock;
use fam_repair::{FsckReport, scan};
use fam_types::{FAMFS_LOG_HEADER_SIZE, FAMFS_LOG_OFFSET, FAMFS_SUPERBLOCK_STRUCT_SIZE};
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsckOptions {
    /// Log every replayed entry.
    pub verbose: bool,
}

/// Where an fsck path points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsckTarget {
    Device,
    Mount(MetaPaths),
}

/// A directory inside a mount or one of the meta files selects the mount's
/// meta files; anything else is treated as a device.
pub fn fsck_target(path: &Path) -> Result<FsckTarget> {
    if path.is_dir() {
        return Ok(FsckTarget::Mount(find_meta(path)?));
    }
    let in_meta_dir = path
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|name| name == META_DIR);
    let is_meta_file = path
        .file_name()
        .is_some_and(|name| name == SUPERBLOCK_FILE || name == LOG_FILE);
    if in_meta_dir && is_meta_file {
        if let Some(root) = path.parent().and_then(Path::parent) {
            return Ok(FsckTarget::Mount(MetaPaths::for_mount(root)));
        }
    }
    Ok(FsckTarget::Device)
}

/// Scan the instance at `path`. Unreadable regions produce a `Fatal`
/// report rather than an error.
pub fn fsck(path: &Path, opts: &FsckOptions) -> Result<FsckReport> {
    let report = match fsck_target(path)? {
        FsckTarget::Device => scan_device(path, opts),
        FsckTarget::Mount(meta) => scan_meta_files(&meta, opts),
    };
    debug!(path = %path.display(), tier = %report.tier(), "fsck finished");
    Ok(report)
}

fn scan_device(path: &Path, opts: &FsckOptions) -> FsckReport {
    let dev = match FileByteDevice::open_read_only(path) {
        Ok(dev) => dev,
        Err(err) => return FsckReport::unreadable("device", &err.to_string()),
    };
    let sb = match read_superblock_region(&dev) {
        Ok(sb) => sb,
        Err(err) => return FsckReport::unreadable("superblock", &err.to_string()),
    };
    // An invalid superblock stops the scan before the log is looked at.
    let parsed = Superblock::parse(&sb).ok();
    if let Some(recorded) = parsed.as_ref().map(Superblock::device_capacity) {
        if recorded > dev.len_bytes() {
            return FsckReport::unreadable(
                "device",
                &format!(
                    "superblock records {recorded} bytes, device has {}",
                    dev.len_bytes()
                ),
            );
        }
    }
    let log_len = parsed.map_or(FAMFS_LOG_HEADER_SIZE as u64, |s| s.log_len);
    let log_len = log_len.min(dev.len_bytes().saturating_sub(FAMFS_LOG_OFFSET));
    let log = match read_log_region(&dev, log_len) {
        Ok(log) => log,
        Err(err) => return FsckReport::unreadable("log", &err.to_string()),
    };
    scan(&sb, &log, opts.verbose)
}

fn scan_meta_files(meta: &MetaPaths, opts: &FsckOptions) -> FsckReport {
    let sb = match fs::read(&meta.superblock) {
        Ok(bytes) => bytes,
        Err(err) => return FsckReport::unreadable("superblock file", &err.to_string()),
    };
    let log = match fs::read(&meta.log) {
        Ok(bytes) => bytes,
        Err(err) => return FsckReport::unreadable("log file", &err.to_string()),
    };
    let sb_len = sb.len() as u64;
    let log_len = log.len() as u64;
    let region = &sb[..sb.len().min(FAMFS_SUPERBLOCK_STRUCT_SIZE)];
    let mut report = scan(region, &log, opts.verbose);
    report.check_meta_files(sb_len, log_len);
    report
}
