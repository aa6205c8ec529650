#![forbid(unsafe_code)]
//! Locked-log sessions: the only write path into the famfs metadata log.
//!
//! A [`LockedLog`] takes an advisory lock on the log, validates the
//! superblock and log header, and then lets its owner allocate space and
//! append entries one at a time. Each append writes the entry slot first
//! and then bumps `next_seqnum`/`next_index` in a single trailing write, so
//! a crash between the two leaves the entry invisible rather than torn.

mod session;

pub use session::{LockedLog, SessionOptions, SessionState};

use fam_block::{ByteDevice, FileByteDevice, Region};
use fam_error::{FamError, Result};
use fam_types::FAMFS_LOG_OFFSET;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// How a session acquires the log lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Skip locking entirely (single-process tests).
    NoLock,
    /// Wait for the lock.
    #[default]
    Blocking,
    /// Fail with `WouldBlock` if another session holds the lock.
    NonBlocking,
}

/// Whether this host may write the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => write!(f, "owner"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Where a session reads the superblock and the log, and which file it
/// locks.
///
/// Both devices are addressed relative to their own structure: offset 0 of
/// `superblock` is the superblock, offset 0 of `log` is the log header.
///
/// `flock` locks belong to an open file description, so `lock_file` must
/// be a fresh open of the lock path, never a `try_clone` of a descriptor
/// another session may lock through.
pub struct LogTarget {
    pub superblock: Arc<dyn ByteDevice>,
    pub log: Arc<dyn ByteDevice>,
    pub lock_file: Option<File>,
}

impl std::fmt::Debug for LogTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTarget")
            .field("superblock_len", &self.superblock.len_bytes())
            .field("log_len", &self.log.len_bytes())
            .field("lockable", &self.lock_file.is_some())
            .finish()
    }
}

impl LogTarget {
    #[must_use]
    pub fn new(
        superblock: Arc<dyn ByteDevice>,
        log: Arc<dyn ByteDevice>,
        lock_file: Option<File>,
    ) -> Self {
        Self {
            superblock,
            log,
            lock_file,
        }
    }

    /// Target the `.meta/.superblock` and `.meta/.log` files of a mounted
    /// instance. The log file is the lock file.
    pub fn from_meta_files(superblock: &Path, log: &Path) -> Result<Self> {
        let sb = FileByteDevice::open_read_only(superblock)?;
        let log_dev = FileByteDevice::open_writable(log)?;
        let lock_file = File::open(log)?;
        Ok(Self::new(Arc::new(sb), Arc::new(log_dev), Some(lock_file)))
    }

    /// Target a raw device that holds the superblock at 0 and the log at
    /// `FAMFS_LOG_OFFSET`. The device itself is the lock file.
    pub fn from_device(path: &Path) -> Result<Self> {
        let dev = Arc::new(FileByteDevice::open_writable(path)?);
        let len = dev.len_bytes();
        let log_len = len.checked_sub(FAMFS_LOG_OFFSET).ok_or_else(|| {
            FamError::Format(format!(
                "{} is too small ({len} bytes) to hold a log",
                path.display()
            ))
        })?;
        let log = Region::new(Arc::clone(&dev), FAMFS_LOG_OFFSET, log_len)?;
        let lock_file = File::open(path)?;
        Ok(Self::new(dev, Arc::new(log), Some(lock_file)))
    }
}
