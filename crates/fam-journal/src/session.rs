//! The `LockedLog` session state machine.

use crate::{LockMode, LogTarget, Role};
use fam_alloc::{AllocBitmap, alloc_interleaved, alloc_simple, build_bitmap};
use fam_error::{FamError, Result};
use fam_ondisk::{
    InterleavedExtent, LOG_COUNTERS_OFFSET, LogEntry, LogEntryKind, LogHeader, LogView,
    SimpleExtent, Superblock, entry_offset, parse_error_to_fam, validate_log_header,
    validate_superblock,
};
use fam_block::read_superblock_region;
use fam_types::{FAMFS_ALLOC_UNIT, FAMFS_LOG_HEADER_SIZE};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::File;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    Released,
}

/// Per-session knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub lock_mode: LockMode,
    /// Sync the log device between the entry write and the index bump.
    pub sync_writes: bool,
    /// Log each replayed entry when building the bitmap.
    pub verbose: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            lock_mode: LockMode::Blocking,
            sync_writes: true,
            verbose: false,
        }
    }
}

/// Exclusive, scoped access to the log for allocation and appends.
///
/// `Closed → init → Open → release → Released`. Dropping an open session
/// releases the lock.
#[derive(Debug)]
pub struct LockedLog {
    target: LogTarget,
    opts: SessionOptions,
    state: SessionState,
    guard: Option<Flock<File>>,
    superblock: Option<Superblock>,
    header: Option<LogHeader>,
    bitmap: Option<AllocBitmap>,
}

impl LockedLog {
    #[must_use]
    pub fn new(target: LogTarget, opts: SessionOptions) -> Self {
        Self {
            target,
            opts,
            state: SessionState::Closed,
            guard: None,
            superblock: None,
            header: None,
            bitmap: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn superblock(&self) -> Option<&Superblock> {
        self.superblock.as_ref()
    }

    #[must_use]
    pub fn header(&self) -> Option<&LogHeader> {
        self.header.as_ref()
    }

    /// Acquire the lock and validate the on-device structures.
    ///
    /// A `Client` is refused before any lock is taken. Validation failures
    /// drop the lock and leave the session `Closed`.
    pub fn init(&mut self, role: Role) -> Result<()> {
        if self.state != SessionState::Closed {
            return Err(FamError::InvalidState(format!(
                "init on a {:?} session",
                self.state
            )));
        }
        if role == Role::Client {
            return Err(FamError::NotLogOwner);
        }

        let guard = self.acquire_lock()?;
        let sb = validate_superblock(&read_superblock_region(&*self.target.superblock)?)?;
        let hdr_bytes = self
            .target
            .log
            .read_vec(0, FAMFS_LOG_HEADER_SIZE as u64)?;
        let header = validate_log_header(&hdr_bytes)?;
        if header.len != sb.log_len {
            return Err(FamError::Format(format!(
                "log header length {} does not match superblock log_len {}",
                header.len, sb.log_len
            )));
        }

        info!(
            fs_uuid = %sb.fs_uuid,
            next_index = header.next_index,
            capacity = header.capacity(),
            lock_mode = ?self.opts.lock_mode,
            "log session opened"
        );
        self.guard = guard;
        self.superblock = Some(sb);
        self.header = Some(header);
        self.state = SessionState::Open;
        Ok(())
    }

    fn acquire_lock(&self) -> Result<Option<Flock<File>>> {
        let arg = match self.opts.lock_mode {
            LockMode::NoLock => return Ok(None),
            LockMode::Blocking => FlockArg::LockExclusive,
            LockMode::NonBlocking => FlockArg::LockExclusiveNonblock,
        };
        let file = self
            .target
            .lock_file
            .as_ref()
            .ok_or_else(|| {
                FamError::InvalidInput("lock requested but target has no lock file".into())
            })?
            .try_clone()?;
        match Flock::lock(file, arg) {
            Ok(guard) => {
                debug!(mode = ?self.opts.lock_mode, "log lock acquired");
                Ok(Some(guard))
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(FamError::WouldBlock),
            Err((_, errno)) => Err(FamError::Io(errno.into())),
        }
    }

    fn require_open(&self, op: &str) -> Result<()> {
        if self.state == SessionState::Open {
            Ok(())
        } else {
            Err(FamError::InvalidState(format!(
                "{op} on a {:?} session",
                self.state
            )))
        }
    }

    /// Append one entry, stamping it with the next sequence number.
    /// Returns the slot index it landed in.
    pub fn append(&mut self, mut entry: LogEntry) -> Result<u64> {
        self.require_open("append")?;
        let mut header = self
            .header
            .ok_or_else(|| FamError::InvalidState("open session without header".into()))?;
        if header.is_full() {
            return Err(FamError::LogFull {
                capacity: header.capacity(),
            });
        }

        let index = header.next_index;
        entry.seqnum = header.next_seqnum;
        let slot = entry.encode().map_err(|e| parse_error_to_fam(&e))?;
        let at = entry_offset(index).ok_or_else(|| FamError::Corruption {
            offset: 0,
            detail: format!("entry offset for index {index} overflows"),
        })?;
        self.target.log.write_all_at(at, &slot)?;
        if self.opts.sync_writes {
            self.target.log.sync()?;
        }

        header.next_seqnum += 1;
        header.next_index += 1;
        self.target
            .log
            .write_all_at(LOG_COUNTERS_OFFSET, &header.encode_counters())?;
        if self.opts.sync_writes {
            self.target.log.sync()?;
        }
        self.header = Some(header);

        if let (Some(bitmap), LogEntryKind::File(file)) = (self.bitmap.as_mut(), &entry.kind) {
            for range in file.extents.iter().flat_map(|e| e.device_ranges()) {
                let first = range.offset / FAMFS_ALLOC_UNIT;
                let end = range.offset.saturating_add(range.len).div_ceil(FAMFS_ALLOC_UNIT);
                bitmap.set_range(first, end);
            }
        }

        info!(
            index,
            seqnum = entry.seqnum,
            path = entry.relpath().unwrap_or(""),
            "log entry appended"
        );
        Ok(index)
    }

    /// Whether a `FILE` or `MKDIR` entry for `relpath` is already logged.
    ///
    /// Read under the session lock, so the answer holds until release.
    pub fn exists(&self, relpath: &str) -> Result<bool> {
        self.require_open("exists")?;
        let header = self
            .header
            .ok_or_else(|| FamError::InvalidState("open session without header".into()))?;
        let log = self.target.log.read_vec(0, header.len)?;
        let view = LogView::new(&log).map_err(|e| parse_error_to_fam(&e))?;
        Ok(view
            .entries()
            .filter_map(|(_, decoded)| decoded.ok())
            .any(|entry| entry.relpath() == Some(relpath)))
    }

    /// Replay the log into the session bitmap on first use.
    fn bitmap(&mut self) -> Result<&mut AllocBitmap> {
        if self.bitmap.is_none() {
            let header = self
                .header
                .ok_or_else(|| FamError::InvalidState("open session without header".into()))?;
            let capacity = self
                .superblock
                .as_ref()
                .map_or(0, Superblock::device_capacity);
            let log = self.target.log.read_vec(0, header.len)?;
            let view = LogView::new(&log).map_err(|e| parse_error_to_fam(&e))?;
            let outcome = build_bitmap(&view, capacity, self.opts.verbose);
            if outcome.collisions > 0 {
                warn!(collisions = outcome.collisions, "log contains double allocations");
            }
            self.bitmap = Some(outcome.bitmap);
        }
        self.bitmap
            .as_mut()
            .ok_or_else(|| FamError::InvalidState("bitmap unavailable".into()))
    }

    /// Allocate a simple extent of at least `bytes` bytes.
    pub fn alloc(&mut self, bytes: u64) -> Result<SimpleExtent> {
        self.require_open("alloc")?;
        alloc_simple(self.bitmap()?, bytes)
    }

    /// Allocate an interleaved extent.
    pub fn alloc_interleaved(
        &mut self,
        nstrips: u32,
        chunk_size: u64,
        bytes: u64,
    ) -> Result<InterleavedExtent> {
        self.require_open("alloc")?;
        alloc_interleaved(self.bitmap()?, nstrips, chunk_size, bytes)
    }

    /// Drop the lock. The session cannot be reopened.
    pub fn release(&mut self) -> Result<()> {
        self.require_open("release")?;
        if let Some(guard) = self.guard.take() {
            guard
                .unlock()
                .map_err(|(_, errno)| FamError::Io(errno.into()))?;
        }
        self.bitmap = None;
        self.state = SessionState::Released;
        debug!("log session released");
        Ok(())
    }
}
