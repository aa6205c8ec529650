//! Namespace operations on a mounted instance: trial allocations, file and
//! directory creation, copying data in, map lookup and log replay.

use crate::config::FamConfig;
use crate::instance::Instance;
use fam_alloc::{alloc_contiguous, build_bitmap};
use fam_block::ByteDevice;
use fam_error::{FamError, Result};
use fam_extent::FileMap;
use fam_journal::LockedLog;
use fam_ondisk::{
    DirCreation, EntryAttrs, Extent, FileCreation, LogEntry, LogEntryKind, LogView,
    parse_error_to_fam,
};
use fam_types::u64_to_usize;
use nix::unistd::{Gid, Uid, chown, getgid, getuid};
use serde::Serialize;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const COPY_CHUNK: u64 = 1 << 20;

/// Per-call knobs for `creat`, `cp` and `mkdir`. Unset fields fall back to
/// the configuration or the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateOptions {
    /// File size in bytes (`creat` only).
    pub size: u64,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub stripe_count: Option<u32>,
    pub chunk_size: Option<u64>,
}

impl CreateOptions {
    fn attrs(&self, default_mode: u32) -> EntryAttrs {
        EntryAttrs {
            mode: self.mode.unwrap_or(default_mode) & 0o7777,
            uid: self.uid.unwrap_or_else(|| getuid().as_raw()),
            gid: self.gid.unwrap_or_else(|| getgid().as_raw()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogplayOptions {
    /// Report what would be created without touching the mount tree.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct LogplayReport {
    pub entries: u64,
    pub files_created: u64,
    pub dirs_created: u64,
    pub skipped_existing: u64,
    pub access_entries: u64,
    pub bad_entries: u64,
    pub dry_run: bool,
}

// ── Trial allocation ────────────────────────────────────────────────────────

/// First-fit offset that an allocation of `size` bytes would receive in the
/// instance containing `path`. Nothing is logged.
pub fn alloc_by_path(config: &FamConfig, path: &Path, size: u64) -> Result<u64> {
    let instance = Instance::locate(path)?;
    let log = instance.read_log()?;
    let view = LogView::new(&log).map_err(|e| parse_error_to_fam(&e))?;
    let mut outcome = build_bitmap(
        &view,
        instance.superblock().device_capacity(),
        config.verbose,
    );
    alloc_contiguous(&mut outcome.bitmap, size)
}

// ── Creation ────────────────────────────────────────────────────────────────

/// Refuse a target that already exists in the mount tree or whose parent
/// directory is missing. The log is checked later, under the lock.
fn check_new_target(target: &Path) -> Result<()> {
    if target.symlink_metadata().is_ok() {
        return Err(FamError::Exists(target.display().to_string()));
    }
    match target.parent() {
        Some(parent) if parent.is_dir() => Ok(()),
        Some(parent) => Err(FamError::NotFound(parent.display().to_string())),
        None => Err(FamError::InvalidInput(target.display().to_string())),
    }
}

/// Open a session and refuse `relpath` if another writer logged it first.
fn locked_session_for(
    instance: &Instance,
    config: &FamConfig,
    relpath: &str,
) -> Result<LockedLog> {
    let session = instance.session(config)?;
    if session.exists(relpath)? {
        return Err(FamError::Exists(format!("{relpath} (logged, not yet replayed)")));
    }
    Ok(session)
}

fn allocate(
    session: &mut LockedLog,
    config: &FamConfig,
    opts: &CreateOptions,
) -> Result<Extent> {
    let stripes = opts.stripe_count.unwrap_or(config.stripe_count);
    if stripes > 1 {
        let chunk = opts.chunk_size.unwrap_or(config.chunk_size);
        Ok(Extent::Interleaved(
            session.alloc_interleaved(stripes, chunk, opts.size)?,
        ))
    } else {
        Ok(Extent::Simple(session.alloc(opts.size)?))
    }
}

fn create_in(
    instance: &Instance,
    config: &FamConfig,
    path: &Path,
    opts: &CreateOptions,
) -> Result<(FileMap, PathBuf)> {
    if opts.size == 0 {
        return Err(FamError::InvalidInput("file size must be nonzero".into()));
    }
    let relpath = instance.meta().relpath(path)?;
    let target = instance.meta().resolve(&relpath);
    check_new_target(&target)?;

    let mut session = locked_session_for(instance, config, &relpath)?;
    let extent = allocate(&mut session, config, opts)?;
    let file = FileCreation {
        relpath,
        size: opts.size,
        flags: 0,
        attrs: opts.attrs(config.file_mode),
        extents: vec![extent],
    };
    let map = FileMap::from_file_creation(&file).map_err(|e| parse_error_to_fam(&e))?;
    let attrs = file.attrs;
    let index = session.append(LogEntry::file(file))?;
    session.release()?;

    materialize_file(&target, opts.size, attrs, opts.uid.is_some() || opts.gid.is_some())?;
    info!(path = %target.display(), index, size = opts.size, "file created");
    Ok((map, target))
}

/// Allocate space for, log, and create a file of `opts.size` bytes at
/// `path`.
pub fn creat(config: &FamConfig, path: &Path, opts: &CreateOptions) -> Result<FileMap> {
    let instance = Instance::locate(path)?;
    create_in(&instance, config, path, opts).map(|(map, _)| map)
}

/// Create a file at `dst` sized to `src` and copy `src` into its extents.
///
/// A `dst` that is an existing directory receives a file named after `src`.
pub fn cp(config: &FamConfig, src: &Path, dst: &Path, opts: &CreateOptions) -> Result<FileMap> {
    let src_meta = fs::metadata(src)?;
    if !src_meta.is_file() {
        return Err(FamError::InvalidInput(format!(
            "{} is not a regular file",
            src.display()
        )));
    }
    let dst = if dst.is_dir() {
        let name = src
            .file_name()
            .ok_or_else(|| FamError::InvalidInput(src.display().to_string()))?;
        dst.join(name)
    } else {
        dst.to_path_buf()
    };

    let instance = Instance::locate(&dst)?;
    let device = instance.device()?;
    let opts = CreateOptions {
        size: src_meta.len(),
        mode: opts.mode.or(Some(src_meta.permissions().mode() & 0o777)),
        ..*opts
    };
    let (map, target) = create_in(&instance, config, &dst, &opts)?;

    let source = File::open(src)?;
    let placeholder = OpenOptions::new().write(true).open(&target)?;
    let mut buf = Vec::new();
    for (file_offset, range) in map.mappings(0, map.size()) {
        let mut done = 0_u64;
        while done < range.contiguous_len {
            let n = (range.contiguous_len - done).min(COPY_CHUNK);
            buf.resize(u64_to_usize(n, "copy length").map_err(|e| parse_error_to_fam(&e))?, 0);
            source.read_exact_at(&mut buf, file_offset + done)?;
            device.write_all_at(range.device_offset + done, &buf)?;
            placeholder.write_all_at(&buf, file_offset + done)?;
            done += n;
        }
        debug!(
            file_offset,
            device_offset = range.device_offset,
            len = range.contiguous_len,
            "copied range"
        );
    }
    device.sync()?;
    placeholder.sync_all()?;
    info!(src = %src.display(), dst = %target.display(), bytes = map.size(), "copied");
    Ok(map)
}

/// Log and create a directory at `path`. Its parent must already exist.
pub fn mkdir(config: &FamConfig, path: &Path, opts: &CreateOptions) -> Result<()> {
    let instance = Instance::locate(path)?;
    let relpath = instance.meta().relpath(path)?;
    let target = instance.meta().resolve(&relpath);
    check_new_target(&target)?;

    let attrs = opts.attrs(config.dir_mode);
    let mut session = locked_session_for(&instance, config, &relpath)?;
    let index = session.append(LogEntry::mkdir(DirCreation { relpath, attrs }))?;
    session.release()?;

    materialize_dir(&target, attrs, opts.uid.is_some() || opts.gid.is_some())?;
    info!(path = %target.display(), index, "directory created");
    Ok(())
}

// ── Lookup ──────────────────────────────────────────────────────────────────

/// The logged extent map of the file at `path`.
pub fn getmap(path: &Path) -> Result<FileMap> {
    let instance = Instance::locate(path)?;
    let relpath = instance.meta().relpath(path)?;
    instance.file_map(&relpath)
}

// ── Replay ──────────────────────────────────────────────────────────────────

/// Create every logged file and directory that is missing from the mount
/// tree. Existing paths are skipped, never merged.
pub fn logplay(config: &FamConfig, path: &Path, opts: &LogplayOptions) -> Result<LogplayReport> {
    let instance = Instance::locate(path)?;
    let log = instance.read_log()?;
    let view = LogView::new(&log).map_err(|e| parse_error_to_fam(&e))?;
    let mut report = LogplayReport {
        dry_run: opts.dry_run,
        ..LogplayReport::default()
    };

    for (index, decoded) in view.entries() {
        report.entries += 1;
        let entry = match decoded {
            Ok(entry) => entry,
            Err(err) => {
                warn!(index, error = %err, "skipping undecodable entry");
                report.bad_entries += 1;
                continue;
            }
        };
        let (relpath, attrs) = match &entry.kind {
            LogEntryKind::File(file) => (&file.relpath, file.attrs),
            LogEntryKind::Mkdir(dir) => (&dir.relpath, dir.attrs),
            LogEntryKind::Access => {
                report.access_entries += 1;
                continue;
            }
        };
        let target = instance.meta().resolve(relpath);
        if target.symlink_metadata().is_ok() {
            debug!(index, path = %relpath, "already present");
            report.skipped_existing += 1;
            continue;
        }
        if opts.dry_run {
            info!(index, path = %relpath, "would create");
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            match &entry.kind {
                LogEntryKind::File(file) => {
                    materialize_file(&target, file.size, attrs, config.replay_ownership)?;
                }
                _ => materialize_dir(&target, attrs, config.replay_ownership)?,
            }
            debug!(index, path = %relpath, "replayed");
        }
        match entry.kind {
            LogEntryKind::File(_) => report.files_created += 1,
            _ => report.dirs_created += 1,
        }
    }

    info!(
        entries = report.entries,
        files = report.files_created,
        dirs = report.dirs_created,
        skipped = report.skipped_existing,
        dry_run = opts.dry_run,
        "logplay complete"
    );
    Ok(report)
}

// ── Mount tree ──────────────────────────────────────────────────────────────

fn materialize_file(target: &Path, size: u64, attrs: EntryAttrs, set_owner: bool) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(attrs.mode)
        .open(target)?;
    file.set_len(size)?;
    if set_owner {
        apply_owner(target, attrs)?;
    }
    Ok(())
}

fn materialize_dir(target: &Path, attrs: EntryAttrs, set_owner: bool) -> Result<()> {
    DirBuilder::new().mode(attrs.mode).create(target)?;
    if set_owner {
        apply_owner(target, attrs)?;
    }
    Ok(())
}

fn apply_owner(target: &Path, attrs: EntryAttrs) -> Result<()> {
    chown(
        target,
        Some(Uid::from_raw(attrs.uid)),
        Some(Gid::from_raw(attrs.gid)),
    )
    .map_err(|errno| FamError::Io(errno.into()))
}
