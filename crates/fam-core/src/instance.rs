//! An opened, mounted instance: its meta files, its superblock and (when
//! reachable) the device that backs it.

use crate::config::FamConfig;
use crate::meta::{MetaPaths, find_meta};
use fam_block::{ByteDevice, FileByteDevice, Mirrored, Region, read_superblock_region};
use fam_error::{FamError, Result};
use fam_extent::FileMap;
use fam_journal::{LockedLog, LogTarget, Role};
use fam_ondisk::{LogEntryKind, LogView, Superblock, parse_error_to_fam, validate_superblock};
use fam_types::FAMFS_LOG_OFFSET;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Instance {
    meta: MetaPaths,
    superblock: Superblock,
    device: Option<Arc<FileByteDevice>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("mount_root", &self.meta.mount_root)
            .field("fs_uuid", &self.superblock.fs_uuid)
            .field("device", &self.superblock.primary_device().map(|d| &d.name))
            .field("device_open", &self.device.is_some())
            .finish()
    }
}

impl Instance {
    /// Find the instance containing `path` and validate its superblock.
    pub fn locate(path: &Path) -> Result<Self> {
        Self::open(find_meta(path)?)
    }

    pub fn open(meta: MetaPaths) -> Result<Self> {
        let sb_file = FileByteDevice::open_read_only(&meta.superblock)?;
        let superblock = validate_superblock(&read_superblock_region(&sb_file)?)?;
        let device = superblock.primary_device().and_then(|dev| {
            match FileByteDevice::open(&dev.name) {
                Ok(file) => Some(Arc::new(file)),
                Err(err) => {
                    warn!(device = %dev.name, error = %err, "backing device unavailable, using meta files only");
                    None
                }
            }
        });
        if let Some(dev) = &device {
            if superblock.device_capacity() > dev.len_bytes() {
                return Err(FamError::Format(format!(
                    "superblock records {} bytes but the device has {}",
                    superblock.device_capacity(),
                    dev.len_bytes()
                )));
            }
        }
        debug!(mount = %meta.mount_root.display(), fs_uuid = %superblock.fs_uuid, "instance opened");
        Ok(Self {
            meta,
            superblock,
            device,
        })
    }

    #[must_use]
    pub fn meta(&self) -> &MetaPaths {
        &self.meta
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// The backing device, if this host can open it.
    pub fn device(&self) -> Result<&Arc<FileByteDevice>> {
        self.device.as_ref().ok_or_else(|| {
            FamError::NotFound(format!(
                "backing device {}",
                self.superblock
                    .primary_device()
                    .map_or("<none>", |d| d.name.as_str())
            ))
        })
    }

    fn device_log(&self, dev: &Arc<FileByteDevice>) -> Result<Region<Arc<FileByteDevice>>> {
        Region::new(Arc::clone(dev), FAMFS_LOG_OFFSET, self.superblock.log_len)
    }

    /// Session target. With the device reachable the device log is read
    /// and locked, and writes also land in `.meta/.log`; otherwise the meta
    /// files stand alone.
    pub fn log_target(&self) -> Result<LogTarget> {
        let Some(dev) = &self.device else {
            return LogTarget::from_meta_files(&self.meta.superblock, &self.meta.log);
        };
        let meta_log = FileByteDevice::open_writable(&self.meta.log)?;
        let log = Mirrored::new(self.device_log(dev)?, meta_log)?;
        let lock_path = self
            .superblock
            .primary_device()
            .map(|d| d.name.as_str())
            .ok_or_else(|| FamError::Format("superblock lists no device".into()))?;
        let lock_file = File::open(lock_path)?;
        Ok(LogTarget::new(
            Arc::clone(dev) as Arc<dyn ByteDevice>,
            Arc::new(log),
            Some(lock_file),
        ))
    }

    /// Open a locked-log session with the role this host resolves to.
    ///
    /// Clients are refused before any meta file is opened for writing.
    pub fn session(&self, config: &FamConfig) -> Result<LockedLog> {
        let role = config.resolve_role(&self.superblock);
        if role == Role::Client {
            return Err(FamError::NotLogOwner);
        }
        let mut session = LockedLog::new(self.log_target()?, config.session_options());
        session.init(role)?;
        Ok(session)
    }

    #[must_use]
    pub fn role(&self, config: &FamConfig) -> Role {
        config.resolve_role(&self.superblock)
    }

    /// Unlocked snapshot of the whole log.
    pub fn read_log(&self) -> Result<Vec<u8>> {
        match &self.device {
            Some(dev) => self.device_log(dev)?.read_vec(0, self.superblock.log_len),
            None => {
                FileByteDevice::open_read_only(&self.meta.log)?.read_vec(0, self.superblock.log_len)
            }
        }
    }

    /// Map of the file logged at `relpath`. The first `FILE` entry for a
    /// path wins, as in replay.
    pub fn file_map(&self, relpath: &str) -> Result<FileMap> {
        let bytes = self.read_log()?;
        let view = LogView::new(&bytes).map_err(|e| parse_error_to_fam(&e))?;
        for (index, decoded) in view.entries() {
            let Ok(entry) = decoded else {
                debug!(index, "skipping undecodable entry");
                continue;
            };
            match &entry.kind {
                LogEntryKind::File(file) if file.relpath == relpath => {
                    return FileMap::from_file_creation(file).map_err(|e| parse_error_to_fam(&e));
                }
                LogEntryKind::Mkdir(dir) if dir.relpath == relpath => {
                    return Err(FamError::InvalidInput(format!("{relpath} is a directory")));
                }
                _ => {}
            }
        }
        Err(FamError::NotFound(relpath.to_owned()))
    }
}
