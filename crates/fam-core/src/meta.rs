//! Locating an instance's meta directory from a path inside its mount.

use fam_error::{FamError, Result};
use std::path::{Component, Path, PathBuf};
use tracing::trace;

pub const META_DIR: &str = ".meta";
pub const SUPERBLOCK_FILE: &str = ".superblock";
pub const LOG_FILE: &str = ".log";

/// The meta files of one mounted instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPaths {
    pub mount_root: PathBuf,
    pub superblock: PathBuf,
    pub log: PathBuf,
}

impl MetaPaths {
    #[must_use]
    pub fn for_mount(mount_root: &Path) -> Self {
        let meta = mount_root.join(META_DIR);
        Self {
            mount_root: mount_root.to_path_buf(),
            superblock: meta.join(SUPERBLOCK_FILE),
            log: meta.join(LOG_FILE),
        }
    }

    #[must_use]
    pub fn meta_dir(&self) -> PathBuf {
        self.mount_root.join(META_DIR)
    }

    fn present(&self) -> bool {
        self.superblock.is_file() && self.log.is_file()
    }

    /// `path` relative to the mount root, as recorded in log entries.
    /// Relative paths are taken from the current directory.
    pub fn relpath(&self, path: &Path) -> Result<String> {
        let path = std::path::absolute(path)?;
        let path = path.as_path();
        let rel = path.strip_prefix(&self.mount_root).map_err(|_| {
            FamError::InvalidInput(format!(
                "{} is not under {}",
                path.display(),
                self.mount_root.display()
            ))
        })?;
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                    FamError::InvalidInput(format!("{} is not valid UTF-8", path.display()))
                })?),
                Component::CurDir => {}
                _ => {
                    return Err(FamError::InvalidInput(format!(
                        "{} must not contain '..'",
                        path.display()
                    )));
                }
            }
        }
        if parts.is_empty() {
            return Err(FamError::InvalidInput(format!(
                "{} is the mount root",
                path.display()
            )));
        }
        if parts.first() == Some(&META_DIR) {
            return Err(FamError::InvalidInput(format!(
                "{} is inside the meta directory",
                path.display()
            )));
        }
        Ok(parts.join("/"))
    }

    /// Path in the mount tree for a logged relative path.
    #[must_use]
    pub fn resolve(&self, relpath: &str) -> PathBuf {
        self.mount_root.join(relpath)
    }
}

/// Walk up from `path` (which need not exist) to the root, returning the
/// first ancestor that holds both `.meta/.superblock` and `.meta/.log`.
///
/// `""`, `"/"` and relative strings without a `/` are rejected. Other
/// relative paths start from the current directory, which is searched too.
pub fn find_meta(path: &Path) -> Result<MetaPaths> {
    let text = path.as_os_str();
    if text.is_empty() || path == Path::new("/") {
        return Err(FamError::InvalidInput(format!(
            "cannot search for meta files from {:?}",
            path.display().to_string()
        )));
    }
    if path.is_relative() && !text.as_encoded_bytes().contains(&b'/') {
        return Err(FamError::InvalidInput(format!(
            "relative path {} has no directory component",
            path.display()
        )));
    }

    let start = std::path::absolute(path)?;
    let mut current = Some(start.as_path());
    while let Some(dir) = current {
        let candidate = MetaPaths::for_mount(dir);
        trace!(dir = %dir.display(), "looking for meta files");
        if candidate.present() {
            return Ok(candidate);
        }
        current = dir.parent();
    }
    Err(FamError::NotFound(format!(
        "no famfs meta directory above {}",
        path.display()
    )))
}
