//! Instance configuration and host role resolution.

use fam_error::{FamError, Result};
use fam_journal::{LockMode, Role, SessionOptions};
use fam_ondisk::Superblock;
use fam_types::{FAMFS_ALLOC_UNIT, FamUuid};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_SYSTEM_UUID_PATH: &str = "/opt/famfs/system_uuid";

/// Context passed by reference to every instance operation.
///
/// Every field has a default, so a JSON file only needs to name the fields
/// it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FamConfig {
    pub verbose: bool,
    pub lock_mode: LockMode,
    /// Force the host role instead of comparing system UUIDs.
    pub role: Option<Role>,
    /// This host's system UUID. Takes precedence over `system_uuid_path`.
    pub system_uuid: Option<String>,
    pub system_uuid_path: PathBuf,
    pub sync_writes: bool,
    /// Apply logged uid/gid to objects created by logplay.
    pub replay_ownership: bool,
    /// Strips per new file; 0 or 1 allocates a simple extent.
    pub stripe_count: u32,
    pub chunk_size: u64,
    pub file_mode: u32,
    pub dir_mode: u32,
}

impl Default for FamConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            lock_mode: LockMode::Blocking,
            role: None,
            system_uuid: None,
            system_uuid_path: PathBuf::from(DEFAULT_SYSTEM_UUID_PATH),
            sync_writes: true,
            replay_ownership: false,
            stripe_count: 0,
            chunk_size: FAMFS_ALLOC_UNIT,
            file_mode: 0o644,
            dir_mode: 0o755,
        }
    }
}

impl FamConfig {
    /// Load a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| FamError::InvalidInput(format!("{}: {e}", path.display())))
    }

    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            lock_mode: self.lock_mode,
            sync_writes: self.sync_writes,
            verbose: self.verbose,
        }
    }

    /// This host's system UUID, from the override or the UUID file.
    ///
    /// `Ok(None)` when neither is present.
    pub fn host_system_uuid(&self) -> Result<Option<FamUuid>> {
        if let Some(text) = &self.system_uuid {
            return parse_uuid(text).map(Some);
        }
        match std::fs::read_to_string(&self.system_uuid_path) {
            Ok(text) => parse_uuid(&text).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// The host's system UUID, generating and persisting one if none exists.
    pub fn ensure_host_system_uuid(&self) -> Result<FamUuid> {
        if let Some(uuid) = self.host_system_uuid()? {
            return Ok(uuid);
        }
        let uuid = FamUuid::generate(self.system_uuid_path.as_os_str().as_encoded_bytes());
        if let Some(dir) = self.system_uuid_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.system_uuid_path, format!("{uuid}\n"))?;
        debug!(path = %self.system_uuid_path.display(), %uuid, "created system uuid");
        Ok(uuid)
    }

    /// Owner iff this host's system UUID equals the superblock's. A host
    /// without a readable UUID is a client.
    #[must_use]
    pub fn resolve_role(&self, sb: &Superblock) -> Role {
        if let Some(role) = self.role {
            return role;
        }
        match self.host_system_uuid() {
            Ok(Some(uuid)) if uuid == sb.system_uuid => Role::Owner,
            Ok(_) => Role::Client,
            Err(err) => {
                warn!(error = %err, "system uuid unreadable, assuming client role");
                Role::Client
            }
        }
    }
}

fn parse_uuid(text: &str) -> Result<FamUuid> {
    text.trim()
        .parse()
        .map_err(|e| FamError::InvalidInput(format!("system uuid {:?}: {e}", text.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fam_ondisk::DeviceInfo;
    use fam_types::{FAMFS_LOG_LEN, GIB};

    fn sb(system: FamUuid) -> Superblock {
        Superblock::new(
            FamUuid([1; 16]),
            system,
            FAMFS_LOG_LEN,
            DeviceInfo {
                name: "/dev/dax0.0".into(),
                size: GIB,
            },
        )
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: FamConfig =
            serde_json::from_str(r#"{"stripe_count": 4, "lock_mode": "non_blocking"}"#)
                .expect("parse");
        assert_eq!(cfg.stripe_count, 4);
        assert_eq!(cfg.lock_mode, LockMode::NonBlocking);
        assert_eq!(cfg.chunk_size, FAMFS_ALLOC_UNIT);
        assert!(cfg.sync_writes);
    }

    #[test]
    fn role_follows_system_uuid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let host = FamUuid([9; 16]);
        let cfg = FamConfig {
            system_uuid_path: dir.path().join("system_uuid"),
            ..FamConfig::default()
        };
        // no uuid file: fail closed
        assert_eq!(cfg.resolve_role(&sb(host)), Role::Client);

        std::fs::write(&cfg.system_uuid_path, format!("{host}\n")).expect("write");
        assert_eq!(cfg.resolve_role(&sb(host)), Role::Owner);
        assert_eq!(cfg.resolve_role(&sb(FamUuid([8; 16]))), Role::Client);

        let forced = FamConfig {
            role: Some(Role::Owner),
            ..cfg.clone()
        };
        assert_eq!(forced.resolve_role(&sb(FamUuid([8; 16]))), Role::Owner);

        std::fs::write(&cfg.system_uuid_path, "garbage").expect("write");
        assert_eq!(cfg.resolve_role(&sb(host)), Role::Client);
    }

    #[test]
    fn ensure_creates_uuid_file_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = FamConfig {
            system_uuid_path: dir.path().join("famfs").join("system_uuid"),
            ..FamConfig::default()
        };
        let first = cfg.ensure_host_system_uuid().expect("create");
        let second = cfg.ensure_host_system_uuid().expect("reread");
        assert_eq!(first, second);
        assert!(!first.is_nil());
    }
}
