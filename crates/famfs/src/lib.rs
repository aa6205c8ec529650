#![forbid(unsafe_code)]
//! famfs public API facade.
//!
//! Re-exports the instance operations from `fam-core` together with the
//! types their signatures mention. The CLI and other downstream consumers
//! depend on this crate only.

pub use fam_core::*;
pub use fam_error::{FamError, Result};
pub use fam_extent::{FileMap, MappedRange, decode_fmap, encode_fmap};
pub use fam_journal::{LockMode, Role};
pub use fam_repair::{FsckReport, HealthTier};
pub use fam_types::{FAMFS_ALLOC_UNIT, FAMFS_LOG_LEN, FamUuid};
