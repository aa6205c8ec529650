#![forbid(unsafe_code)]
//! Consistency checking for famfs.
//!
//! famfs never repairs in place: the log is the only source of truth and
//! every derived structure can be rebuilt from it. This crate re-derives
//! that state offline and grades what it finds into a health tier.

pub mod fsck;

pub use fsck::{
    Finding, FindingKind, FsckReport, HealthTier, LogUsage, Severity, SpaceUsage, scan,
};
