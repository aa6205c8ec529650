#![forbid(unsafe_code)]
//! Instance-level famfs operations.
//!
//! Everything a tool does to a famfs instance goes through here: formatting
//! a device (`mkfs`), exposing it under a mount point (`mkmeta`), creating
//! files and directories through the locked log (`creat`, `cp`, `mkdir`),
//! looking up a file's extent map (`getmap`), replaying the log into the
//! mount tree (`logplay`) and checking consistency (`fsck`).
//!
//! # Mount layout
//!
//! A mount point holds `.meta/.superblock` and `.meta/.log`, copies of the
//! device's superblock and log regions. Paths given to the namespace
//! operations are resolved to their instance by walking up to the nearest
//! directory that holds both files. When the backing device named in the
//! superblock is reachable it is the source of truth, and log appends are
//! written through to `.meta/.log`.
//!
//! # Configuration
//!
//! There is no global state: a [`FamConfig`] is passed by reference to every
//! entry point, and per-call knobs live in option structs
//! ([`MkfsOptions`], [`CreateOptions`], [`LogplayOptions`], [`FsckOptions`]).

pub mod check;
pub mod config;
pub mod instance;
pub mod meta;
pub mod mkfs;
pub mod ops;

pub use check::{FsckOptions, FsckTarget, fsck, fsck_target};
pub use config::{DEFAULT_SYSTEM_UUID_PATH, FamConfig};
pub use instance::Instance;
pub use meta::{MetaPaths, find_meta};
pub use mkfs::{MkfsOptions, MkfsOutcome, mkfs, mkmeta};
pub use ops::{
    CreateOptions, LogplayOptions, LogplayReport, alloc_by_path, cp, creat, getmap, logplay,
    mkdir,
};
