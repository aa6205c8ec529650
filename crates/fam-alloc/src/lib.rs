#![forbid(unsafe_code)]
//! Allocation-unit bookkeeping for famfs.
//!
//! Free space is never stored. It is derived by replaying the metadata log
//! into a bitmap with one bit per 2 MiB allocation unit, and allocations
//! are first-fit runs over that bitmap.
//!
//! ## Design
//!
//! 1. **Bitmap** ([`bitmap`]) — raw bit manipulation plus an owned
//!    [`AllocBitmap`].
//! 2. **Replay** ([`replay`]) — rebuilds the bitmap from the log and counts
//!    double allocations.
//! 3. **Allocator** ([`allocator`]) — contiguous and interleaved allocation.

pub mod allocator;
pub mod bitmap;
pub mod replay;

pub use allocator::{alloc_contiguous, alloc_interleaved, alloc_simple};
pub use bitmap::{
    AllocBitmap, bitmap_clear, bitmap_set, bitmap_test, bitmap_test_and_clear,
    bitmap_test_and_set, size_for,
};
pub use replay::{BadEntry, Collision, ReplayOutcome, bitmap_nbits, build_bitmap};
