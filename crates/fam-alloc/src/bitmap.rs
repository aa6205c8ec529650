//! Bit-level primitives over an allocation bitmap.
//!
//! Bit `i` lives in byte `i / 8` under mask `1 << (i % 8)`. Indices past
//! the end of the slice read as clear and are ignored by writers. No
//! internal locking: the owner of the bitmap serializes access.

// ── Free functions ──────────────────────────────────────────────────────────

#[inline]
fn locate(idx: u64) -> Option<(usize, u8)> {
    let byte = usize::try_from(idx / 8).ok()?;
    #[expect(clippy::cast_possible_truncation)]
    let mask = 1_u8 << (idx % 8) as u8;
    Some((byte, mask))
}

/// Bytes needed for a bitmap of `n_units` bits.
#[must_use]
pub fn size_for(n_units: u64) -> u64 {
    n_units.div_ceil(8)
}

#[must_use]
pub fn bitmap_test(bitmap: &[u8], idx: u64) -> bool {
    match locate(idx) {
        Some((byte, mask)) => bitmap.get(byte).is_some_and(|b| b & mask != 0),
        None => false,
    }
}

pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    if let Some((byte, mask)) = locate(idx) {
        if let Some(b) = bitmap.get_mut(byte) {
            *b |= mask;
        }
    }
}

pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    if let Some((byte, mask)) = locate(idx) {
        if let Some(b) = bitmap.get_mut(byte) {
            *b &= !mask;
        }
    }
}

/// Set bit `idx`; returns true iff it was previously clear.
///
/// An index past the slice is never a new allocation and returns false.
pub fn bitmap_test_and_set(bitmap: &mut [u8], idx: u64) -> bool {
    let Some((byte, mask)) = locate(idx) else {
        return false;
    };
    let Some(b) = bitmap.get_mut(byte) else {
        return false;
    };
    let was_clear = *b & mask == 0;
    *b |= mask;
    was_clear
}

/// Clear bit `idx`; returns true iff it was previously set.
pub fn bitmap_test_and_clear(bitmap: &mut [u8], idx: u64) -> bool {
    let Some((byte, mask)) = locate(idx) else {
        return false;
    };
    let Some(b) = bitmap.get_mut(byte) else {
        return false;
    };
    let was_set = *b & mask != 0;
    *b &= !mask;
    was_set
}

// ── Owned bitmap ────────────────────────────────────────────────────────────

/// Allocation bitmap with an explicit bit count.
///
/// Derived from the log, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocBitmap {
    bytes: Vec<u8>,
    nbits: u64,
}

impl AllocBitmap {
    /// An all-clear bitmap of `nbits` bits.
    #[must_use]
    pub fn new(nbits: u64) -> Self {
        // One bit per 2 MiB unit: even exabyte devices stay far below usize.
        #[expect(clippy::cast_possible_truncation)]
        let len = size_for(nbits) as usize;
        Self {
            bytes: vec![0_u8; len],
            nbits,
        }
    }

    #[must_use]
    pub fn nbits(&self) -> u64 {
        self.nbits
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn test(&self, idx: u64) -> bool {
        idx < self.nbits && bitmap_test(&self.bytes, idx)
    }

    pub fn set(&mut self, idx: u64) {
        if idx < self.nbits {
            bitmap_set(&mut self.bytes, idx);
        }
    }

    pub fn test_and_set(&mut self, idx: u64) -> bool {
        idx < self.nbits && bitmap_test_and_set(&mut self.bytes, idx)
    }

    pub fn test_and_clear(&mut self, idx: u64) -> bool {
        idx < self.nbits && bitmap_test_and_clear(&mut self.bytes, idx)
    }

    /// Set bits `[start, end)`, clipped to the bitmap.
    pub fn set_range(&mut self, start: u64, end: u64) {
        for idx in start..end.min(self.nbits) {
            bitmap_set(&mut self.bytes, idx);
        }
    }

    /// Clear bits `[start, end)`, clipped to the bitmap.
    pub fn clear_range(&mut self, start: u64, end: u64) {
        for idx in start..end.min(self.nbits) {
            bitmap_clear(&mut self.bytes, idx);
        }
    }

    #[must_use]
    pub fn count_set(&self) -> u64 {
        let full = usize::try_from(self.nbits / 8).unwrap_or(usize::MAX);
        let mut set: u64 = self
            .bytes
            .iter()
            .take(full)
            .map(|b| u64::from(b.count_ones()))
            .sum();
        for idx in (self.nbits / 8) * 8..self.nbits {
            if bitmap_test(&self.bytes, idx) {
                set += 1;
            }
        }
        set
    }

    #[must_use]
    pub fn count_clear(&self) -> u64 {
        self.nbits - self.count_set()
    }

    /// First run of `n` clear bits at or after `start`, first-fit.
    #[must_use]
    pub fn find_clear_run(&self, n: u64, start: u64) -> Option<u64> {
        if n == 0 {
            return None;
        }
        let mut run_start = start;
        let mut run_len = 0_u64;
        let mut idx = start;
        while idx < self.nbits {
            if bitmap_test(&self.bytes, idx) {
                run_start = idx + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == n {
                    return Some(run_start);
                }
            }
            idx += 1;
        }
        None
    }
}
