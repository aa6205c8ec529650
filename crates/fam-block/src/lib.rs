#![forbid(unsafe_code)]
//! Byte-addressed device I/O for famfs.
//!
//! Provides the `ByteDevice` trait with pread/pwrite semantics, a
//! file-backed implementation for DAX devices and image files, an in-memory
//! device for tests, `Region`, a bounds-checked window onto part of a
//! device (the superblock, the log, or a meta file), and `Mirrored`, which
//! writes through to a second copy.

use fam_error::{FamError, Result};
use fam_types::{FAMFS_LOG_OFFSET, FAMFS_SUPERBLOCK_STRUCT_SIZE, u64_to_usize};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Read `len` bytes at `offset` into a fresh buffer.
    fn read_vec(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; u64_to_usize(len, "read length").map_err(|e| {
            FamError::InvalidInput(e.to_string())
        })?];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Reject ranges that overflow or run past `len`.
fn check_range(op: &str, offset: u64, buf_len: usize, len: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(buf_len)
                .map_err(|_| FamError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| FamError::Format(format!("{op} range overflows u64")))?;
    if end > len {
        return Err(FamError::Format(format!(
            "{op} out of bounds: offset={offset} len={buf_len} device_len={len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Works for regular image files, block devices and DAX character devices.
/// The file handle is shared so callers can take advisory locks on it.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only if write access is denied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    /// Open read-write or fail.
    pub fn open_writable(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Self::from_file(file, true)
    }

    fn from_file(mut file: File, writable: bool) -> Result<Self> {
        let meta = file.metadata()?;
        // Device nodes report zero length in their metadata.
        let len = if meta.is_file() {
            meta.len()
        } else {
            file.seek(SeekFrom::End(0))?
        };
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range("read", offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FamError::PermissionDenied);
        }
        check_range("write", offset, buf.len(), self.len)?;
        trace!(offset, len = buf.len(), "pwrite");
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device. Used by tests and by dry-run tooling.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range("read", offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0))?;
        let start = u64_to_usize(offset, "offset").map_err(|e| FamError::Format(e.to_string()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range("write", offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0))?;
        let start = u64_to_usize(offset, "offset").map_err(|e| FamError::Format(e.to_string()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A bounds-checked window `[base, base + len)` onto another device.
///
/// Offsets passed to a `Region` are relative to `base`.
#[derive(Debug, Clone)]
pub struct Region<D> {
    inner: D,
    base: u64,
    len: u64,
}

impl<D: ByteDevice> Region<D> {
    pub fn new(inner: D, base: u64, len: u64) -> Result<Self> {
        let end = base
            .checked_add(len)
            .ok_or_else(|| FamError::InvalidInput("region overflows u64".into()))?;
        if end > inner.len_bytes() {
            return Err(FamError::Format(format!(
                "region [{base:#x}, {end:#x}) exceeds device length {:#x}",
                inner.len_bytes()
            )));
        }
        Ok(Self { inner, base, len })
    }

    /// The whole device as a region.
    pub fn whole(inner: D) -> Self {
        let len = inner.len_bytes();
        Self {
            inner,
            base: 0,
            len,
        }
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }
}

impl<D: ByteDevice> ByteDevice for Region<D> {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range("read", offset, buf.len(), self.len)?;
        self.inner.read_exact_at(self.base + offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range("write", offset, buf.len(), self.len)?;
        self.inner.write_all_at(self.base + offset, buf)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// Two devices holding the same bytes: reads come from `primary`, writes go
/// to both (primary first).
///
/// Keeps a mount's `.meta/.log` copy in step with the log region on the
/// device it describes.
#[derive(Debug, Clone)]
pub struct Mirrored<P, S> {
    primary: P,
    secondary: S,
}

impl<P: ByteDevice, S: ByteDevice> Mirrored<P, S> {
    /// Both sides must be the same length.
    pub fn new(primary: P, secondary: S) -> Result<Self> {
        if primary.len_bytes() != secondary.len_bytes() {
            return Err(FamError::Format(format!(
                "mirror length mismatch: {} vs {}",
                primary.len_bytes(),
                secondary.len_bytes()
            )));
        }
        Ok(Self { primary, secondary })
    }
}

impl<P: ByteDevice, S: ByteDevice> ByteDevice for Mirrored<P, S> {
    fn len_bytes(&self) -> u64 {
        self.primary.len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.primary.read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.primary.write_all_at(offset, buf)?;
        self.secondary.write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        self.primary.sync()?;
        self.secondary.sync()
    }
}

/// Read the encoded superblock structure from the start of `dev`.
pub fn read_superblock_region(dev: &dyn ByteDevice) -> Result<Vec<u8>> {
    dev.read_vec(0, FAMFS_SUPERBLOCK_STRUCT_SIZE as u64)
}

/// Read the whole log region of a raw device given its recorded length.
pub fn read_log_region(dev: &dyn ByteDevice, log_len: u64) -> Result<Vec<u8>> {
    dev.read_vec(FAMFS_LOG_OFFSET, log_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mem_device_round_trips_and_bounds() {
        let dev = MemByteDevice::new(4096);
        dev.write_all_at(100, &[7_u8; 10]).expect("write");
        let mut buf = [0_u8; 10];
        dev.read_exact_at(100, &mut buf).expect("read");
        assert_eq!(buf, [7_u8; 10]);
        assert!(dev.read_exact_at(4090, &mut buf).is_err());
        assert!(dev.write_all_at(u64::MAX, &[1]).is_err());
    }

    #[test]
    fn region_translates_and_clips() {
        let dev = Arc::new(MemByteDevice::new(8192));
        let region = Region::new(Arc::clone(&dev), 4096, 1024).expect("region");
        region.write_all_at(0, b"famfs").expect("write");
        assert_eq!(&dev.snapshot()[4096..4101], b"famfs");
        assert_eq!(region.read_vec(0, 5).expect("read"), b"famfs");
        assert!(region.read_vec(1020, 8).is_err());
        assert!(Region::new(Arc::clone(&dev), 8000, 1024).is_err());
    }

    #[test]
    fn mirror_writes_both_sides() {
        let a = Arc::new(MemByteDevice::new(1024));
        let b = Arc::new(MemByteDevice::new(1024));
        let mirror = Mirrored::new(Arc::clone(&a), Arc::clone(&b)).expect("mirror");
        mirror.write_all_at(10, b"log").expect("write");
        assert_eq!(&a.snapshot()[10..13], b"log");
        assert_eq!(&b.snapshot()[10..13], b"log");
        b.write_all_at(0, b"x").expect("diverge");
        assert_eq!(mirror.read_vec(0, 1).expect("read"), vec![0]);
        assert!(Mirrored::new(MemByteDevice::new(8), MemByteDevice::new(16)).is_err());
    }

    #[test]
    fn file_device_reads_and_writes() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tmp");
        tmp.write_all(&[0_u8; 8192]).expect("fill");
        tmp.flush().expect("flush");

        let dev = FileByteDevice::open(tmp.path()).expect("open");
        assert!(dev.is_writable());
        assert_eq!(dev.len_bytes(), 8192);
        dev.write_all_at(2048, &[9_u8; 16]).expect("write");
        dev.sync().expect("sync");
        assert_eq!(dev.read_vec(2048, 16).expect("read"), vec![9_u8; 16]);
        assert!(dev.write_all_at(8190, &[1_u8; 4]).is_err());
    }

    #[test]
    fn read_only_device_refuses_writes() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tmp");
        tmp.write_all(&[0_u8; 512]).expect("fill");
        let dev = FileByteDevice::open_read_only(tmp.path()).expect("open");
        assert!(matches!(
            dev.write_all_at(0, &[1]),
            Err(FamError::PermissionDenied)
        ));
    }
}
