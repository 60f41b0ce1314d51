#![forbid(unsafe_code)]
//! Device access layer.
//!
//! Provides the `ByteDevice` trait with file and memory backends, and the
//! IO buffer cache ([`dio`]) that hands out referenced 64 KiB physical
//! buffers to the chain engine.

pub mod dio;

pub use dio::{DioCache, DioConfig, DioRef, DioStats};

use h2_error::{H2Error, Result};
use parking_lot::RwLock;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed device for fixed-offset reads (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

fn check_range(offset: u64, len: usize, dev_len: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| H2Error::Format("read length overflows u64".to_owned()))?,
        )
        .ok_or_else(|| H2Error::Format("read range overflows u64".to_owned()))?;
    if end > dev_len {
        return Err(H2Error::Format(format!(
            "read out of bounds: offset={offset} len={len} device_len={dev_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and has no shared
/// seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// The backing bytes can be patched after construction, which lets tests
/// damage media underneath a live engine.
#[derive(Debug, Default)]
pub struct MemByteDevice {
    bytes: RwLock<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
        }
    }

    /// Overwrite `data.len()` bytes at `offset`.
    pub fn poke(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.bytes.write();
        let dev_len = u64::try_from(guard.len()).unwrap_or(u64::MAX);
        check_range(offset, data.len(), dev_len)?;
        let start = usize::try_from(offset)
            .map_err(|_| H2Error::Format("offset overflows usize".to_owned()))?;
        guard[start..start + data.len()].copy_from_slice(data);
        drop(guard);
        Ok(())
    }

    /// Flip every bit of the byte at `offset`.
    pub fn corrupt_byte(&self, offset: u64) -> Result<()> {
        let mut byte = [0_u8; 1];
        self.read_exact_at(offset, &mut byte)?;
        self.poke(offset, &[!byte[0]])
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.read().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let guard = self.bytes.read();
        let dev_len = u64::try_from(guard.len()).unwrap_or(u64::MAX);
        check_range(offset, buf.len(), dev_len)?;
        let start = usize::try_from(offset)
            .map_err(|_| H2Error::Format("offset overflows usize".to_owned()))?;
        buf.copy_from_slice(&guard[start..start + buf.len()]);
        drop(guard);
        Ok(())
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_device_reads_and_bounds_checks() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tmp");
        tmp.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]).expect("write");
        tmp.flush().expect("flush");
        let dev = FileByteDevice::open(tmp.path()).expect("open");
        assert_eq!(dev.len_bytes(), 8);
        let mut buf = [0_u8; 4];
        dev.read_exact_at(2, &mut buf).expect("read");
        assert_eq!(buf, [3, 4, 5, 6]);
        assert!(dev.read_exact_at(6, &mut buf).is_err());
        assert!(dev.read_exact_at(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn mem_device_poke_and_corrupt() {
        let dev = MemByteDevice::new(vec![0_u8; 16]);
        dev.poke(4, &[9, 9]).expect("poke");
        dev.corrupt_byte(0).expect("corrupt");
        let mut buf = [0_u8; 6];
        dev.read_exact_at(0, &mut buf).expect("read");
        assert_eq!(buf, [0xFF, 0, 0, 0, 9, 9]);
        assert!(dev.poke(15, &[1, 2]).is_err());
    }
}
