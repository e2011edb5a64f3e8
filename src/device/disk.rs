//! # Disk Device
//!
//! File-backed page I/O. Reads prefer a read-only mmap window when one is
//! available; writes always go through positional `pwrite` so the mapping
//! stays clean and a crash can never leave half-written mmap pages behind.
//!
//! The mmap window covers the file as it existed at the last remap. After
//! the file grows, pages beyond the window are read with `pread` until
//! `remap` runs again; this keeps growth O(1) instead of remapping on
//! every extension.
//!
//! ## Failure model
//!
//! - mmap failure (or the `FileMmap` inducer point) permanently falls back
//!   to pread for this device
//! - allocation past `file_size_limit_bytes` fails with `LimitsReached`
//! - reads beyond EOF fail with `Io` and are never silently zero-filled

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::induce::{ErrorInducer, InducePoint};

use super::Device;

pub struct DiskDevice {
    file: File,
    page_size: usize,
    file_size_limit: u64,
    len: AtomicU64,
    mmap: RwLock<Option<Mmap>>,
    use_mmap: bool,
    read_only: bool,
    closed: AtomicBool,
}

impl DiskDevice {
    pub fn create(
        path: &Path,
        page_size: usize,
        file_size_limit: u64,
        use_mmap: bool,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create data file at {:?}", path))?;

        Ok(Self {
            file,
            page_size,
            file_size_limit,
            len: AtomicU64::new(0),
            mmap: RwLock::new(None),
            use_mmap,
            read_only: false,
            closed: AtomicBool::new(false),
        })
    }

    pub fn open(
        path: &Path,
        page_size: usize,
        file_size_limit: u64,
        use_mmap: bool,
        read_only: bool,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .wrap_err_with(|| format!("failed to open data file at {:?}", path))?;

        let len = file
            .metadata()
            .wrap_err("failed to stat data file")?
            .len();

        let device = Self {
            file,
            page_size,
            file_size_limit,
            len: AtomicU64::new(len),
            mmap: RwLock::new(None),
            use_mmap,
            read_only,
            closed: AtomicBool::new(false),
        };
        device.remap();
        Ok(device)
    }

    /// Refreshes the read window to cover the current file size. Failure
    /// is not fatal; reads fall back to pread.
    fn remap(&self) {
        if !self.use_mmap || self.len.load(Ordering::Acquire) == 0 {
            return;
        }
        if ErrorInducer::induce(InducePoint::FileMmap).is_err() {
            warn!("mmap disabled by error inducer, falling back to pread");
            *self.mmap.write() = None;
            return;
        }
        // SAFETY: the mapping is read-only and all writes go through
        // pwrite on the same file descriptor. Readers tolerate seeing
        // either the old or the new bytes of a page being flushed because
        // the page manager never reads a page that is concurrently
        // written by the flush worker.
        match unsafe { Mmap::map(&self.file) } {
            Ok(map) => *self.mmap.write() = Some(map),
            Err(err) => {
                warn!(?err, "mmap of data file failed, falling back to pread");
                *self.mmap.write() = None;
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        ensure!(
            !self.closed.load(Ordering::Acquire),
            ErrorKind::InvalidArg
        );
        Ok(())
    }
}

impl Device for DiskDevice {
    fn file_size(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.len.load(Ordering::Acquire))
    }

    fn truncate(&self, new_size: u64) -> Result<()> {
        self.check_open()?;
        ensure!(!self.read_only, ErrorKind::ReadOnly);

        // drop the window before shrinking under it
        *self.mmap.write() = None;
        self.file
            .set_len(new_size)
            .wrap_err(ErrorKind::Io)?;
        self.len.store(new_size, Ordering::Release);
        self.remap();
        Ok(())
    }

    fn alloc_pages(&self, count: usize) -> Result<u64> {
        self.check_open()?;
        ensure!(!self.read_only, ErrorKind::ReadOnly);

        let grow = (self.page_size * count) as u64;
        let address = self.len.load(Ordering::Acquire);
        ensure!(
            address + grow <= self.file_size_limit,
            ErrorKind::LimitsReached
        );

        self.file
            .set_len(address + grow)
            .wrap_err(ErrorKind::Io)?;
        self.len.store(address + grow, Ordering::Release);
        debug!(address, count, "extended data file");
        Ok(address)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_open()?;
        ensure!(
            offset + buf.len() as u64 <= self.len.load(Ordering::Acquire),
            ErrorKind::Io
        );

        {
            let guard = self.mmap.read();
            if let Some(map) = guard.as_ref() {
                let start = offset as usize;
                if start + buf.len() <= map.len() {
                    buf.copy_from_slice(&map[start..start + buf.len()]);
                    return Ok(());
                }
            }
        }

        self.file
            .read_exact_at(buf, offset)
            .wrap_err(ErrorKind::Io)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_open()?;
        ensure!(!self.read_only, ErrorKind::ReadOnly);

        let end = offset + data.len() as u64;
        ensure!(end <= self.file_size_limit, ErrorKind::LimitsReached);

        self.file
            .write_all_at(data, offset)
            .wrap_err(ErrorKind::Io)?;

        let mut len = self.len.load(Ordering::Acquire);
        while end > len {
            match self
                .len
                .compare_exchange(len, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => len = current,
            }
        }
        Ok(())
    }

    fn free_pages(&self, _address: u64, _count: usize) -> Result<()> {
        // freed disk pages stay in the file; the freelist reuses them
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Ok(());
        }
        self.file
            .sync_all()
            .wrap_err(ErrorKind::Io)
    }

    fn is_mapped(&self, offset: u64, len: usize) -> bool {
        let guard = self.mmap.read();
        guard
            .as_ref()
            .map(|map| offset as usize + len <= map.len())
            .unwrap_or(false)
    }

    fn close(&self) -> Result<()> {
        *self.mmap.write() = None;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PAGE_SIZE;

    fn test_device(dir: &tempfile::TempDir) -> DiskDevice {
        DiskDevice::create(
            &dir.path().join("dev.db"),
            DEFAULT_PAGE_SIZE,
            u64::MAX,
            true,
        )
        .unwrap()
    }

    #[test]
    fn read_past_eof_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let device = test_device(&dir);
        device.alloc_pages(1).unwrap();

        let mut buf = vec![0u8; DEFAULT_PAGE_SIZE];
        let result = device.read(DEFAULT_PAGE_SIZE as u64, &mut buf);
        assert!(result.is_err());
    }

    #[test]
    fn file_size_limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let device = DiskDevice::create(
            &dir.path().join("dev.db"),
            DEFAULT_PAGE_SIZE,
            2 * DEFAULT_PAGE_SIZE as u64,
            false,
        )
        .unwrap();

        device.alloc_pages(2).unwrap();
        let err = device.alloc_pages(1).unwrap_err();
        assert_eq!(
            crate::error::kind_of(&err),
            Some(ErrorKind::LimitsReached)
        );
    }

    #[test]
    fn truncate_shrinks_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let device = test_device(&dir);
        device.alloc_pages(4).unwrap();
        device
            .truncate(2 * DEFAULT_PAGE_SIZE as u64)
            .unwrap();
        assert_eq!(device.file_size().unwrap(), 2 * DEFAULT_PAGE_SIZE as u64);
    }

    #[test]
    fn reopen_sees_written_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.db");
        {
            let device =
                DiskDevice::create(&path, DEFAULT_PAGE_SIZE, u64::MAX, true).unwrap();
            let addr = device.alloc_pages(1).unwrap();
            device.write(addr, &vec![7u8; DEFAULT_PAGE_SIZE]).unwrap();
            device.flush().unwrap();
            device.close().unwrap();
        }

        let device =
            DiskDevice::open(&path, DEFAULT_PAGE_SIZE, u64::MAX, true, false).unwrap();
        let mut buf = vec![0u8; DEFAULT_PAGE_SIZE];
        device.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }
}
