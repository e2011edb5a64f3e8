//! # Device Abstraction
//!
//! A [`Device`] performs fixed-size page I/O for the page manager. Two
//! implementations exist:
//!
//! - [`DiskDevice`]: positional reads and writes against a file, with an
//!   optional read-only mmap window. Writes always go through `pwrite`;
//!   the mapping is never dirtied.
//! - [`MemoryDevice`]: an allocation arena for in-memory environments.
//!   Page addresses are synthetic and file-oriented operations fail with
//!   `NotImplemented`.
//!
//! Addresses are byte offsets into the backing file, always multiples of
//! the page size. The device enforces `file_size_limit_bytes`: an
//! allocation that would push the file past the limit fails with
//! `LimitsReached`.
//!
//! All methods take `&self`; both devices are internally synchronized and
//! shared as `Arc<dyn Device>` between the page manager and its flush
//! worker.

mod disk;
mod inmem;

pub use disk::DiskDevice;
pub use inmem::MemoryDevice;

use eyre::Result;

pub trait Device: Send + Sync {
    /// True for the in-memory arena.
    fn is_in_memory(&self) -> bool {
        false
    }

    /// Current size of the backing file in bytes.
    fn file_size(&self) -> Result<u64>;

    /// Shrinks or grows the backing file.
    fn truncate(&self, new_size: u64) -> Result<()>;

    /// Extends the file (or arena) by `count` consecutive pages and
    /// returns the address of the first.
    fn alloc_pages(&self, count: usize) -> Result<u64>;

    /// Reads `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` at `offset`, extending the file if needed.
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Releases a page run. Only meaningful for the in-memory arena; the
    /// disk device keeps freed pages in the file for later reuse.
    fn free_pages(&self, address: u64, count: usize) -> Result<()>;

    /// Durably flushes all written data (fsync).
    fn flush(&self) -> Result<()>;

    /// True if `offset` is currently readable through the mmap window.
    fn is_mapped(&self, offset: u64, len: usize) -> bool {
        let _ = (offset, len);
        false
    }

    /// Closes the device; further operations fail.
    fn close(&self) -> Result<()>;
}
