//! # In-Memory Device
//!
//! Allocation arena backing in-memory environments. Page "addresses" are
//! synthetic offsets handed out by a monotonic counter, so the rest of the
//! engine treats them exactly like file offsets. File-oriented operations
//! (`file_size`, `truncate`, `flush`) fail with `NotImplemented`, matching
//! the contract that an in-memory environment has no durable form.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::ErrorKind;

use super::Device;

pub struct MemoryDevice {
    page_size: usize,
    arena: Mutex<HashMap<u64, Box<[u8]>>>,
    next_address: AtomicU64,
}

impl MemoryDevice {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            arena: Mutex::new(HashMap::new()),
            next_address: AtomicU64::new(0),
        }
    }
}

impl Device for MemoryDevice {
    fn is_in_memory(&self) -> bool {
        true
    }

    fn file_size(&self) -> Result<u64> {
        bail!(ErrorKind::NotImplemented)
    }

    fn truncate(&self, _new_size: u64) -> Result<()> {
        bail!(ErrorKind::NotImplemented)
    }

    fn alloc_pages(&self, count: usize) -> Result<u64> {
        let grow = (self.page_size * count) as u64;
        let address = self.next_address.fetch_add(grow, Ordering::AcqRel);

        let mut arena = self.arena.lock();
        for i in 0..count {
            let page = vec![0u8; self.page_size].into_boxed_slice();
            arena.insert(address + (i * self.page_size) as u64, page);
        }
        Ok(address)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(buf.len() <= self.page_size, ErrorKind::InvalidArg);
        let arena = self.arena.lock();
        let page = arena
            .get(&offset)
            .ok_or_else(|| eyre::Report::new(ErrorKind::Io))?;
        buf.copy_from_slice(&page[..buf.len()]);
        Ok(())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(data.len() <= self.page_size, ErrorKind::InvalidArg);
        let mut arena = self.arena.lock();
        let page = arena
            .get_mut(&offset)
            .ok_or_else(|| eyre::Report::new(ErrorKind::Io))?;
        page[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn free_pages(&self, address: u64, count: usize) -> Result<()> {
        let mut arena = self.arena.lock();
        for i in 0..count {
            arena.remove(&(address + (i * self.page_size) as u64));
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.arena.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    #[test]
    fn file_operations_are_not_implemented() {
        let device = MemoryDevice::new(4096);
        assert_eq!(
            kind_of(&device.file_size().unwrap_err()),
            Some(ErrorKind::NotImplemented)
        );
        assert_eq!(
            kind_of(&device.truncate(0).unwrap_err()),
            Some(ErrorKind::NotImplemented)
        );
    }

    #[test]
    fn freed_pages_are_unreadable() {
        let device = MemoryDevice::new(4096);
        let addr = device.alloc_pages(1).unwrap();
        device.write(addr, &[1u8; 4096]).unwrap();
        device.free_pages(addr, 1).unwrap();

        let mut buf = [0u8; 4096];
        assert!(device.read(addr, &mut buf).is_err());
    }

    #[test]
    fn addresses_never_repeat() {
        let device = MemoryDevice::new(4096);
        let a = device.alloc_pages(1).unwrap();
        device.free_pages(a, 1).unwrap();
        let b = device.alloc_pages(1).unwrap();
        assert_ne!(a, b);
    }
}
