//! # Pages
//!
//! Every allocation unit of the data file is one fixed-size page. The
//! persisted layout is a 16-byte header followed by the payload:
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  -----------------------------------------
//! 0       8     address   Byte offset of this page in the file
//! 8       4     flags     Low byte: page type tag
//! 12      4     crc32     Payload checksum (0 when CRC is disabled)
//! ```
//!
//! Blob continuation pages are the exception: they carry no header and
//! their full extent is payload (`Page::no_header`).
//!
//! ## Page Types
//!
//! - **Header** (0x01): page 0, the environment header
//! - **BtreeRoot** (0x02) / **BtreeLeaf** (0x03) / **BtreeInternal** (0x04)
//! - **Blob** (0x05): shared small-blob page or first page of a large blob
//! - **Freelist** (0x06): reserved for freelist overflow
//! - **PagerState** (0x07): serialized page-manager state
//!
//! ## Sharing model
//!
//! Pages live behind `Arc<Page>`: the cache holds the owning reference,
//! the current operation's [`Changeset`](crate::pager::Changeset) pins the
//! page for the duration of the mutation, and cursors hold observing
//! references while coupled. A page whose only reference is the cache's
//! is evictable. The payload buffer sits behind a `RwLock` so the flush
//! worker can read a page image while the foreground continues; the
//! environment-level mutex guarantees no concurrent mutation.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::PAGE_HEADER_SIZE;
use crate::device::Device;
use crate::error::ErrorKind;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    Header = 0x01,
    BtreeRoot = 0x02,
    BtreeLeaf = 0x03,
    BtreeInternal = 0x04,
    Blob = 0x05,
    Freelist = 0x06,
    PagerState = 0x07,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::Header,
            0x02 => PageType::BtreeRoot,
            0x03 => PageType::BtreeLeaf,
            0x04 => PageType::BtreeInternal,
            0x05 => PageType::Blob,
            0x06 => PageType::Freelist,
            0x07 => PageType::PagerState,
            _ => PageType::Unknown,
        }
    }

    pub fn is_btree(self) -> bool {
        matches!(
            self,
            PageType::BtreeRoot | PageType::BtreeLeaf | PageType::BtreeInternal
        )
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PersistedPageHeader {
    address: U64,
    flags: U32,
    crc32: U32,
}

impl PersistedPageHeader {
    le_accessors! {
        address: u64,
        flags: u32,
        crc32: u32,
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte((self.flags() & 0xff) as u8)
    }

    pub fn set_page_type(&mut self, ptype: PageType) {
        let flags = (self.flags() & !0xff) | ptype as u32;
        self.set_flags(flags);
    }
}

const _: () = assert!(std::mem::size_of::<PersistedPageHeader>() == PAGE_HEADER_SIZE);

/// One in-memory page. See the module docs for the sharing model.
#[derive(Debug)]
pub struct Page {
    address: u64,
    no_header: bool,
    db: AtomicU16,
    dirty: AtomicBool,
    data: RwLock<Vec<u8>>,
}

impl Page {
    /// Creates a freshly allocated, zeroed page with its header set up.
    pub fn new_allocated(address: u64, ptype: PageType, page_size: usize, no_header: bool) -> Self {
        let mut data = vec![0u8; page_size];
        if !no_header {
            let header = PersistedPageHeader::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
                .expect("page buffer shorter than header");
            header.set_address(address);
            header.set_page_type(ptype);
        }
        Self {
            address,
            no_header,
            db: AtomicU16::new(0),
            dirty: AtomicBool::new(false),
            data: RwLock::new(data),
        }
    }

    /// Wraps a page image read from the device.
    pub fn from_disk(address: u64, no_header: bool, data: Vec<u8>) -> Self {
        Self {
            address,
            no_header,
            db: AtomicU16::new(0),
            dirty: AtomicBool::new(false),
            data: RwLock::new(data),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn no_header(&self) -> bool {
        self.no_header
    }

    /// Byte offset where the payload begins.
    pub fn payload_offset(&self) -> usize {
        if self.no_header {
            0
        } else {
            PAGE_HEADER_SIZE
        }
    }

    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    pub fn page_type(&self) -> PageType {
        if self.no_header {
            return PageType::Unknown;
        }
        let data = self.data.read();
        PersistedPageHeader::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map(|h| h.page_type())
            .unwrap_or(PageType::Unknown)
    }

    pub fn set_page_type(&self, ptype: PageType) {
        if self.no_header {
            return;
        }
        let mut data = self.data.write();
        if let Ok(header) = PersistedPageHeader::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE]) {
            header.set_page_type(ptype);
        }
    }

    /// Name of the database this page belongs to (0 = none).
    pub fn db(&self) -> u16 {
        self.db.load(Ordering::Relaxed)
    }

    pub fn set_db(&self, dbname: u16) {
        self.db.store(dbname, Ordering::Relaxed);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Validates the persisted header against the expected address and,
    /// when `verify_crc`, the payload checksum.
    pub fn verify(&self, verify_crc: bool) -> Result<()> {
        if self.no_header {
            return Ok(());
        }
        let data = self.data.read();
        let header = PersistedPageHeader::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|_| eyre::Report::new(ErrorKind::IntegrityViolated))?;

        // a freshly allocated page that was never flushed is all zeroes
        if header.address() == 0 && header.flags() == 0 && self.address != 0 {
            return Ok(());
        }

        ensure!(
            header.address() == self.address,
            eyre::Report::new(ErrorKind::IntegrityViolated)
                .wrap_err(format!(
                    "page header address {} does not match file offset {}",
                    header.address(),
                    self.address
                ))
        );

        if verify_crc && header.crc32() != 0 {
            let computed = CRC32.checksum(&data[PAGE_HEADER_SIZE..]);
            ensure!(
                computed == header.crc32(),
                eyre::Report::new(ErrorKind::IntegrityViolated).wrap_err(format!(
                    "crc mismatch on page {}: stored {:08x}, computed {:08x}",
                    self.address,
                    header.crc32(),
                    computed
                ))
            );
        }
        Ok(())
    }
}

/// Writes a page image to the device and clears the dirty flag.
///
/// The persisted header (address, checksum) is refreshed in the buffer
/// before the write so a page image in the journal and a page image in the
/// data file are byte-identical.
pub fn flush_page(device: &dyn Device, page: &Page, with_crc: bool) -> Result<()> {
    let mut data = page.data_mut();
    if !page.no_header() {
        let crc = if with_crc {
            CRC32.checksum(&data[PAGE_HEADER_SIZE..])
        } else {
            0
        };
        let header = PersistedPageHeader::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|_| eyre::Report::new(ErrorKind::Internal))?;
        header.set_address(page.address());
        header.set_crc32(crc);
    }
    device.write(page.address(), &data)?;
    page.clear_dirty();
    Ok(())
}

/// True if no reference outside the cache exists.
pub fn is_unreferenced(page: &Arc<Page>) -> bool {
    Arc::strong_count(page) == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    const PAGE_SIZE: usize = 4096;

    #[test]
    fn persisted_header_is_16_bytes() {
        assert_eq!(std::mem::size_of::<PersistedPageHeader>(), PAGE_HEADER_SIZE);
    }

    #[test]
    fn new_page_carries_type_and_address() {
        let page = Page::new_allocated(PAGE_SIZE as u64, PageType::BtreeLeaf, PAGE_SIZE, false);
        assert_eq!(page.page_type(), PageType::BtreeLeaf);
        assert_eq!(page.address(), PAGE_SIZE as u64);
        assert!(!page.is_dirty());
    }

    #[test]
    fn no_header_page_payload_spans_everything() {
        let page = Page::new_allocated(0, PageType::Blob, PAGE_SIZE, true);
        assert_eq!(page.payload_offset(), 0);
        assert_eq!(page.page_type(), PageType::Unknown);
    }

    #[test]
    fn flush_stamps_crc_and_verify_accepts_it() {
        let device = MemoryDevice::new(PAGE_SIZE);
        let addr = device.alloc_pages(1).unwrap();

        let page = Page::new_allocated(addr, PageType::Blob, PAGE_SIZE, false);
        page.data_mut()[100] = 42;
        page.set_dirty();
        flush_page(&device, &page, true).unwrap();
        assert!(!page.is_dirty());

        page.verify(true).unwrap();
    }

    #[test]
    fn verify_detects_corrupted_payload() {
        let device = MemoryDevice::new(PAGE_SIZE);
        let addr = device.alloc_pages(1).unwrap();

        let page = Page::new_allocated(addr, PageType::Blob, PAGE_SIZE, false);
        flush_page(&device, &page, true).unwrap();

        page.data_mut()[200] ^= 0xFF;
        let err = page.verify(true).unwrap_err();
        assert_eq!(
            crate::error::kind_of(&err),
            Some(ErrorKind::IntegrityViolated)
        );
    }

    #[test]
    fn verify_detects_address_mismatch() {
        let page = Page::new_allocated(PAGE_SIZE as u64, PageType::Blob, PAGE_SIZE, false);
        {
            let mut data = page.data_mut();
            let header =
                PersistedPageHeader::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE]).unwrap();
            header.set_address(999);
        }
        assert!(page.verify(false).is_err());
    }
}
