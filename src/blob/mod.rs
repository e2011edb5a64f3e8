//! # Blob Manager
//!
//! Stores variable-sized payloads (records too large for a node cell,
//! overflow keys, duplicate tables) and hands out 64-bit blob ids. A blob
//! id is the absolute byte address of the blob's header in the file, so
//! it resolves without any lookup structure: the containing page is
//! `id - id % page_size`, the in-page offset is `id % page_size`.
//!
//! ## Small blobs
//!
//! Blobs that fit in one page are packed into shared blob pages:
//!
//! ```text
//! +--------------------+  page offset 0
//! | page header (16)   |
//! +--------------------+
//! | blob page header   |  { live_count u16, free_tail u16, _pad u32 }
//! +--------------------+
//! | blob 0 header (16) |  { flags u32, size u32, allocated u32, _pad }
//! | blob 0 data        |
//! +--------------------+
//! | blob 1 header ...  |
//! +--------------------+
//! | free tail          |
//! +--------------------+
//! ```
//!
//! New blobs go to the current "last blob page" (tracked by the page
//! manager and persisted with its state): first a first-fit scan for a
//! freed slot large enough, then the free tail, then a fresh page.
//! Erasing decrements `live_count`; the page returns to the freelist when
//! the count reaches zero.
//!
//! ## Large blobs
//!
//! Payloads that exceed one page occupy a consecutive page run from
//! `alloc_multiple_blob_pages`. The first page carries normal headers;
//! continuation pages are headerless raw data.
//!
//! Invariant: a blob id resolves to at most one live blob. `overwrite`
//! reuses the allocation when the new payload fits, otherwise it
//! relocates and frees the old blob, returning the new id.

pub mod dup_table;

use std::sync::Arc;

use eyre::{ensure, Result};
use tracing::trace;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::PAGE_HEADER_SIZE;
use crate::error::ErrorKind;
use crate::page::Page;
use crate::pager::{fetch_flags, Context, PageManager};

pub const BLOB_PAGE_HEADER_SIZE: usize = 8;
pub const BLOB_HEADER_SIZE: usize = 16;

/// First usable byte for blob data within a shared blob page.
pub const BLOB_AREA_START: usize = PAGE_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE;

mod blob_flags {
    pub const LARGE: u32 = 1 << 0;
    pub const FREED: u32 = 1 << 1;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct BlobPageHeader {
    live_count: U16,
    free_tail: U16,
    _pad: U32,
}

impl BlobPageHeader {
    le_accessors! {
        live_count: u16,
        free_tail: u16,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct BlobHeader {
    flags: U32,
    size: U32,
    allocated: U32,
    _pad: U32,
}

impl BlobHeader {
    le_accessors! {
        flags: u32,
        size: u32,
        allocated: u32,
    }

    fn is_large(&self) -> bool {
        self.flags() & blob_flags::LARGE != 0
    }

    fn is_freed(&self) -> bool {
        self.flags() & blob_flags::FREED != 0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BlobMetrics {
    pub allocated: u64,
    pub read: u64,
    pub overwritten: u64,
    pub erased: u64,
}

pub struct BlobManager {
    page_size: usize,
    metrics: BlobMetrics,
}

impl BlobManager {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            metrics: BlobMetrics::default(),
        }
    }

    pub fn metrics(&self) -> BlobMetrics {
        self.metrics
    }

    /// Largest payload that still packs into a shared blob page.
    pub fn small_blob_max(&self) -> usize {
        self.page_size - BLOB_AREA_START - BLOB_HEADER_SIZE
    }

    fn capacity_of_first_large_page(&self) -> usize {
        self.page_size - BLOB_AREA_START - BLOB_HEADER_SIZE
    }

    fn page_address_of(&self, blob_id: u64) -> u64 {
        blob_id - blob_id % self.page_size as u64
    }

    fn offset_of(&self, blob_id: u64) -> usize {
        (blob_id % self.page_size as u64) as usize
    }

    /// Number of pages a large blob of `size` bytes occupies.
    fn large_page_count(&self, size: usize) -> usize {
        let first = self.capacity_of_first_large_page();
        if size <= first {
            1
        } else {
            1 + (size - first).div_ceil(self.page_size)
        }
    }

    pub fn allocate(
        &mut self,
        pager: &mut PageManager,
        ctx: &mut Context,
        data: &[u8],
    ) -> Result<u64> {
        self.metrics.allocated += 1;
        if data.len() > self.small_blob_max() {
            self.allocate_large(pager, ctx, data)
        } else {
            self.allocate_small(pager, ctx, data)
        }
    }

    fn allocate_small(
        &mut self,
        pager: &mut PageManager,
        ctx: &mut Context,
        data: &[u8],
    ) -> Result<u64> {
        let needed = BLOB_HEADER_SIZE + data.len();

        if pager.last_blob_page() != 0 {
            let page = pager.fetch(ctx, pager.last_blob_page(), 0)?;

            // first-fit over freed slots
            if let Some(offset) = self.find_freed_slot(&page, data.len()) {
                self.write_blob_at(&page, offset, data, 0, data.len() as u32, None)?;
                self.bump_live(&page, 1)?;
                page.set_dirty();
                return Ok(page.address() + offset as u64);
            }

            // then the free tail
            let free_tail = self.page_header(&page)?.free_tail() as usize;
            if free_tail + needed <= self.page_size {
                self.write_blob_at(
                    &page,
                    free_tail,
                    data,
                    0,
                    data.len() as u32,
                    Some((free_tail + needed) as u16),
                )?;
                self.bump_live(&page, 1)?;
                page.set_dirty();
                return Ok(page.address() + free_tail as u64);
            }
        }

        // fresh shared blob page
        let page = pager.alloc(ctx, crate::page::PageType::Blob, 0)?;
        {
            let mut buf = page.data_mut();
            let header = BlobPageHeader::mut_from_bytes(
                &mut buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE],
            )
            .map_err(|_| eyre::Report::new(ErrorKind::Internal))?;
            header.set_live_count(0);
            header.set_free_tail(BLOB_AREA_START as u16);
        }
        pager.set_last_blob_page(page.address());

        let offset = BLOB_AREA_START;
        self.write_blob_at(
            &page,
            offset,
            data,
            0,
            data.len() as u32,
            Some((offset + needed) as u16),
        )?;
        self.bump_live(&page, 1)?;
        page.set_dirty();
        trace!(page = page.address(), size = data.len(), "opened new blob page");
        Ok(page.address() + offset as u64)
    }

    fn allocate_large(
        &mut self,
        pager: &mut PageManager,
        ctx: &mut Context,
        data: &[u8],
    ) -> Result<u64> {
        let count = self.large_page_count(data.len());
        let first = pager.alloc_multiple_blob_pages(ctx, count)?;

        {
            let mut buf = first.data_mut();
            let page_header = BlobPageHeader::mut_from_bytes(
                &mut buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE],
            )
            .map_err(|_| eyre::Report::new(ErrorKind::Internal))?;
            page_header.set_live_count(1);
            page_header.set_free_tail(self.page_size as u16);

            let header = BlobHeader::mut_from_bytes(
                &mut buf[BLOB_AREA_START..BLOB_AREA_START + BLOB_HEADER_SIZE],
            )
            .map_err(|_| eyre::Report::new(ErrorKind::Internal))?;
            header.set_flags(blob_flags::LARGE);
            header.set_size(data.len() as u32);
            header.set_allocated(data.len() as u32);

            let first_capacity = self.capacity_of_first_large_page();
            let take = data.len().min(first_capacity);
            let start = BLOB_AREA_START + BLOB_HEADER_SIZE;
            buf[start..start + take].copy_from_slice(&data[..take]);
        }

        // continuation pages hold raw payload
        let first_capacity = self.capacity_of_first_large_page();
        let mut written = first_capacity.min(data.len());
        let mut page_index = 1;
        while written < data.len() {
            let address = first.address() + (page_index * self.page_size) as u64;
            let page = ctx
                .changeset
                .get(address)
                .cloned()
                .ok_or_else(|| eyre::Report::new(ErrorKind::Internal))?;
            let take = (data.len() - written).min(self.page_size);
            page.data_mut()[..take].copy_from_slice(&data[written..written + take]);
            page.set_dirty();
            written += take;
            page_index += 1;
        }

        trace!(
            page = first.address(),
            pages = count,
            size = data.len(),
            "allocated large blob"
        );
        Ok(first.address() + BLOB_AREA_START as u64)
    }

    pub fn read(
        &mut self,
        pager: &mut PageManager,
        ctx: &mut Context,
        blob_id: u64,
    ) -> Result<Vec<u8>> {
        self.metrics.read += 1;
        let page_address = self.page_address_of(blob_id);
        let offset = self.offset_of(blob_id);
        let page = pager.fetch(ctx, page_address, fetch_flags::READ_ONLY)?;

        let (flags, size) = {
            let buf = page.data();
            let header = self.blob_header(&buf, offset)?;
            ensure!(!header.is_freed(), ErrorKind::IntegrityViolated);
            (header.flags(), header.size() as usize)
        };

        let mut out = Vec::with_capacity(size);
        if flags & blob_flags::LARGE == 0 {
            let buf = page.data();
            let start = offset + BLOB_HEADER_SIZE;
            out.extend_from_slice(&buf[start..start + size]);
            return Ok(out);
        }

        let first_capacity = self.capacity_of_first_large_page();
        {
            let buf = page.data();
            let start = offset + BLOB_HEADER_SIZE;
            let take = size.min(first_capacity);
            out.extend_from_slice(&buf[start..start + take]);
        }
        let mut page_index = 1;
        while out.len() < size {
            let address = page_address + (page_index * self.page_size) as u64;
            let cont = pager.fetch(
                ctx,
                address,
                fetch_flags::READ_ONLY | fetch_flags::NO_HEADER,
            )?;
            let buf = cont.data();
            let take = (size - out.len()).min(self.page_size);
            out.extend_from_slice(&buf[..take]);
            page_index += 1;
        }
        Ok(out)
    }

    /// Overwrites a blob, in place when the allocation fits. Returns the
    /// blob id, which changes when the blob had to relocate.
    pub fn overwrite(
        &mut self,
        pager: &mut PageManager,
        ctx: &mut Context,
        blob_id: u64,
        data: &[u8],
    ) -> Result<u64> {
        self.metrics.overwritten += 1;
        let page_address = self.page_address_of(blob_id);
        let offset = self.offset_of(blob_id);
        let page = pager.fetch(ctx, page_address, 0)?;

        let (is_large, allocated) = {
            let buf = page.data();
            let header = self.blob_header(&buf, offset)?;
            ensure!(!header.is_freed(), ErrorKind::IntegrityViolated);
            (header.is_large(), header.allocated() as usize)
        };

        if !is_large && data.len() <= allocated {
            let mut buf = page.data_mut();
            let header = self.blob_header_mut(&mut buf, offset)?;
            header.set_size(data.len() as u32);
            let start = offset + BLOB_HEADER_SIZE;
            buf[start..start + data.len()].copy_from_slice(data);
            drop(buf);
            page.set_dirty();
            return Ok(blob_id);
        }

        drop(page);
        let new_id = self.allocate(pager, ctx, data)?;
        self.erase(pager, ctx, blob_id)?;
        Ok(new_id)
    }

    pub fn erase(
        &mut self,
        pager: &mut PageManager,
        ctx: &mut Context,
        blob_id: u64,
    ) -> Result<()> {
        self.metrics.erased += 1;
        let page_address = self.page_address_of(blob_id);
        let offset = self.offset_of(blob_id);
        let page = pager.fetch(ctx, page_address, 0)?;

        let (is_large, size) = {
            let buf = page.data();
            let header = self.blob_header(&buf, offset)?;
            ensure!(!header.is_freed(), ErrorKind::IntegrityViolated);
            (header.is_large(), header.size() as usize)
        };

        if is_large {
            let count = self.large_page_count(size);
            drop(page);
            pager.del(ctx, page_address, count)?;
            if pager.last_blob_page() == page_address {
                pager.set_last_blob_page(0);
            }
            return Ok(());
        }

        {
            let mut buf = page.data_mut();
            let header = self.blob_header_mut(&mut buf, offset)?;
            header.set_flags(header.flags() | blob_flags::FREED);
        }
        page.set_dirty();
        let live = self.bump_live(&page, -1)?;
        if live == 0 {
            drop(page);
            pager.del(ctx, page_address, 1)?;
            if pager.last_blob_page() == page_address {
                pager.set_last_blob_page(0);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    fn page_header(&self, page: &Page) -> Result<BlobPageHeader> {
        let buf = page.data();
        BlobPageHeader::read_from_bytes(
            &buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE],
        )
        .map_err(|_| eyre::Report::new(ErrorKind::Internal))
    }

    fn blob_header<'a>(&self, buf: &'a [u8], offset: usize) -> Result<&'a BlobHeader> {
        ensure!(
            offset >= BLOB_AREA_START && offset + BLOB_HEADER_SIZE <= buf.len(),
            ErrorKind::IntegrityViolated
        );
        BlobHeader::ref_from_bytes(&buf[offset..offset + BLOB_HEADER_SIZE])
            .map_err(|_| eyre::Report::new(ErrorKind::IntegrityViolated))
    }

    fn blob_header_mut<'a>(&self, buf: &'a mut [u8], offset: usize) -> Result<&'a mut BlobHeader> {
        ensure!(
            offset >= BLOB_AREA_START && offset + BLOB_HEADER_SIZE <= buf.len(),
            ErrorKind::IntegrityViolated
        );
        BlobHeader::mut_from_bytes(&mut buf[offset..offset + BLOB_HEADER_SIZE])
            .map_err(|_| eyre::Report::new(ErrorKind::IntegrityViolated))
    }

    /// Scans the blob headers of a shared page for a freed slot with at
    /// least `needed` bytes of payload capacity.
    fn find_freed_slot(&self, page: &Page, needed: usize) -> Option<usize> {
        let buf = page.data();
        let free_tail = BlobPageHeader::read_from_bytes(
            &buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE],
        )
        .ok()?
        .free_tail() as usize;

        let mut offset = BLOB_AREA_START;
        while offset + BLOB_HEADER_SIZE <= free_tail {
            let header = BlobHeader::ref_from_bytes(&buf[offset..offset + BLOB_HEADER_SIZE]).ok()?;
            let allocated = header.allocated() as usize;
            if header.is_freed() && allocated >= needed {
                return Some(offset);
            }
            offset += BLOB_HEADER_SIZE + allocated;
        }
        None
    }

    /// Writes a small-blob header and payload at `offset`. When the slot
    /// is fresh (not reused), `new_free_tail` advances the page's tail and
    /// the allocation equals the payload length; a reused slot keeps its
    /// recorded allocation.
    fn write_blob_at(
        &self,
        page: &Page,
        offset: usize,
        data: &[u8],
        flags: u32,
        size: u32,
        new_free_tail: Option<u16>,
    ) -> Result<()> {
        let mut buf = page.data_mut();
        {
            let header = self.blob_header_mut(&mut buf, offset)?;
            let allocated = if new_free_tail.is_some() {
                data.len() as u32
            } else {
                header.allocated()
            };
            header.set_flags(flags);
            header.set_size(size);
            header.set_allocated(allocated);
        }
        let start = offset + BLOB_HEADER_SIZE;
        buf[start..start + data.len()].copy_from_slice(data);

        if let Some(tail) = new_free_tail {
            let header = BlobPageHeader::mut_from_bytes(
                &mut buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE],
            )
            .map_err(|_| eyre::Report::new(ErrorKind::Internal))?;
            header.set_free_tail(tail);
        }
        Ok(())
    }

    fn bump_live(&self, page: &Page, delta: i32) -> Result<u16> {
        let mut buf = page.data_mut();
        let header = BlobPageHeader::mut_from_bytes(
            &mut buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE],
        )
        .map_err(|_| eyre::Report::new(ErrorKind::Internal))?;
        let live = (header.live_count() as i32 + delta).max(0) as u16;
        header.set_live_count(live);
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::device::MemoryDevice;

    fn setup() -> (PageManager, BlobManager, Context) {
        let config = EnvConfig::default();
        let device = MemoryDevice::new(config.page_size);
        let pager = PageManager::new(Arc::new(device), &config);
        let blobs = BlobManager::new(config.page_size);
        (pager, blobs, Context::new(0, None))
    }

    #[test]
    fn small_blob_round_trips() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let id = blobs.allocate(&mut pager, &mut ctx, b"payload").unwrap();
        let back = blobs.read(&mut pager, &mut ctx, id).unwrap();
        assert_eq!(back, b"payload");
    }

    #[test]
    fn small_blobs_share_a_page() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let a = blobs.allocate(&mut pager, &mut ctx, b"aaa").unwrap();
        let b = blobs.allocate(&mut pager, &mut ctx, b"bbbb").unwrap();
        assert_eq!(
            blobs.page_address_of(a),
            blobs.page_address_of(b),
            "both blobs should pack into the shared page"
        );
        assert_eq!(blobs.read(&mut pager, &mut ctx, b).unwrap(), b"bbbb");
    }

    #[test]
    fn large_blob_spans_pages_and_round_trips() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let id = blobs.allocate(&mut pager, &mut ctx, &data).unwrap();
        let back = blobs.read(&mut pager, &mut ctx, id).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn overwrite_in_place_keeps_the_id() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let id = blobs.allocate(&mut pager, &mut ctx, b"0123456789").unwrap();
        let same = blobs.overwrite(&mut pager, &mut ctx, id, b"abcde").unwrap();
        assert_eq!(same, id);
        assert_eq!(blobs.read(&mut pager, &mut ctx, id).unwrap(), b"abcde");
    }

    #[test]
    fn overwrite_relocates_when_growing() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let id = blobs.allocate(&mut pager, &mut ctx, b"tiny").unwrap();
        let grown = vec![9u8; 500];
        let new_id = blobs.overwrite(&mut pager, &mut ctx, id, &grown).unwrap();
        assert_ne!(new_id, id);
        assert_eq!(blobs.read(&mut pager, &mut ctx, new_id).unwrap(), grown);
        // the old id is dead
        assert!(blobs.read(&mut pager, &mut ctx, id).is_err());
    }

    #[test]
    fn erase_reuses_the_slot_first_fit() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let a = blobs.allocate(&mut pager, &mut ctx, &[1u8; 64]).unwrap();
        let _b = blobs.allocate(&mut pager, &mut ctx, &[2u8; 64]).unwrap();
        blobs.erase(&mut pager, &mut ctx, a).unwrap();

        // fits into a's freed slot
        let c = blobs.allocate(&mut pager, &mut ctx, &[3u8; 48]).unwrap();
        assert_eq!(c, a);
        assert_eq!(blobs.read(&mut pager, &mut ctx, c).unwrap(), vec![3u8; 48]);
    }

    #[test]
    fn erasing_the_last_blob_frees_the_page() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let a = blobs.allocate(&mut pager, &mut ctx, b"only").unwrap();
        let page = blobs.page_address_of(a);
        ctx.changeset.clear();
        blobs.erase(&mut pager, &mut ctx, a).unwrap();

        assert_eq!(pager.freelist_pages(), 1);
        assert_eq!(pager.last_blob_page(), 0);
        let _ = page;
    }

    #[test]
    fn erase_of_large_blob_frees_the_whole_run() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let data = vec![5u8; 3 * crate::config::DEFAULT_PAGE_SIZE];
        let id = blobs.allocate(&mut pager, &mut ctx, &data).unwrap();
        let pages = blobs.large_page_count(data.len());
        ctx.changeset.clear();

        blobs.erase(&mut pager, &mut ctx, id).unwrap();
        assert_eq!(pager.freelist_pages(), pages as u64);
    }
}
