//! # Page Manager
//!
//! Owner of every live page. The page manager allocates, fetches, pins,
//! flushes, evicts and frees pages; it owns the [`Cache`], the
//! [`Freelist`] and the background flush [`Worker`], and persists its own
//! state (freelist + last-blob-page pointer) in a chain of dedicated
//! pages referenced from the environment header.
//!
//! ## Operation protocol
//!
//! Every call takes the operation's [`Context`]; fetched and allocated
//! pages are added to the context's changeset (unless fetched read-only),
//! which pins them until the mutation completes and becomes the unit of
//! atomic journaling.
//!
//! ## Allocation
//!
//! `alloc` consults the freelist first (first-fit), then extends the
//! device by one page. `alloc_multiple_blob_pages` finds a best-fit run
//! for multi-page blobs; the trailing pages carry no header. `del`
//! returns a run to the freelist and drops it from the cache.
//!
//! ## Eviction
//!
//! `purge_cache` runs when the cache exceeds its byte budget: the LRU
//! unpinned entries are removed and handed to the worker thread, which
//! flushes the dirty ones outside any lock. With `cache_strict` the purge
//! fails instead when nothing is evictable.
//!
//! ## State persistence
//!
//! The freelist and the last-blob-page pointer serialize into `PagerState`
//! pages on clean close and whenever the freelist has grown by
//! `FREELIST_STORE_THRESHOLD` runs since the last store
//! (`maybe_store_state`). The first page of the chain is the "state blob
//! id" recorded in the environment header.

mod cache;
mod changeset;
mod freelist;
mod worker;

pub use cache::Cache;
pub use changeset::{Changeset, Context};
pub use freelist::Freelist;
pub use worker::Worker;

use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, trace};

use crate::config::{EnvConfig, env_flags, FREELIST_STORE_THRESHOLD, PAGE_HEADER_SIZE};
use crate::device::Device;
use crate::error::ErrorKind;
use crate::page::{flush_page, Page, PageType};

/// Flags for [`PageManager::fetch`].
pub mod fetch_flags {
    /// Do not add the page to the context's changeset.
    pub const READ_ONLY: u32 = 1 << 0;
    /// The page is a blob continuation page without a header.
    pub const NO_HEADER: u32 = 1 << 1;
}

/// Flags for [`PageManager::alloc`].
pub mod alloc_flags {
    /// Zero the full page (allocations are zeroed regardless; the flag
    /// exists for call sites that must express the requirement).
    pub const CLEAR_WITH_ZERO: u32 = 1 << 0;
    /// Bypass the freelist and extend the file.
    pub const IGNORE_FREELIST: u32 = 1 << 1;
    /// Do not trigger a state store even if the threshold was crossed.
    pub const DISABLE_STORE_STATE: u32 = 1 << 2;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PagerMetrics {
    pub fetches: u64,
    pub allocs: u64,
    pub freelist_allocs: u64,
    pub flushed_pages: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

pub struct PageManager {
    device: Arc<dyn Device>,
    cache: Cache,
    freelist: Freelist,
    worker: Worker,
    page_size: usize,
    with_crc: bool,
    cache_strict: bool,
    last_blob_page: u64,
    state_page: u64,
    runs_since_store: usize,
    metrics: PagerMetrics,
}

impl PageManager {
    pub fn new(device: Arc<dyn Device>, config: &EnvConfig) -> Self {
        let with_crc = config.has(env_flags::ENABLE_CRC32);
        Self {
            worker: Worker::spawn(Arc::clone(&device), with_crc),
            device,
            cache: Cache::new(config.cache_size_bytes, config.page_size),
            freelist: Freelist::new(),
            page_size: config.page_size,
            with_crc,
            cache_strict: config.has(env_flags::CACHE_STRICT),
            last_blob_page: 0,
            state_page: 0,
            runs_since_store: 0,
            metrics: PagerMetrics::default(),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn last_blob_page(&self) -> u64 {
        self.last_blob_page
    }

    pub fn set_last_blob_page(&mut self, address: u64) {
        self.last_blob_page = address;
    }

    pub fn state_page(&self) -> u64 {
        self.state_page
    }

    pub fn metrics(&self) -> PagerMetrics {
        let mut m = self.metrics;
        m.cache_hits = self.cache.hits();
        m.cache_misses = self.cache.misses();
        m
    }

    pub fn freelist_pages(&self) -> u64 {
        self.freelist.free_pages()
    }

    /// Fetches a page, reading it from the device on a cache miss. The
    /// page joins the changeset unless `READ_ONLY` is set.
    pub fn fetch(&mut self, ctx: &mut Context, address: u64, flags: u32) -> Result<Arc<Page>> {
        self.metrics.fetches += 1;

        if let Some(page) = self.cache.get(address) {
            if flags & fetch_flags::READ_ONLY == 0 {
                ctx.changeset.put(Arc::clone(&page));
            }
            return Ok(page);
        }

        let no_header = flags & fetch_flags::NO_HEADER != 0;
        let mut data = vec![0u8; self.page_size];
        self.device
            .read(address, &mut data)
            .wrap_err_with(|| format!("failed to read page at {}", address))?;

        let page = Arc::new(Page::from_disk(address, no_header, data));
        // an unreadable page aborts the operation and is not cached
        page.verify(self.with_crc)?;

        self.cache.insert(Arc::clone(&page));
        if flags & fetch_flags::READ_ONLY == 0 {
            ctx.changeset.put(Arc::clone(&page));
        }
        trace!(address, "fetched page from device");
        Ok(page)
    }

    /// Returns a page only if it is currently cached.
    pub fn fetch_cached(&mut self, address: u64) -> Option<Arc<Page>> {
        self.cache.get(address)
    }

    /// Allocates one page of `ptype`, freelist first.
    pub fn alloc(&mut self, ctx: &mut Context, ptype: PageType, flags: u32) -> Result<Arc<Page>> {
        self.metrics.allocs += 1;

        let from_freelist = if flags & alloc_flags::IGNORE_FREELIST == 0 {
            self.freelist.alloc(self.page_size)
        } else {
            None
        };

        let address = match from_freelist {
            Some(address) => {
                self.metrics.freelist_allocs += 1;
                address
            }
            None => self.device.alloc_pages(1)?,
        };

        let page = Arc::new(Page::new_allocated(address, ptype, self.page_size, false));
        page.set_db(ctx.dbname);
        page.set_dirty();
        self.cache.insert(Arc::clone(&page));
        ctx.changeset.put(Arc::clone(&page));

        if flags & alloc_flags::DISABLE_STORE_STATE == 0 {
            self.maybe_store_state(ctx, false)?;
        }
        trace!(address, ?ptype, "allocated page");
        Ok(page)
    }

    /// Allocates `count` consecutive pages for a multi-page blob and
    /// returns the first. The trailing pages are headerless continuation
    /// pages; all of them join the changeset.
    pub fn alloc_multiple_blob_pages(
        &mut self,
        ctx: &mut Context,
        count: usize,
    ) -> Result<Arc<Page>> {
        ensure!(count >= 1, ErrorKind::InvalidArg);
        self.metrics.allocs += count as u64;

        let address = match self.freelist.alloc_run(count as u64, self.page_size) {
            Some(address) => {
                self.metrics.freelist_allocs += count as u64;
                address
            }
            None => self.device.alloc_pages(count)?,
        };

        let first = Arc::new(Page::new_allocated(address, PageType::Blob, self.page_size, false));
        first.set_db(ctx.dbname);
        first.set_dirty();
        self.cache.insert(Arc::clone(&first));
        ctx.changeset.put(Arc::clone(&first));

        for i in 1..count {
            let addr = address + (i * self.page_size) as u64;
            let cont = Arc::new(Page::new_allocated(addr, PageType::Blob, self.page_size, true));
            cont.set_db(ctx.dbname);
            cont.set_dirty();
            self.cache.insert(Arc::clone(&cont));
            ctx.changeset.put(cont);
        }
        debug!(address, count, "allocated blob page run");
        Ok(first)
    }

    /// Returns a page run to the freelist. The pages leave the cache and
    /// the changeset; their contents are dead.
    pub fn del(&mut self, ctx: &mut Context, address: u64, count: usize) -> Result<()> {
        for i in 0..count {
            let addr = address + (i * self.page_size) as u64;
            if let Some(page) = self.cache.remove(addr) {
                page.clear_dirty();
            }
            ctx.changeset.remove(addr);
        }
        self.device.free_pages(address, count)?;
        self.freelist.put(address, count as u64, self.page_size);
        self.runs_since_store += 1;
        trace!(address, count, "freed page run");
        Ok(())
    }

    /// Writes every dirty cached page and fsyncs the device.
    pub fn flush_all_pages(&mut self) -> Result<()> {
        for page in self.cache.all_pages() {
            if page.is_dirty() {
                flush_page(self.device.as_ref(), &page, self.with_crc)?;
                self.metrics.flushed_pages += 1;
            }
        }
        self.device.flush()
    }

    /// Flushes one page immediately (changeset flush path).
    pub fn flush_page_now(&mut self, page: &Page) -> Result<()> {
        flush_page(self.device.as_ref(), page, self.with_crc)?;
        self.metrics.flushed_pages += 1;
        Ok(())
    }

    /// Evicts LRU pages once the cache is over budget. The victims are
    /// flushed on the worker thread; a full worker queue falls back to an
    /// inline flush.
    pub fn purge_cache(&mut self, _ctx: &mut Context) -> Result<()> {
        if !self.cache.is_over_budget() {
            return Ok(());
        }

        let victims = self.cache.collect_victims();
        if victims.is_empty() {
            ensure!(!self.cache_strict, ErrorKind::LimitsReached);
            return Ok(());
        }

        debug!(count = victims.len(), "purging page cache");
        if let Err(returned) = self.worker.submit(victims) {
            for page in returned {
                if page.is_dirty() {
                    flush_page(self.device.as_ref(), &page, self.with_crc)?;
                    self.metrics.flushed_pages += 1;
                }
            }
        }
        Ok(())
    }

    /// Flushes and evicts every page tagged for `dbname`.
    pub fn close_database(&mut self, _ctx: &mut Context, dbname: u16) -> Result<()> {
        for page in self.cache.pages_of_db(dbname) {
            if page.is_dirty() {
                flush_page(self.device.as_ref(), &page, self.with_crc)?;
                self.metrics.flushed_pages += 1;
            }
            self.cache.remove(page.address());
        }
        Ok(())
    }

    /// Truncates trailing free runs off the file.
    pub fn reclaim_space(&mut self, _ctx: &mut Context) -> Result<()> {
        if self.device.is_in_memory() {
            return Ok(());
        }
        loop {
            let file_size = self.device.file_size()?;
            match self.freelist.truncate_tail(file_size, self.page_size) {
                Some(new_size) => {
                    self.device.truncate(new_size)?;
                    self.runs_since_store += 1;
                    debug!(new_size, "reclaimed trailing file space");
                }
                None => return Ok(()),
            }
        }
    }

    // ------------------------------------------------------------------
    // state persistence
    //
    // Serialized form: { last_blob_page u64, freelist }. The bytes span a
    // chain of PagerState pages, each with payload { next u64, len u32,
    // chunk }; the first page's address is the state blob id stored in
    // the environment header.
    // ------------------------------------------------------------------

    fn serialize_state(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.freelist.run_count() * 16);
        out.extend_from_slice(&self.last_blob_page.to_le_bytes());
        self.freelist.serialize(&mut out);
        out
    }

    /// Loads the persisted state. Called once at open (after changeset
    /// recovery, which may have restored the state pages).
    pub fn initialize(&mut self, ctx: &mut Context, state_page: u64) -> Result<()> {
        if state_page == 0 {
            return Ok(());
        }
        self.state_page = state_page;

        let mut bytes = Vec::new();
        let mut address = state_page;
        while address != 0 {
            let page = self.fetch(ctx, address, fetch_flags::READ_ONLY)?;
            let data = page.data();
            let payload = &data[PAGE_HEADER_SIZE..];
            let next = u64::from_le_bytes(payload[..8].try_into().unwrap());
            let len = u32::from_le_bytes(payload[8..12].try_into().unwrap()) as usize;
            ensure!(12 + len <= payload.len(), ErrorKind::IntegrityViolated);
            bytes.extend_from_slice(&payload[12..12 + len]);
            address = next;
        }

        ensure!(bytes.len() >= 8, ErrorKind::IntegrityViolated);
        self.last_blob_page = u64::from_le_bytes(bytes[..8].try_into().unwrap());
        let (freelist, _used) = Freelist::deserialize(&bytes[8..])?;
        self.freelist = freelist;
        self.runs_since_store = 0;
        debug!(
            state_page,
            free_pages = self.freelist.free_pages(),
            "loaded page-manager state"
        );
        Ok(())
    }

    /// Persists the state, reusing the existing chain where possible.
    /// Returns the first page's address.
    pub fn store_state(&mut self, ctx: &mut Context) -> Result<u64> {
        let bytes = self.serialize_state();
        let chunk_capacity = self.page_size - PAGE_HEADER_SIZE - 12;

        let mut chain: Vec<Arc<Page>> = Vec::new();
        let mut address = self.state_page;
        while address != 0 {
            let page = self.fetch(ctx, address, 0)?;
            let next = {
                let data = page.data();
                u64::from_le_bytes(data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 8].try_into().unwrap())
            };
            chain.push(page);
            address = next;
        }

        let needed = bytes.chunks(chunk_capacity).count().max(1);
        while chain.len() < needed {
            let page = self.alloc(
                ctx,
                PageType::PagerState,
                alloc_flags::IGNORE_FREELIST | alloc_flags::DISABLE_STORE_STATE,
            )?;
            chain.push(page);
        }
        for page in chain.drain(needed..).collect::<Vec<_>>() {
            self.del(ctx, page.address(), 1)?;
        }

        let mut chunks = bytes.chunks(chunk_capacity);
        for (i, page) in chain.iter().enumerate() {
            let chunk = chunks.next().unwrap_or(&[]);
            let next = chain.get(i + 1).map(|p| p.address()).unwrap_or(0);
            let mut data = page.data_mut();
            let payload = &mut data[PAGE_HEADER_SIZE..];
            payload[..8].copy_from_slice(&next.to_le_bytes());
            payload[8..12].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
            payload[12..12 + chunk.len()].copy_from_slice(chunk);
            drop(data);
            page.set_dirty();
        }

        self.state_page = chain[0].address();
        self.runs_since_store = 0;
        debug!(state_page = self.state_page, "stored page-manager state");
        Ok(self.state_page)
    }

    /// Stores the state when forced or when the freelist has grown past
    /// the threshold. Returns the new state page if one was written.
    pub fn maybe_store_state(&mut self, ctx: &mut Context, force: bool) -> Result<Option<u64>> {
        if force || self.runs_since_store >= FREELIST_STORE_THRESHOLD {
            let previous = self.state_page;
            let address = self.store_state(ctx)?;
            return Ok((address != previous || force).then_some(address));
        }
        Ok(None)
    }

    /// Drops every cached page. Used by recovery after page images were
    /// restored straight through the device, bypassing the cache.
    pub fn invalidate_cache(&mut self) {
        self.cache.clear();
    }

    /// Flushes everything and drops the cache. The worker joins when the
    /// manager is dropped.
    pub fn close(&mut self) -> Result<()> {
        self.flush_all_pages()?;
        self.cache.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::device::{DiskDevice, MemoryDevice};

    fn disk_manager(dir: &tempfile::TempDir, config: EnvConfig) -> PageManager {
        let device = DiskDevice::create(
            &dir.path().join("pager.db"),
            config.page_size,
            config.file_size_limit_bytes,
            true,
        )
        .unwrap();
        PageManager::new(Arc::new(device), &config)
    }

    #[test]
    fn alloc_then_fetch_round_trips_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = disk_manager(&dir, EnvConfig::default());
        let mut ctx = Context::new(0, None);

        let page = pager.alloc(&mut ctx, PageType::BtreeLeaf, 0).unwrap();
        let address = page.address();
        page.data_mut()[100] = 0x77;
        drop(page);

        let again = pager.fetch(&mut ctx, address, 0).unwrap();
        assert_eq!(again.data()[100], 0x77);
        assert_eq!(again.page_type(), PageType::BtreeLeaf);
    }

    #[test]
    fn fetch_survives_cache_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let config = EnvConfig::default();
        let mut pager = disk_manager(&dir, config);
        let mut ctx = Context::new(0, None);

        let page = pager.alloc(&mut ctx, PageType::Blob, 0).unwrap();
        let address = page.address();
        page.data_mut()[500] = 0x33;
        page.set_dirty();
        drop(page);

        pager.flush_all_pages().unwrap();
        ctx.changeset.clear();
        // force the page out of the cache entirely
        pager.cache.remove(address);

        let mut ctx2 = Context::new(0, None);
        let back = pager.fetch(&mut ctx2, address, 0).unwrap();
        assert_eq!(back.data()[500], 0x33);
    }

    #[test]
    fn del_feeds_the_freelist_and_alloc_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = disk_manager(&dir, EnvConfig::default());
        let mut ctx = Context::new(0, None);

        let page = pager.alloc(&mut ctx, PageType::Blob, 0).unwrap();
        let address = page.address();
        ctx.changeset.clear();
        drop(page);

        pager.del(&mut ctx, address, 1).unwrap();
        assert_eq!(pager.freelist_pages(), 1);

        let reused = pager.alloc(&mut ctx, PageType::Blob, 0).unwrap();
        assert_eq!(reused.address(), address);
        assert_eq!(pager.freelist_pages(), 0);
    }

    #[test]
    fn blob_run_pages_are_consecutive_and_headerless() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = disk_manager(&dir, EnvConfig::default());
        let mut ctx = Context::new(0, None);

        let first = pager.alloc_multiple_blob_pages(&mut ctx, 3).unwrap();
        assert!(!first.no_header());
        assert_eq!(ctx.changeset.len(), 3);

        let second = ctx
            .changeset
            .get(first.address() + pager.page_size() as u64)
            .unwrap();
        assert!(second.no_header());
    }

    #[test]
    fn state_round_trips_through_pages() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = disk_manager(&dir, EnvConfig::default());
        let mut ctx = Context::new(0, None);

        // some freelist content and a blob pointer
        let a = pager.alloc(&mut ctx, PageType::Blob, 0).unwrap().address();
        let b = pager.alloc(&mut ctx, PageType::Blob, 0).unwrap().address();
        ctx.changeset.clear();
        pager.del(&mut ctx, a, 1).unwrap();
        pager.set_last_blob_page(b);

        let state_page = pager.store_state(&mut ctx).unwrap();
        pager.flush_all_pages().unwrap();

        let mut fresh = PageManager::new(Arc::clone(&pager.device), &EnvConfig::default());
        let mut ctx2 = Context::new(0, None);
        fresh.initialize(&mut ctx2, state_page).unwrap();

        assert_eq!(fresh.last_blob_page(), b);
        assert_eq!(fresh.freelist_pages(), 1);
    }

    #[test]
    fn strict_cache_fails_when_everything_is_pinned() {
        let config = EnvConfig::default()
            .cache_size(2 * crate::config::DEFAULT_PAGE_SIZE)
            .cache_strict(true);
        let device = MemoryDevice::new(config.page_size);
        let mut pager = PageManager::new(Arc::new(device), &config);
        let mut ctx = Context::new(0, None);

        // changeset pins every allocated page
        for _ in 0..3 {
            pager.alloc(&mut ctx, PageType::Blob, 0).unwrap();
        }
        let err = pager.purge_cache(&mut ctx).unwrap_err();
        assert_eq!(
            crate::error::kind_of(&err),
            Some(ErrorKind::LimitsReached)
        );
    }
}
