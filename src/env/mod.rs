//! # Environment
//!
//! An environment is one file holding any number of named databases,
//! plus the machinery they share: the page manager, the blob manager,
//! the journal and the transaction manager. The public handles
//! ([`Environment`], [`Database`], [`Transaction`], [`Cursor`]) are thin
//! clones over one shared core; a single environment-level mutex
//! serialises every entry point, so the engine is single-threaded per
//! environment from the caller's view (the page-flush worker is the one
//! exception and never takes this mutex).
//!
//! ## Header page
//!
//! Page 0 carries the environment header:
//!
//! ```text
//! { magic "STRA0001", version u32, serialno u32, page_size u32,
//!   max_databases u16, flags u32, pagemanager_blobid u64 }
//! ```
//!
//! followed by `max_databases` database descriptors
//! `{ dbname u16, key_type u8, record_type u8, key_size u16,
//!    record_size u32, flags u32, root_address u64 }` (dbname 0 = free
//! slot). The header page stays pinned for the environment's lifetime;
//! every descriptor change joins the current changeset like any other
//! page write.
//!
//! ## Durability model
//!
//! With transactions enabled, every mutation is journaled before it is
//! applied, and every applied mutation's dirty pages are written as a
//! journal changeset before they go to the data file. A clean
//! [`close`](Environment::close) truncates the journal; an environment
//! that is merely dropped models a crash, and the next
//! [`open`](Environment::open) recovers from the journal.
//!
//! Fatal errors (I/O, corruption) flip the environment to read-only;
//! further mutations fail with `ReadOnly` while the journal still holds
//! everything needed for crash recovery.

mod db;
mod recover;

pub use db::LocalDatabase;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::blob::BlobManager;
use crate::config::{
    env_flags, op_flags, DbConfig, EnvConfig, ENV_MAGIC, FORMAT_VERSION, MIN_PAGE_SIZE,
    PAGE_HEADER_SIZE, RECORD_SIZE_UNLIMITED,
};
use crate::cursor::CursorMove;
use crate::device::{Device, DiskDevice, MemoryDevice};
use crate::error::ErrorKind;
use crate::journal::Journal;
use crate::page::{Page, PageType};
use crate::pager::{Context, PageManager};
use crate::txn::{TxnId, TxnManager};

const ENV_FIXED_HEADER_SIZE: usize = 40;
const DB_DESCRIPTOR_SIZE: usize = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct EnvFixedHeader {
    magic: [u8; 8],
    version: U32,
    serialno: U32,
    page_size: U32,
    max_databases: U16,
    _pad: U16,
    flags: U32,
    _pad2: U32,
    pagemanager_blobid: U64,
}

impl EnvFixedHeader {
    le_accessors! {
        version: u32,
        serialno: u32,
        page_size: u32,
        max_databases: u16,
        flags: u32,
        pagemanager_blobid: u64,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct DbDescriptor {
    dbname: U16,
    key_type: u8,
    record_type: u8,
    key_size: U16,
    _pad: U16,
    record_size: U32,
    flags: U32,
    root_address: U64,
}

impl DbDescriptor {
    le_accessors! {
        dbname: u16,
        key_size: u16,
        record_size: u32,
        flags: u32,
        root_address: u64,
    }
}

const _: () = assert!(std::mem::size_of::<EnvFixedHeader>() == ENV_FIXED_HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<DbDescriptor>() == DB_DESCRIPTOR_SIZE);

/// Point-in-time counters exposed through [`Environment::metrics`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvMetrics {
    /// Bytes currently held by both journal files (0 after a clean
    /// close or a completed recovery).
    pub journal_bytes: u64,
    pub journal_bytes_flushed: u64,
    pub page_fetches: u64,
    pub page_allocs: u64,
    pub pages_flushed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub freelist_pages: u64,
    pub blobs_allocated: u64,
    pub btree_splits: u64,
    pub lsn: u64,
}

pub(crate) struct EnvInner {
    pub config: EnvConfig,
    pub pager: PageManager,
    pub blobs: BlobManager,
    pub journal: Option<Journal>,
    pub txns: TxnManager,
    pub dbs: HashMap<u16, LocalDatabase>,
    pub header_page: Arc<Page>,
    pub lsn: u64,
    pub read_only: bool,
    pub closed: bool,
}

impl EnvInner {
    pub fn next_lsn(&mut self) -> u64 {
        self.lsn += 1;
        self.lsn
    }

    pub fn check_writable(&self) -> Result<()> {
        ensure!(!self.closed, ErrorKind::InvalidArg);
        ensure!(!self.read_only, ErrorKind::ReadOnly);
        Ok(())
    }

    pub fn check_open(&self) -> Result<()> {
        ensure!(!self.closed, ErrorKind::InvalidArg);
        Ok(())
    }

    /// Marks the environment read-only after a fatal error.
    pub fn poison(&mut self, err: eyre::Report) -> eyre::Report {
        warn!(?err, "fatal error, environment turns read-only");
        self.read_only = true;
        err
    }

    pub fn transactions_enabled(&self) -> bool {
        self.config.has(env_flags::ENABLE_TRANSACTIONS)
    }

    /// Sanity-checks the header page contents against the format.
    pub(crate) fn verify_header(&self) -> Result<()> {
        let ok = self.with_fixed_header(|header| {
            header.magic == ENV_MAGIC && header.version() == FORMAT_VERSION
        });
        ensure!(ok, ErrorKind::IntegrityViolated);
        Ok(())
    }

    // ------------------------------------------------------------------
    // header page access
    // ------------------------------------------------------------------

    fn with_fixed_header<R>(&self, f: impl FnOnce(&EnvFixedHeader) -> R) -> R {
        let data = self.header_page.data();
        let header = EnvFixedHeader::ref_from_bytes(
            &data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + ENV_FIXED_HEADER_SIZE],
        )
        .expect("header page shorter than fixed header");
        f(header)
    }

    fn with_fixed_header_mut<R>(&self, f: impl FnOnce(&mut EnvFixedHeader) -> R) -> R {
        let mut data = self.header_page.data_mut();
        let header = EnvFixedHeader::mut_from_bytes(
            &mut data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + ENV_FIXED_HEADER_SIZE],
        )
        .expect("header page shorter than fixed header");
        let result = f(header);
        drop(data);
        self.header_page.set_dirty();
        result
    }

    fn descriptor_range(&self, slot: usize) -> std::ops::Range<usize> {
        let start = PAGE_HEADER_SIZE + ENV_FIXED_HEADER_SIZE + slot * DB_DESCRIPTOR_SIZE;
        start..start + DB_DESCRIPTOR_SIZE
    }

    fn read_descriptor(&self, slot: usize) -> DbDescriptor {
        let data = self.header_page.data();
        DbDescriptor::read_from_bytes(&data[self.descriptor_range(slot)])
            .expect("descriptor slot out of range")
    }

    fn write_descriptor(&self, slot: usize, descriptor: &DbDescriptor) {
        let range = self.descriptor_range(slot);
        let mut data = self.header_page.data_mut();
        data[range].copy_from_slice(descriptor.as_bytes());
        drop(data);
        self.header_page.set_dirty();
    }

    fn find_descriptor(&self, dbname: u16) -> Option<(usize, DbDescriptor)> {
        for slot in 0..self.config.max_databases as usize {
            let descriptor = self.read_descriptor(slot);
            if descriptor.dbname() == dbname {
                return Some((slot, descriptor));
            }
        }
        None
    }

    fn free_descriptor_slot(&self) -> Option<usize> {
        (0..self.config.max_databases as usize).find(|&slot| self.read_descriptor(slot).dbname() == 0)
    }

    /// Pushes a changed B-tree root (or other descriptor field) back
    /// into the header page.
    pub fn sync_db_descriptor(&mut self, ctx: &mut Context, dbname: u16) -> Result<()> {
        let root = match self.dbs.get(&dbname) {
            Some(db) => db.btree.root(),
            None => return Ok(()),
        };
        let Some((slot, mut descriptor)) = self.find_descriptor(dbname) else {
            bail!(ErrorKind::DatabaseNotFound);
        };
        if descriptor.root_address() != root {
            descriptor.set_root_address(root);
            self.write_descriptor(slot, &descriptor);
            ctx.changeset.put(Arc::clone(&self.header_page));
        }
        Ok(())
    }

    fn set_pagemanager_blobid(&mut self, ctx: &mut Context, blob_id: u64) {
        self.with_fixed_header_mut(|header| header.set_pagemanager_blobid(blob_id));
        ctx.changeset.put(Arc::clone(&self.header_page));
    }

    // ------------------------------------------------------------------
    // changeset flush
    // ------------------------------------------------------------------

    /// Makes the current mutation durable: one changeset entry with the
    /// dirty page images, then the pages themselves. This is the unit of
    /// atomic write; the changeset's LSN is the recovery watermark.
    pub fn flush_changeset(&mut self, ctx: &mut Context) -> Result<()> {
        if let Some(new_state) = self.pager.maybe_store_state(ctx, false)? {
            self.set_pagemanager_blobid(ctx, new_state);
        }

        let dirty = ctx.changeset.dirty_pages();
        if dirty.is_empty() {
            ctx.changeset.clear();
            return Ok(());
        }

        if let Some(journal) = self.journal.as_mut() {
            let lsn = self.lsn + 1;
            self.lsn = lsn;
            let idx = journal.append_changeset(&dirty, self.pager.last_blob_page(), lsn)?;
            journal.changeset_flushed(idx);
        }

        for page in &dirty {
            self.pager.flush_page_now(page)?;
        }
        ctx.changeset.clear();
        self.pager.purge_cache(ctx)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // transactions
    // ------------------------------------------------------------------

    pub fn begin_txn(&mut self, flags: u32) -> Result<TxnId> {
        self.check_writable()?;
        ensure!(self.transactions_enabled(), ErrorKind::InvalidArg);

        let begin_lsn = self.next_lsn();
        let id = self.txns.begin(flags, begin_lsn);
        let log_index = match self.journal.as_mut() {
            Some(journal) => journal.append_txn_begin(id, begin_lsn)?,
            None => 0,
        };
        if let Some(txn) = self.txns.txn_mut(id) {
            txn.log_index = log_index;
        }
        Ok(id)
    }

    /// Commits: journal the commit record, then replay the op list into
    /// the B-tree under one changeset.
    pub fn commit_txn(&mut self, id: TxnId) -> Result<()> {
        self.check_writable()?;
        let log_index = {
            let txn = self
                .txns
                .txn(id)
                .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))?;
            ensure!(txn.is_active(), ErrorKind::InvalidArg);
            txn.log_index
        };

        for database in self.dbs.values() {
            ensure!(
                !database.cursors.any_coupled_to_txn(&self.txns, id),
                ErrorKind::CursorStillOpen
            );
        }

        let commit_lsn = self.next_lsn();
        if let Some(journal) = self.journal.as_mut() {
            journal.append_txn_commit(log_index, id, commit_lsn)?;
        }
        self.txns.set_committed(id, commit_lsn);

        let ops = self.txns.take_ops(id);
        for database in self.dbs.values_mut() {
            database.cursors.uncouple_from_txn(&self.txns, id);
            database.ops.prune_txn(&self.txns, id);
        }

        let mut ctx = Context::new(0, Some(id));
        let result = self.apply_ops(&mut ctx, &ops);
        if let Err(err) = result {
            // the journal still holds the ops; recovery replays them
            return Err(self.poison(err));
        }

        if let Some(journal) = self.journal.as_mut() {
            journal.transaction_flushed(log_index);
        }
        self.txns.remove(id);

        if let Err(err) = self.flush_changeset(&mut ctx) {
            return Err(self.poison(err));
        }
        debug!(txn = id, commit_lsn, ops = ops.len(), "transaction committed");
        Ok(())
    }

    fn apply_ops(&mut self, ctx: &mut Context, ops: &[crate::txn::TxnOp]) -> Result<()> {
        use crate::txn::OpKind;

        for op in ops {
            ctx.dbname = op.dbname;
            match op.kind {
                OpKind::Nop => continue,
                OpKind::Erase => {
                    let dup = (op.duplicate_index != u32::MAX).then_some(op.duplicate_index);
                    self.apply_erase(ctx, op.dbname, &op.key, dup)?;
                }
                _ => {
                    self.apply_insert(
                        ctx,
                        op.dbname,
                        &op.key,
                        &op.record,
                        op.flags,
                        op.partial_offset,
                    )?;
                }
            }
        }
        Ok(())
    }

    pub fn abort_txn(&mut self, id: TxnId) -> Result<()> {
        self.check_open()?;
        let log_index = {
            let txn = self
                .txns
                .txn(id)
                .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))?;
            ensure!(txn.is_active(), ErrorKind::InvalidArg);
            txn.log_index
        };

        for database in self.dbs.values() {
            ensure!(
                !database.cursors.any_coupled_to_txn(&self.txns, id),
                ErrorKind::CursorStillOpen
            );
        }

        let lsn = self.next_lsn();
        if let Some(journal) = self.journal.as_mut() {
            journal.append_txn_abort(log_index, id, lsn)?;
        }
        self.txns.set_aborted(id);
        let _ = self.txns.take_ops(id);
        for database in self.dbs.values_mut() {
            database.cursors.nil_on_txn(&self.txns, id);
            database.ops.prune_txn(&self.txns, id);
        }
        self.txns.remove(id);
        debug!(txn = id, "transaction aborted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        if self.read_only {
            return Ok(());
        }
        let mut ctx = Context::new(0, None);
        if self.pager.state_page() != 0 || self.pager.freelist_pages() > 0 {
            let state = self.pager.store_state(&mut ctx)?;
            self.set_pagemanager_blobid(&mut ctx, state);
        }
        ctx.changeset.clear();
        self.pager.flush_all_pages()?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        // leaked user transactions abort implicitly
        for id in self.txns.active_ids() {
            let _ = self.abort_txn(id);
        }

        if !self.read_only {
            self.flush()?;
            if let Some(journal) = self.journal.as_mut() {
                journal.close()?;
            }
            self.pager.close()?;
            self.pager.device().flush()?;
        }
        self.pager.device().close()?;
        self.closed = true;
        info!("environment closed");
        Ok(())
    }

    pub fn metrics(&self) -> EnvMetrics {
        let pager = self.pager.metrics();
        let blobs = self.blobs.metrics();
        let splits = self
            .dbs
            .values()
            .map(|db| db.btree.stats().splits)
            .sum();
        EnvMetrics {
            journal_bytes: self.journal.as_ref().map(|j| j.total_bytes()).unwrap_or(0),
            journal_bytes_flushed: self
                .journal
                .as_ref()
                .map(|j| j.bytes_flushed_total())
                .unwrap_or(0),
            page_fetches: pager.fetches,
            page_allocs: pager.allocs,
            pages_flushed: pager.flushed_pages,
            cache_hits: pager.cache_hits,
            cache_misses: pager.cache_misses,
            freelist_pages: self.pager.freelist_pages(),
            blobs_allocated: blobs.allocated,
            btree_splits: splits,
            lsn: self.lsn,
        }
    }
}

pub(crate) struct EnvCore {
    pub inner: Mutex<EnvInner>,
}

/// Handle to one file environment. Cheap to clone; all clones share the
/// same core.
#[derive(Clone)]
pub struct Environment {
    core: Arc<EnvCore>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish_non_exhaustive()
    }
}

impl Environment {
    /// Creates a new environment. With `IN_MEMORY` the path is unused.
    pub fn create<P: AsRef<Path>>(path: P, config: EnvConfig) -> Result<Self> {
        Self::validate_config(&config)?;
        let path = path.as_ref();

        let device: Arc<dyn Device> = if config.has(env_flags::IN_MEMORY) {
            Arc::new(MemoryDevice::new(config.page_size))
        } else {
            Arc::new(DiskDevice::create(
                path,
                config.page_size,
                config.file_size_limit_bytes,
                !config.has(env_flags::DISABLE_MMAP),
            )?)
        };

        let mut pager = PageManager::new(Arc::clone(&device), &config);
        let mut ctx = Context::new(0, None);
        let header_page = pager.alloc(&mut ctx, PageType::Header, 0)?;
        ensure!(header_page.address() == 0, ErrorKind::Internal);
        {
            let mut data = header_page.data_mut();
            let header = EnvFixedHeader {
                magic: ENV_MAGIC,
                version: U32::new(FORMAT_VERSION),
                serialno: U32::new(0),
                page_size: U32::new(config.page_size as u32),
                max_databases: U16::new(config.max_databases),
                _pad: U16::new(0),
                flags: U32::new(config.flags),
                _pad2: U32::new(0),
                pagemanager_blobid: U64::new(0),
            };
            data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + ENV_FIXED_HEADER_SIZE]
                .copy_from_slice(header.as_bytes());
        }
        header_page.set_dirty();

        let journal = Self::journal_for(path, &config, true)?;
        ctx.changeset.clear();

        let mut inner = EnvInner {
            blobs: BlobManager::new(config.page_size),
            config,
            pager,
            journal,
            txns: TxnManager::new(),
            dbs: HashMap::new(),
            header_page,
            lsn: 0,
            read_only: false,
            closed: false,
        };
        if !inner.config.has(env_flags::IN_MEMORY) {
            inner.pager.flush_all_pages()?;
        }
        info!(?path, "environment created");
        Ok(Self {
            core: Arc::new(EnvCore {
                inner: Mutex::new(inner),
            }),
        })
    }

    /// Opens an existing environment, running journal recovery when the
    /// journal has content (unless `DISABLE_RECOVERY`).
    pub fn open<P: AsRef<Path>>(path: P, mut config: EnvConfig) -> Result<Self> {
        ensure!(
            !config.has(env_flags::IN_MEMORY),
            ErrorKind::InvalidArg
        );
        let path = path.as_ref();

        // the real page size lives in the header; peek at it first
        let (page_size, stored_flags, max_databases) = Self::peek_header(path)?;
        config.page_size = page_size;
        config.max_databases = max_databases;
        let read_only = config.has(env_flags::READ_ONLY);
        // transaction support is a property of the file
        if stored_flags & env_flags::ENABLE_TRANSACTIONS != 0 {
            config.flags |= env_flags::ENABLE_TRANSACTIONS;
        }

        let device: Arc<dyn Device> = Arc::new(DiskDevice::open(
            path,
            config.page_size,
            config.file_size_limit_bytes,
            !config.has(env_flags::DISABLE_MMAP),
            read_only,
        )?);

        let mut pager = PageManager::new(Arc::clone(&device), &config);
        let mut ctx = Context::new(0, None);
        let header_page = pager.fetch(&mut ctx, 0, crate::pager::fetch_flags::READ_ONLY)?;

        let journal = Self::journal_for(path, &config, false)?;

        let mut inner = EnvInner {
            blobs: BlobManager::new(config.page_size),
            config,
            pager,
            journal,
            txns: TxnManager::new(),
            dbs: HashMap::new(),
            header_page,
            lsn: 0,
            read_only,
            closed: false,
        };
        inner.verify_header()?;

        let needs_recovery = inner
            .journal
            .as_ref()
            .map(|j| !j.is_empty())
            .unwrap_or(false)
            && !inner.config.has(env_flags::DISABLE_RECOVERY);

        if needs_recovery {
            ensure!(!read_only, ErrorKind::ReadOnly);
            inner.recover()?;
        } else {
            let state = inner.with_fixed_header(|h| h.pagemanager_blobid());
            if state != 0 {
                let mut ctx = Context::new(0, None);
                inner.pager.initialize(&mut ctx, state)?;
            }
        }

        info!(?path, recovered = needs_recovery, "environment opened");
        Ok(Self {
            core: Arc::new(EnvCore {
                inner: Mutex::new(inner),
            }),
        })
    }

    fn validate_config(config: &EnvConfig) -> Result<()> {
        ensure!(
            config.page_size >= MIN_PAGE_SIZE && config.page_size % 1024 == 0,
            ErrorKind::InvalidArg
        );
        let descriptor_space = config.page_size - PAGE_HEADER_SIZE - ENV_FIXED_HEADER_SIZE;
        ensure!(
            config.max_databases as usize * DB_DESCRIPTOR_SIZE <= descriptor_space,
            ErrorKind::InvalidArg
        );
        ensure!(config.max_databases > 0, ErrorKind::InvalidArg);
        Ok(())
    }

    fn journal_for(path: &Path, config: &EnvConfig, create: bool) -> Result<Option<Journal>> {
        let wanted = config.has(env_flags::ENABLE_TRANSACTIONS)
            && !config.has(env_flags::IN_MEMORY)
            && !config.has(env_flags::READ_ONLY);
        if !wanted {
            return Ok(None);
        }
        let journal = if create {
            Journal::create(path, config)?
        } else {
            Journal::open(path, config)?
        };
        Ok(Some(journal))
    }

    /// Reads the fixed header straight off the file, before any pager
    /// exists (the page size is needed to build one).
    fn peek_header(path: &Path) -> Result<(usize, u32, u16)> {
        use std::io::Read;
        let mut file = std::fs::File::open(path)
            .wrap_err_with(|| format!("failed to open environment at {:?}", path))?;
        let mut prefix = [0u8; PAGE_HEADER_SIZE + ENV_FIXED_HEADER_SIZE];
        file.read_exact(&mut prefix).wrap_err(ErrorKind::IntegrityViolated)?;

        let header =
            EnvFixedHeader::ref_from_bytes(&prefix[PAGE_HEADER_SIZE..]).expect("sized read");
        ensure!(header.magic == ENV_MAGIC, ErrorKind::IntegrityViolated);
        ensure!(
            header.version() == FORMAT_VERSION,
            ErrorKind::IntegrityViolated
        );
        let page_size = header.page_size() as usize;
        ensure!(
            page_size >= MIN_PAGE_SIZE && page_size % 1024 == 0,
            ErrorKind::IntegrityViolated
        );
        Ok((page_size, header.flags(), header.max_databases()))
    }

    fn lock(&self) -> parking_lot::MutexGuard<'_, EnvInner> {
        self.core.inner.lock()
    }

    // ------------------------------------------------------------------
    // databases
    // ------------------------------------------------------------------

    pub fn create_db(&self, name: u16, cfg: DbConfig) -> Result<Database> {
        ensure!(name != 0, ErrorKind::InvalidArg);
        let mut inner = self.lock();
        inner.check_writable()?;
        ensure!(
            inner.find_descriptor(name).is_none(),
            ErrorKind::DatabaseExists
        );
        let slot = inner
            .free_descriptor_slot()
            .ok_or_else(|| eyre::Report::new(ErrorKind::LimitsReached))?;

        let mut ctx = Context::new(name, None);
        let database = LocalDatabase::create(&mut ctx, &mut inner.pager, name, cfg.clone())?;

        let descriptor = DbDescriptor {
            dbname: U16::new(name),
            key_type: cfg.key_type.to_byte(),
            record_type: u8::from(cfg.record_size != RECORD_SIZE_UNLIMITED),
            key_size: U16::new(cfg.key_size as u16),
            _pad: U16::new(0),
            record_size: U32::new(cfg.record_size),
            flags: U32::new(cfg.flags),
            root_address: U64::new(database.btree.root()),
        };
        inner.write_descriptor(slot, &descriptor);
        ctx.changeset.put(Arc::clone(&inner.header_page));
        inner.dbs.insert(name, database);

        if let Err(err) = inner.flush_changeset(&mut ctx) {
            return Err(inner.poison(err));
        }
        debug!(dbname = name, "database created");
        Ok(Database {
            core: Arc::clone(&self.core),
            name,
        })
    }

    pub fn open_db(&self, name: u16) -> Result<Database> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.open_db_inner(name)?;
        Ok(Database {
            core: Arc::clone(&self.core),
            name,
        })
    }

    pub fn erase_db(&self, name: u16) -> Result<()> {
        let mut inner = self.lock();
        inner.check_writable()?;
        inner.erase_db_inner(name)
    }

    /// Names of all databases in the environment.
    pub fn database_names(&self) -> Result<Vec<u16>> {
        let inner = self.lock();
        inner.check_open()?;
        let mut names = Vec::new();
        for slot in 0..inner.config.max_databases as usize {
            let descriptor = inner.read_descriptor(slot);
            if descriptor.dbname() != 0 {
                names.push(descriptor.dbname());
            }
        }
        Ok(names)
    }

    // ------------------------------------------------------------------
    // transactions, flush, metrics
    // ------------------------------------------------------------------

    pub fn begin_txn(&self, flags: u32) -> Result<Transaction> {
        let id = self.lock().begin_txn(flags)?;
        Ok(Transaction {
            core: Arc::clone(&self.core),
            id,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.lock().flush()
    }

    pub fn metrics(&self) -> EnvMetrics {
        self.lock().metrics()
    }

    /// Flushes everything and truncates the journal. Dropping the
    /// handle *without* closing models a crash.
    pub fn close(&self) -> Result<()> {
        self.lock().close()
    }
}

/// Handle to one named database.
#[derive(Clone)]
pub struct Database {
    core: Arc<EnvCore>,
    name: u16,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Database {
    pub fn name(&self) -> u16 {
        self.name
    }

    fn lock(&self) -> parking_lot::MutexGuard<'_, EnvInner> {
        self.core.inner.lock()
    }

    /// Inserts `key` → `record`. Record-number databases accept an
    /// empty key and assign the next sequence number.
    pub fn insert(&self, txn: Option<&Transaction>, key: &[u8], record: &[u8], flags: u32) -> Result<()> {
        self.lock()
            .db_insert(self.name, txn.map(|t| t.id), key, record, flags, 0, 0)
    }

    /// Writes `partial` into the record at `offset`, extending it as
    /// needed (`PARTIAL` semantics).
    pub fn insert_partial(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        partial: &[u8],
        offset: u32,
        flags: u32,
    ) -> Result<()> {
        self.lock().db_insert(
            self.name,
            txn.map(|t| t.id),
            key,
            partial,
            flags | op_flags::PARTIAL | op_flags::OVERWRITE,
            partial.len() as u32,
            offset,
        )
    }

    pub fn find(&self, txn: Option<&Transaction>, key: &[u8], flags: u32) -> Result<Option<Vec<u8>>> {
        self.lock()
            .db_find(self.name, txn.map(|t| t.id), key, flags)
    }

    pub fn erase(&self, txn: Option<&Transaction>, key: &[u8], flags: u32) -> Result<()> {
        self.lock()
            .db_erase(self.name, txn.map(|t| t.id), key, flags)
    }

    /// Number of keys (or records, without `distinct`) in the database.
    pub fn count(&self, txn: Option<&Transaction>, distinct: bool) -> Result<u64> {
        self.lock()
            .db_count(self.name, txn.map(|t| t.id), distinct)
    }

    pub fn cursor(&self, txn: Option<&Transaction>) -> Result<Cursor> {
        let id = self
            .lock()
            .cursor_create(self.name, txn.map(|t| t.id))?;
        Ok(Cursor {
            core: Arc::clone(&self.core),
            db: self.name,
            id,
        })
    }

    /// Flushes and evicts this database's pages.
    pub fn close(&self) -> Result<()> {
        self.lock().close_db_inner(self.name)
    }
}

/// Handle to one transaction. Committing or aborting consumes the
/// handle; dropping it leaves the transaction pending (it aborts when
/// the environment closes, or through recovery after a crash).
pub struct Transaction {
    core: Arc<EnvCore>,
    id: TxnId,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish()
    }
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn commit(self) -> Result<()> {
        self.core.inner.lock().commit_txn(self.id)
    }

    pub fn abort(self) -> Result<()> {
        self.core.inner.lock().abort_txn(self.id)
    }
}

/// Handle to one cursor. Closed on drop.
pub struct Cursor {
    core: Arc<EnvCore>,
    db: u16,
    id: u64,
}

impl Cursor {
    fn lock(&self) -> parking_lot::MutexGuard<'_, EnvInner> {
        self.core.inner.lock()
    }

    /// Positions the cursor on `key` (honoring approximate-match flags)
    /// and returns the key/record pair found.
    pub fn find(&self, key: &[u8], flags: u32) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.lock().cursor_find(self.db, self.id, key, flags)
    }

    pub fn move_to(&self, mov: CursorMove, skip_duplicates: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.lock()
            .cursor_move(self.db, self.id, mov, skip_duplicates)
    }

    pub fn first(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.move_to(CursorMove::First, false)
    }

    pub fn last(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.move_to(CursorMove::Last, false)
    }

    pub fn next(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.move_to(CursorMove::Next, false)
    }

    pub fn previous(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.move_to(CursorMove::Previous, false)
    }

    pub fn get_key(&self) -> Result<Option<Vec<u8>>> {
        self.lock().cursor_key(self.db, self.id)
    }

    pub fn get_record(&self) -> Result<Option<Vec<u8>>> {
        self.lock().cursor_record(self.db, self.id)
    }

    /// Replaces the record under the cursor without moving it.
    pub fn overwrite(&self, record: &[u8]) -> Result<()> {
        self.lock().cursor_overwrite(self.db, self.id, record)
    }

    /// Erases the record (or current duplicate) under the cursor; the
    /// cursor becomes nil.
    pub fn erase(&self) -> Result<()> {
        self.lock().cursor_erase(self.db, self.id)
    }

    pub fn duplicate_count(&self) -> Result<u32> {
        self.lock().cursor_dup_count(self.db, self.id)
    }

    pub fn duplicate_position(&self) -> Result<u32> {
        self.lock().cursor_dup_position(self.db, self.id)
    }

    /// Clones the cursor; the clone starts in the same state and moves
    /// independently.
    pub fn clone_cursor(&self) -> Result<Cursor> {
        let id = self.lock().cursor_clone(self.db, self.id)?;
        Ok(Cursor {
            core: Arc::clone(&self.core),
            db: self.db,
            id,
        })
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let mut inner = self.core.inner.lock();
        if let Some(database) = inner.dbs.get_mut(&self.db) {
            database.cursors.close(self.id);
        }
    }
}

const _: fn() = || {
    fn assert_send<T: Send>() {}
    assert_send::<Environment>();
    assert_send::<Database>();
    assert_send::<Transaction>();
};
