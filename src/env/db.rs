//! # Database Operations
//!
//! One [`LocalDatabase`] per open database: the B-tree index, the
//! open-cursor registry and the per-key op index travel together because
//! every mutation touches all three. The environment's inner state owns
//! the map of open databases; the methods here orchestrate a single
//! operation across the journal, the transaction manager, the B-tree and
//! the cursor registry, in that order:
//!
//! 1. validate + conflict check (nothing journaled for a refused op)
//! 2. journal the per-op entry
//! 3. record the pending op (transactional) or apply to the B-tree and
//!    flush the changeset (auto-commit)
//!
//! Operations without an explicit transaction run as temporary
//! auto-commit transactions when transactions are enabled, and apply
//! directly (without journaling) when they are not.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use tracing::debug;

use crate::btree::{BtreeIndex, ScanVisitor};
use crate::config::{db_flags, op_flags, DbConfig, KeyType};
use crate::cursor::{self, CursorMove, CursorRegistry, CursorState};
use crate::error::{is_kind, kind_of, ErrorKind};
use crate::pager::{Context, PageManager};
use crate::txn::{OpIndex, OpKind, TxnId, Visibility};

use super::EnvInner;

const DUP_NONE: u32 = u32::MAX;

/// Everything one open database carries.
pub struct LocalDatabase {
    pub name: u16,
    pub cfg: DbConfig,
    pub btree: BtreeIndex,
    pub cursors: CursorRegistry,
    pub ops: OpIndex,
    /// Highest assigned key of a record-number database.
    pub recno_sequence: u64,
}

impl LocalDatabase {
    pub fn create(
        ctx: &mut Context,
        pager: &mut PageManager,
        name: u16,
        cfg: DbConfig,
    ) -> Result<Self> {
        let btree = BtreeIndex::create(ctx, pager, name, cfg.clone(), pager.page_size())?;
        Ok(Self {
            name,
            ops: OpIndex::new(cfg.key_type),
            cursors: CursorRegistry::new(),
            recno_sequence: 0,
            cfg,
            btree,
        })
    }
}

impl EnvInner {
    fn db(&self, dbname: u16) -> Result<&LocalDatabase> {
        self.dbs
            .get(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))
    }

    /// Poisons the environment for fatal error kinds, passes user
    /// errors through untouched.
    fn maybe_poison(&mut self, err: eyre::Report) -> eyre::Report {
        match kind_of(&err) {
            Some(ErrorKind::Io) | Some(ErrorKind::IntegrityViolated) | Some(ErrorKind::Internal) => {
                self.poison(err)
            }
            _ => err,
        }
    }

    pub(super) fn open_db_inner(&mut self, dbname: u16) -> Result<()> {
        if self.dbs.contains_key(&dbname) {
            return Ok(());
        }
        let Some((_slot, descriptor)) = self.find_descriptor(dbname) else {
            bail!(ErrorKind::DatabaseNotFound);
        };

        let key_type = KeyType::from_byte(descriptor.key_type)
            .ok_or_else(|| eyre::Report::new(ErrorKind::IntegrityViolated))?;
        let cfg = DbConfig {
            key_type,
            key_size: descriptor.key_size() as u32,
            record_size: descriptor.record_size(),
            flags: descriptor.flags(),
        };

        let btree = BtreeIndex::open(
            dbname,
            cfg.clone(),
            descriptor.root_address(),
            self.pager.page_size(),
        )?;
        let mut database = LocalDatabase {
            name: dbname,
            ops: OpIndex::new(cfg.key_type),
            cursors: CursorRegistry::new(),
            recno_sequence: 0,
            cfg,
            btree,
        };

        if database.cfg.is_record_number() {
            let mut ctx = Context::new(dbname, None);
            if let Some((page, slot)) =
                database.btree.last_slot(&mut ctx, &mut self.pager)?
            {
                let key =
                    database
                        .btree
                        .key_at(&mut ctx, &mut self.pager, &mut self.blobs, &page, slot)?;
                database.recno_sequence = decode_recno(&key);
            }
        }

        self.dbs.insert(dbname, database);
        debug!(dbname, "database opened");
        Ok(())
    }

    pub(super) fn erase_db_inner(&mut self, dbname: u16) -> Result<()> {
        self.open_db_inner(dbname)?;
        ensure!(
            !self.txns.has_active(),
            ErrorKind::TxnConflict
        );

        let mut ctx = Context::new(dbname, None);
        {
            let EnvInner {
                dbs, pager, blobs, ..
            } = self;
            let database = dbs.get_mut(&dbname).expect("opened above");
            let LocalDatabase { btree, cursors, .. } = database;
            btree.drop_tree(&mut ctx, pager, blobs, cursors)?;
        }
        self.dbs.remove(&dbname);

        let (slot, mut descriptor) = self
            .find_descriptor(dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        descriptor.set_dbname(0);
        descriptor.set_root_address(0);
        self.write_descriptor(slot, &descriptor);
        ctx.changeset.put(Arc::clone(&self.header_page));

        self.flush_changeset(&mut ctx)
            .map_err(|err| self.maybe_poison(err))?;
        debug!(dbname, "database erased");
        Ok(())
    }

    pub(super) fn close_db_inner(&mut self, dbname: u16) -> Result<()> {
        if self.dbs.remove(&dbname).is_some() {
            let mut ctx = Context::new(dbname, None);
            self.pager.close_database(&mut ctx, dbname)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // insert
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub(super) fn db_insert(
        &mut self,
        dbname: u16,
        txn: Option<TxnId>,
        key: &[u8],
        record: &[u8],
        mut flags: u32,
        partial_size: u32,
        partial_offset: u32,
    ) -> Result<()> {
        self.check_writable()?;
        let key = self.prepare_insert_key(dbname, key, &mut flags)?;
        self.check_txn_usable(txn)?;
        let txns_enabled = self.transactions_enabled();

        // validation and conflict detection before anything reaches the
        // journal
        {
            let EnvInner {
                dbs,
                pager,
                blobs,
                txns,
                ..
            } = self;
            let database = dbs
                .get_mut(&dbname)
                .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
            database.btree.validate_key(&key)?;
            if flags & duplicate_flags() != 0 {
                ensure!(
                    database.cfg.has(db_flags::ENABLE_DUPLICATE_KEYS),
                    ErrorKind::InvalidArg
                );
            }
            if txns_enabled {
                database.ops.conflict_check(txns, &key, txn)?;
            }
            if flags & (op_flags::OVERWRITE | duplicate_flags()) == 0 {
                let mut ctx = Context::new(dbname, txn);
                let exists = match database.ops.visibility(txns, &key, txn) {
                    Visibility::Inserted(_) => true,
                    Visibility::Erased(_) => false,
                    Visibility::Unchanged => {
                        let LocalDatabase { btree, .. } = database;
                        btree.find(&mut ctx, pager, blobs, &key, 0)?.is_some()
                    }
                };
                ensure!(!exists, ErrorKind::DuplicateKey);
            }
        }

        if !self.transactions_enabled() {
            let mut ctx = Context::new(dbname, None);
            self.apply_insert(&mut ctx, dbname, &key, record, flags, partial_offset)
                .map_err(|err| self.maybe_poison(err))?;
            ctx.changeset.clear();
            self.pager.purge_cache(&mut ctx)?;
            return Ok(());
        }

        let lsn = self.next_lsn();
        match txn {
            Some(txn_id) => {
                let log_index = self.txns.txn(txn_id).map(|t| t.log_index).unwrap_or(0);
                if let Some(journal) = self.journal.as_mut() {
                    journal.append_insert(
                        dbname,
                        Some((txn_id, log_index)),
                        &key,
                        record,
                        flags,
                        partial_size,
                        partial_offset,
                        lsn,
                    )?;
                }
                let kind = insert_kind(flags);
                let op_id = self.txns.record_op(
                    txn_id,
                    dbname,
                    kind,
                    key.clone(),
                    record.to_vec(),
                    flags,
                    0,
                    (partial_size, partial_offset),
                    lsn,
                );
                let EnvInner { dbs, txns, .. } = self;
                let database = dbs.get_mut(&dbname).expect("checked above");
                database.ops.append(txns, &key, op_id);
                Ok(())
            }
            None => {
                if let Some(journal) = self.journal.as_mut() {
                    journal.append_insert(
                        dbname,
                        None,
                        &key,
                        record,
                        flags,
                        partial_size,
                        partial_offset,
                        lsn,
                    )?;
                }
                let mut ctx = Context::new(dbname, None);
                self.apply_insert(&mut ctx, dbname, &key, record, flags, partial_offset)
                    .map_err(|err| self.maybe_poison(err))?;
                self.flush_changeset(&mut ctx)
                    .map_err(|err| self.maybe_poison(err))
            }
        }
    }

    /// Applies an insert to the B-tree (used by auto-commit, commit
    /// flush and recovery replay).
    pub(super) fn apply_insert(
        &mut self,
        ctx: &mut Context,
        dbname: u16,
        key: &[u8],
        record: &[u8],
        flags: u32,
        partial_offset: u32,
    ) -> Result<()> {
        let composed;
        let record = if flags & op_flags::PARTIAL != 0 {
            composed = self.compose_partial(ctx, dbname, key, record, partial_offset)?;
            composed.as_slice()
        } else {
            record
        };

        {
            let EnvInner {
                dbs, pager, blobs, ..
            } = self;
            let database = dbs
                .get_mut(&dbname)
                .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
            let LocalDatabase { btree, cursors, .. } = database;
            btree.insert(ctx, pager, blobs, cursors, key, record, flags, None)?;
        }
        self.sync_db_descriptor(ctx, dbname)
    }

    /// `PARTIAL` writes splice the new slice into the existing record
    /// (zero-filled when the record is shorter than the slice offset).
    fn compose_partial(
        &mut self,
        ctx: &mut Context,
        dbname: u16,
        key: &[u8],
        partial: &[u8],
        offset: u32,
    ) -> Result<Vec<u8>> {
        let EnvInner {
            dbs, pager, blobs, ..
        } = self;
        let database = dbs
            .get_mut(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        let LocalDatabase { btree, .. } = database;

        let mut base = match btree.find(ctx, pager, blobs, key, 0)? {
            Some((page, slot)) => btree.record_at(ctx, pager, blobs, &page, slot, 0)?,
            None => Vec::new(),
        };
        let end = offset as usize + partial.len();
        if base.len() < end {
            base.resize(end, 0);
        }
        base[offset as usize..end].copy_from_slice(partial);
        Ok(base)
    }

    fn prepare_insert_key(
        &mut self,
        dbname: u16,
        key: &[u8],
        flags: &mut u32,
    ) -> Result<Vec<u8>> {
        let database = self
            .dbs
            .get_mut(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        if !database.cfg.is_record_number() {
            return Ok(key.to_vec());
        }

        let is_32 = database.cfg.has(db_flags::RECORD_NUMBER32);
        if key.is_empty() {
            database.recno_sequence += 1;
            *flags |= op_flags::HINT_APPEND;
            let next = database.recno_sequence;
            Ok(if is_32 {
                (next as u32).to_le_bytes().to_vec()
            } else {
                next.to_le_bytes().to_vec()
            })
        } else {
            // replay and explicit-recno inserts carry the key
            let value = decode_recno(key);
            ensure!(value != 0, ErrorKind::InvalidKeySize);
            database.recno_sequence = database.recno_sequence.max(value);
            Ok(key.to_vec())
        }
    }

    fn check_txn_usable(&self, txn: Option<TxnId>) -> Result<()> {
        if let Some(id) = txn {
            ensure!(self.transactions_enabled(), ErrorKind::InvalidArg);
            let active = self.txns.txn(id).map(|t| t.is_active()).unwrap_or(false);
            ensure!(active, ErrorKind::InvalidArg);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // find
    // ------------------------------------------------------------------

    pub(super) fn db_find(
        &mut self,
        dbname: u16,
        txn: Option<TxnId>,
        key: &[u8],
        flags: u32,
    ) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        self.check_txn_usable(txn)?;
        let EnvInner {
            dbs,
            pager,
            blobs,
            txns,
            ..
        } = self;
        let database = dbs
            .get_mut(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        let LocalDatabase {
            btree,
            cursors,
            ops,
            ..
        } = database;
        let mut ctx = Context::new(dbname, txn);

        if flags & op_flags::FIND_NEAR_MATCH != 0 {
            // approximate lookups reuse the cursor seek logic
            let id = cursors.create(txn);
            let result = cursor::cursor_find(
                &mut ctx, pager, blobs, btree, ops, txns, cursors, id, key, flags,
            );
            cursors.close(id);
            return result.map(|found| found.map(|(_key, record)| record));
        }

        match ops.visibility(txns, key, txn) {
            Visibility::Inserted(op_id) => {
                Ok(txns.op(op_id).map(|op| op.record.clone()))
            }
            Visibility::Erased(_) => Ok(None),
            Visibility::Unchanged => match btree.find(&mut ctx, pager, blobs, key, 0)? {
                Some((page, slot)) => {
                    Ok(Some(btree.record_at(&mut ctx, pager, blobs, &page, slot, 0)?))
                }
                None => Ok(None),
            },
        }
    }

    // ------------------------------------------------------------------
    // erase
    // ------------------------------------------------------------------

    pub(super) fn db_erase(
        &mut self,
        dbname: u16,
        txn: Option<TxnId>,
        key: &[u8],
        flags: u32,
    ) -> Result<()> {
        self.check_writable()?;
        self.check_txn_usable(txn)?;
        let key = key.to_vec();
        let txns_enabled = self.transactions_enabled();

        // conflict and existence checks up front
        {
            let EnvInner {
                dbs,
                pager,
                blobs,
                txns,
                ..
            } = self;
            let database = dbs
                .get_mut(&dbname)
                .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
            database.btree.validate_key(&key)?;
            if txns_enabled {
                database.ops.conflict_check(txns, &key, txn)?;
            }
            let mut ctx = Context::new(dbname, txn);
            let exists = match database.ops.visibility(txns, &key, txn) {
                Visibility::Inserted(_) => true,
                Visibility::Erased(_) => false,
                Visibility::Unchanged => {
                    let LocalDatabase { btree, .. } = database;
                    btree.find(&mut ctx, pager, blobs, &key, 0)?.is_some()
                }
            };
            ensure!(exists, ErrorKind::KeyNotFound);
        }

        if !self.transactions_enabled() {
            let mut ctx = Context::new(dbname, None);
            self.apply_erase(&mut ctx, dbname, &key, None)
                .map_err(|err| self.maybe_poison(err))?;
            ctx.changeset.clear();
            self.pager.purge_cache(&mut ctx)?;
            return Ok(());
        }

        let lsn = self.next_lsn();
        match txn {
            Some(txn_id) => {
                let log_index = self.txns.txn(txn_id).map(|t| t.log_index).unwrap_or(0);
                if let Some(journal) = self.journal.as_mut() {
                    journal.append_erase(dbname, Some((txn_id, log_index)), &key, 0, flags, lsn)?;
                }
                let op_id = self.txns.record_op(
                    txn_id,
                    dbname,
                    OpKind::Erase,
                    key.clone(),
                    Vec::new(),
                    flags,
                    DUP_NONE,
                    (0, 0),
                    lsn,
                );
                let EnvInner { dbs, txns, .. } = self;
                let database = dbs.get_mut(&dbname).expect("checked above");
                database.ops.append(txns, &key, op_id);
                Ok(())
            }
            None => {
                if let Some(journal) = self.journal.as_mut() {
                    journal.append_erase(dbname, None, &key, 0, flags, lsn)?;
                }
                let mut ctx = Context::new(dbname, None);
                self.apply_erase(&mut ctx, dbname, &key, None)
                    .map_err(|err| self.maybe_poison(err))?;
                self.flush_changeset(&mut ctx)
                    .map_err(|err| self.maybe_poison(err))
            }
        }
    }

    /// Applies an erase to the B-tree (auto-commit, commit flush,
    /// recovery replay).
    pub(super) fn apply_erase(
        &mut self,
        ctx: &mut Context,
        dbname: u16,
        key: &[u8],
        dup: Option<u32>,
    ) -> Result<()> {
        {
            let EnvInner {
                dbs, pager, blobs, ..
            } = self;
            let database = dbs
                .get_mut(&dbname)
                .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
            let LocalDatabase { btree, cursors, .. } = database;
            btree.erase(ctx, pager, blobs, cursors, key, dup)?;
        }
        self.sync_db_descriptor(ctx, dbname)
    }

    // ------------------------------------------------------------------
    // count
    // ------------------------------------------------------------------

    pub(super) fn db_count(
        &mut self,
        dbname: u16,
        txn: Option<TxnId>,
        distinct: bool,
    ) -> Result<u64> {
        self.check_open()?;
        self.check_txn_usable(txn)?;

        struct Counter {
            total: u64,
        }
        impl ScanVisitor for Counter {
            fn visit_key(&mut self, _key: &[u8], dup_count: u64) {
                self.total += dup_count;
            }
            fn visit_array(&mut self, _packed: &[u8], _key_size: usize, count: usize) {
                self.total += count as u64;
            }
        }

        let EnvInner {
            dbs,
            pager,
            blobs,
            txns,
            ..
        } = self;
        let database = dbs
            .get_mut(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        let LocalDatabase { btree, ops, .. } = database;

        let mut ctx = Context::new(dbname, txn);
        let mut counter = Counter { total: 0 };
        btree.scan(&mut ctx, pager, blobs, &mut counter, distinct)?;
        let mut total = counter.total;

        // fold the transaction's pending view on top of the tree
        if txn.is_some() {
            let mut cursor_key: Option<Vec<u8>> = None;
            while let Some((key, visible)) =
                ops.next_visible(txns, txn, cursor_key.as_deref())
            {
                let in_tree = btree.find(&mut ctx, pager, blobs, &key, 0)?.is_some();
                match visible {
                    Visibility::Inserted(_) if !in_tree => total += 1,
                    Visibility::Erased(_) if in_tree => total = total.saturating_sub(1),
                    _ => {}
                }
                cursor_key = Some(key);
            }
        }
        Ok(total)
    }

    // ------------------------------------------------------------------
    // cursors
    // ------------------------------------------------------------------

    pub(super) fn cursor_create(&mut self, dbname: u16, txn: Option<TxnId>) -> Result<u64> {
        self.check_open()?;
        self.check_txn_usable(txn)?;
        let database = self
            .dbs
            .get_mut(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        Ok(database.cursors.create(txn))
    }

    pub(super) fn cursor_clone(&mut self, dbname: u16, id: u64) -> Result<u64> {
        self.check_open()?;
        let database = self
            .dbs
            .get_mut(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        database
            .cursors
            .clone_cursor(id)
            .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))
    }

    pub(super) fn cursor_find(
        &mut self,
        dbname: u16,
        id: u64,
        key: &[u8],
        flags: u32,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check_open()?;
        let EnvInner {
            dbs,
            pager,
            blobs,
            txns,
            ..
        } = self;
        let database = dbs
            .get_mut(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        let LocalDatabase {
            btree,
            cursors,
            ops,
            ..
        } = database;
        let mut ctx = Context::new(dbname, cursors.get(id).and_then(|c| c.txn));
        cursor::cursor_find(&mut ctx, pager, blobs, btree, ops, txns, cursors, id, key, flags)
    }

    pub(super) fn cursor_move(
        &mut self,
        dbname: u16,
        id: u64,
        mov: CursorMove,
        skip_duplicates: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check_open()?;
        let EnvInner {
            dbs,
            pager,
            blobs,
            txns,
            ..
        } = self;
        let database = dbs
            .get_mut(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        let LocalDatabase {
            btree,
            cursors,
            ops,
            ..
        } = database;
        let mut ctx = Context::new(dbname, cursors.get(id).and_then(|c| c.txn));
        cursor::cursor_move(
            &mut ctx,
            pager,
            blobs,
            btree,
            ops,
            txns,
            cursors,
            id,
            mov,
            skip_duplicates,
        )
    }

    pub(super) fn cursor_key(&mut self, dbname: u16, id: u64) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let EnvInner {
            dbs,
            pager,
            blobs,
            txns,
            ..
        } = self;
        let database = dbs
            .get_mut(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        let LocalDatabase {
            btree, cursors, ..
        } = database;
        let mut ctx = Context::new(dbname, None);
        cursor::current_key(&mut ctx, pager, blobs, btree, txns, cursors, id)
    }

    pub(super) fn cursor_record(&mut self, dbname: u16, id: u64) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        self.recouple_if_needed(dbname, id)?;
        let EnvInner {
            dbs,
            pager,
            blobs,
            txns,
            ..
        } = self;
        let database = dbs
            .get_mut(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        let LocalDatabase {
            btree, cursors, ..
        } = database;
        let mut ctx = Context::new(dbname, None);
        cursor::current_record(&mut ctx, pager, blobs, btree, txns, cursors, id)
    }

    /// Lazily re-seeks an uncoupled cursor back onto its key.
    fn recouple_if_needed(&mut self, dbname: u16, id: u64) -> Result<()> {
        let key = {
            let database = self.db(dbname)?;
            match database.cursors.get(id).map(|c| &c.state) {
                Some(CursorState::Uncoupled { key, .. }) => key.clone(),
                _ => return Ok(()),
            }
        };
        self.cursor_find(dbname, id, &key, 0)?;
        Ok(())
    }

    pub(super) fn cursor_overwrite(&mut self, dbname: u16, id: u64, record: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.recouple_if_needed(dbname, id)?;

        let (txn, state) = {
            let database = self.db(dbname)?;
            let cursor = database
                .cursors
                .get(id)
                .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))?;
            ensure!(
                !matches!(cursor.state, CursorState::Nil),
                ErrorKind::InvalidArg
            );
            (cursor.txn, cursor.state.clone())
        };

        let key = self
            .cursor_key_of_state(dbname, &state)?
            .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))?;

        if self.transactions_enabled() {
            if let Some(txn_id) = txn {
                return self.db_insert(
                    dbname,
                    Some(txn_id),
                    &key,
                    record,
                    op_flags::OVERWRITE,
                    0,
                    0,
                );
            }
        }

        // no transaction: overwrite in place through the coupling
        if self.transactions_enabled() {
            let lsn = self.next_lsn();
            if let Some(journal) = self.journal.as_mut() {
                journal.append_insert(
                    dbname,
                    None,
                    &key,
                    record,
                    op_flags::OVERWRITE,
                    0,
                    0,
                    lsn,
                )?;
            }
        }
        let mut ctx = Context::new(dbname, None);
        {
            let EnvInner {
                dbs, pager, blobs, ..
            } = self;
            let database = dbs.get_mut(&dbname).expect("checked above");
            let LocalDatabase {
                btree, cursors, ..
            } = database;
            match &state {
                CursorState::Btree(coupling) => {
                    btree.overwrite_record(
                        &mut ctx,
                        pager,
                        blobs,
                        &coupling.page,
                        coupling.slot as usize,
                        coupling.dup,
                        record,
                    )?;
                }
                _ => {
                    btree.insert(
                        &mut ctx,
                        pager,
                        blobs,
                        cursors,
                        &key,
                        record,
                        op_flags::OVERWRITE,
                        None,
                    )?;
                }
            }
        }
        self.sync_db_descriptor(&mut ctx, dbname)?;
        if self.transactions_enabled() {
            self.flush_changeset(&mut ctx)
                .map_err(|err| self.maybe_poison(err))?;
        } else {
            ctx.changeset.clear();
            self.pager.purge_cache(&mut ctx)?;
        }
        Ok(())
    }

    pub(super) fn cursor_erase(&mut self, dbname: u16, id: u64) -> Result<()> {
        self.check_writable()?;
        self.recouple_if_needed(dbname, id)?;

        let (txn, state) = {
            let database = self.db(dbname)?;
            let cursor = database
                .cursors
                .get(id)
                .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))?;
            ensure!(
                !matches!(cursor.state, CursorState::Nil),
                ErrorKind::InvalidArg
            );
            (cursor.txn, cursor.state.clone())
        };
        let key = self
            .cursor_key_of_state(dbname, &state)?
            .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))?;

        if let Some(txn_id) = txn {
            // transactional: append an erase op and nil every cursor of
            // this database standing on the erased key
            {
                let database = self.db(dbname)?;
                database.ops.conflict_check(&self.txns, &key, txn)?;
            }
            let dup = match &state {
                CursorState::Btree(coupling) => coupling.dup,
                _ => 0,
            };
            let lsn = self.next_lsn();
            let log_index = self.txns.txn(txn_id).map(|t| t.log_index).unwrap_or(0);
            if let Some(journal) = self.journal.as_mut() {
                journal.append_erase(dbname, Some((txn_id, log_index)), &key, dup, 0, lsn)?;
            }
            let dup_recorded = match &state {
                CursorState::Btree(coupling)
                    if self
                        .db(dbname)?
                        .cfg
                        .has(db_flags::ENABLE_DUPLICATE_KEYS) =>
                {
                    coupling.dup
                }
                _ => DUP_NONE,
            };
            let op_id = self.txns.record_op(
                txn_id,
                dbname,
                OpKind::Erase,
                key.clone(),
                Vec::new(),
                0,
                dup_recorded,
                (0, 0),
                lsn,
            );
            let EnvInner { dbs, txns, .. } = self;
            let database = dbs.get_mut(&dbname).expect("checked above");
            database.ops.append(txns, &key, op_id);
            self.nil_cursors_on_key(dbname, &key)?;
            return Ok(());
        }

        // auto-commit: journal, erase through the coupling, changeset
        if self.transactions_enabled() {
            let lsn = self.next_lsn();
            if let Some(journal) = self.journal.as_mut() {
                journal.append_erase(dbname, None, &key, 0, 0, lsn)?;
            }
        }

        let mut ctx = Context::new(dbname, None);
        let erase_result = {
            let EnvInner {
                dbs, pager, blobs, ..
            } = self;
            let database = dbs.get_mut(&dbname).expect("checked above");
            let LocalDatabase {
                btree, cursors, ..
            } = database;
            match &state {
                CursorState::Btree(coupling) => {
                    let dup = cursor::erase_dup_index(btree, coupling);
                    btree.erase_slot(
                        &mut ctx,
                        pager,
                        blobs,
                        cursors,
                        &coupling.page,
                        coupling.slot as usize,
                        dup,
                    )
                }
                _ => btree.erase(&mut ctx, pager, blobs, cursors, &key, None),
            }
        };

        if let Err(err) = erase_result {
            if is_kind(&err, ErrorKind::LimitsReached) {
                // non-delete-stable layout: uncouple and take the keyed
                // path, which splits the page and retries
                {
                    let EnvInner {
                        dbs, pager, blobs, ..
                    } = self;
                    let database = dbs.get_mut(&dbname).expect("checked above");
                    let LocalDatabase {
                        btree, cursors, ..
                    } = database;
                    cursor::uncouple(&mut ctx, pager, blobs, btree, cursors, id)?;
                    btree.erase(&mut ctx, pager, blobs, cursors, &key, None)?;
                }
            } else {
                return Err(self.maybe_poison(err));
            }
        }

        self.sync_db_descriptor(&mut ctx, dbname)?;
        if self.transactions_enabled() {
            self.flush_changeset(&mut ctx)
                .map_err(|err| self.maybe_poison(err))?;
        } else {
            ctx.changeset.clear();
            self.pager.purge_cache(&mut ctx)?;
        }
        Ok(())
    }

    pub(super) fn cursor_dup_count(&mut self, dbname: u16, id: u64) -> Result<u32> {
        self.check_open()?;
        self.recouple_if_needed(dbname, id)?;
        let EnvInner {
            dbs, pager, blobs, ..
        } = self;
        let database = dbs
            .get_mut(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        let LocalDatabase {
            btree, cursors, ..
        } = database;
        let cursor = cursors
            .get(id)
            .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))?;
        let mut ctx = Context::new(dbname, None);
        match &cursor.state {
            CursorState::Btree(coupling) => {
                btree.dup_count_at(&mut ctx, pager, blobs, &coupling.page, coupling.slot as usize)
            }
            CursorState::TxnOp(_) => Ok(1),
            _ => bail!(ErrorKind::InvalidArg),
        }
    }

    pub(super) fn cursor_dup_position(&mut self, dbname: u16, id: u64) -> Result<u32> {
        self.check_open()?;
        let database = self.db(dbname)?;
        let cursor = database
            .cursors
            .get(id)
            .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))?;
        match &cursor.state {
            CursorState::Btree(coupling) => Ok(coupling.dup),
            CursorState::Uncoupled { dup, .. } => Ok(*dup),
            CursorState::TxnOp(_) => Ok(0),
            CursorState::Nil => bail!(ErrorKind::InvalidArg),
        }
    }

    /// Key a cursor state stands on, without touching the cursor.
    fn cursor_key_of_state(
        &mut self,
        dbname: u16,
        state: &CursorState,
    ) -> Result<Option<Vec<u8>>> {
        let EnvInner {
            dbs,
            pager,
            blobs,
            txns,
            ..
        } = self;
        let database = dbs
            .get_mut(&dbname)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        let LocalDatabase { btree, .. } = database;
        let mut ctx = Context::new(dbname, None);
        Ok(match state {
            CursorState::Nil => None,
            CursorState::Uncoupled { key, .. } => Some(key.clone()),
            CursorState::TxnOp(op_id) => txns.op(*op_id).map(|op| op.key.clone()),
            CursorState::Btree(coupling) => Some(btree.key_at(
                &mut ctx,
                pager,
                blobs,
                &coupling.page,
                coupling.slot as usize,
            )?),
        })
    }

    /// Nils every cursor of the database standing on `key` (the erased
    /// key shadows out for the whole database).
    fn nil_cursors_on_key(&mut self, dbname: u16, key: &[u8]) -> Result<()> {
        let ids: Vec<u64> = {
            let database = self.db(dbname)?;
            database
                .cursors
                .iter_ids()
                .collect()
        };
        for cursor_id in ids {
            let state = {
                let database = self.db(dbname)?;
                match database.cursors.get(cursor_id) {
                    Some(cursor) => cursor.state.clone(),
                    None => continue,
                }
            };
            if matches!(state, CursorState::Nil) {
                continue;
            }
            let cursor_key = self.cursor_key_of_state(dbname, &state)?;
            if cursor_key.as_deref() == Some(key) {
                let database = self
                    .dbs
                    .get_mut(&dbname)
                    .expect("database exists");
                if let Some(cursor) = database.cursors.get_mut(cursor_id) {
                    cursor.set_to_nil();
                }
            }
        }
        Ok(())
    }
}

fn duplicate_flags() -> u32 {
    op_flags::DUPLICATE
        | op_flags::DUPLICATE_INSERT_BEFORE
        | op_flags::DUPLICATE_INSERT_AFTER
        | op_flags::DUPLICATE_INSERT_FIRST
        | op_flags::DUPLICATE_INSERT_LAST
}

fn insert_kind(flags: u32) -> OpKind {
    if flags & op_flags::OVERWRITE != 0 {
        OpKind::InsertOverwrite
    } else if flags & duplicate_flags() != 0 {
        OpKind::InsertDuplicate
    } else {
        OpKind::Insert
    }
}

fn decode_recno(key: &[u8]) -> u64 {
    match key.len() {
        4 => u32::from_le_bytes(key.try_into().unwrap()) as u64,
        8 => u64::from_le_bytes(key.try_into().unwrap()),
        _ => 0,
    }
}

