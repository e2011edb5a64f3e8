//! # Journal (Write-Ahead Log)
//!
//! Two append-only files `<db>.jrn0` / `<db>.jrn1` used in rotation.
//! Every mutating operation appends a per-op entry *before* the B-tree
//! changes; once a mutation's pages are flushed, a changeset entry with
//! their full images marks the durable watermark. Recovery redoes
//! changesets first, then replays per-op entries above the watermark.
//!
//! ## Entry layout (little-endian)
//!
//! ```text
//! header:    { lsn u64, txn_id u64, dbname u16, type u8, _pad u8,
//!              followup_size u32 }                                  24 B
//! insert:    { key_size u16, compressed_key_size u16, record_size u32,
//!              compressed_record_size u32, record_partial_size u32,
//!              record_partial_offset u32, insert_flags u32 }
//!            + key bytes + record bytes
//! erase:     { key_size u16, compressed_key_size u16, duplicate u32,
//!              erase_flags u32 } + key bytes
//! changeset: { num_pages u32, _pad u32, last_blob_page u64 }
//!            + num_pages * ({ address u64, size u32, _pad u32 } + image)
//! ```
//!
//! The `compressed_*` fields exist for journal compressors, which are an
//! external collaborator; this engine writes zeroes and readers fall
//! back to the raw sizes, but non-zero values are honored on read.
//!
//! ## Rotation
//!
//! Before an append, if the active file has seen `switch_threshold`
//! transactions (open + closed) and the other file has no open
//! transactions left, the other file is truncated and becomes active.
//! A file is only ever discarded when none of its transactions are
//! open, so replay never loses an op.
//!
//! ## Buffering and durability
//!
//! Appends go to a per-file write-behind buffer, flushed to the OS when
//! it exceeds `journal_buffer_threshold`, on commit, and on changeset.
//! Commits and changesets additionally fsync when `enable_fsync` is set.
//!
//! Temporary (auto-commit) transactions log `txn_id = 0` and count as
//! closed at append time.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use tracing::{debug, trace};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::EnvConfig;
use crate::error::ErrorKind;
use crate::induce::{ErrorInducer, InducePoint};
use crate::page::Page;
use crate::txn::TxnId;

pub const ENTRY_HEADER_SIZE: usize = 24;
pub const INSERT_PAYLOAD_SIZE: usize = 24;
pub const ERASE_PAYLOAD_SIZE: usize = 12;
pub const CHANGESET_PAYLOAD_SIZE: usize = 16;
pub const PAGE_BLOCK_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    TxnBegin = 1,
    TxnAbort = 2,
    TxnCommit = 3,
    Insert = 4,
    Erase = 5,
    Changeset = 6,
}

impl EntryKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(EntryKind::TxnBegin),
            2 => Some(EntryKind::TxnAbort),
            3 => Some(EntryKind::TxnCommit),
            4 => Some(EntryKind::Insert),
            5 => Some(EntryKind::Erase),
            6 => Some(EntryKind::Changeset),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EntryHeader {
    lsn: U64,
    txn_id: U64,
    dbname: U16,
    kind: u8,
    _pad: u8,
    followup_size: U32,
}

impl EntryHeader {
    le_accessors! {
        lsn: u64,
        txn_id: u64,
        dbname: u16,
        followup_size: u32,
    }

    fn new(kind: EntryKind, lsn: u64, txn_id: u64, dbname: u16, followup: u32) -> Self {
        Self {
            lsn: U64::new(lsn),
            txn_id: U64::new(txn_id),
            dbname: U16::new(dbname),
            kind: kind as u8,
            _pad: 0,
            followup_size: U32::new(followup),
        }
    }

    pub fn entry_kind(&self) -> Option<EntryKind> {
        EntryKind::from_byte(self.kind)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InsertPayload {
    key_size: U16,
    compressed_key_size: U16,
    record_size: U32,
    compressed_record_size: U32,
    record_partial_size: U32,
    record_partial_offset: U32,
    insert_flags: U32,
}

impl InsertPayload {
    le_accessors! {
        key_size: u16,
        compressed_key_size: u16,
        record_size: u32,
        compressed_record_size: u32,
        record_partial_size: u32,
        record_partial_offset: u32,
        insert_flags: u32,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ErasePayload {
    key_size: U16,
    compressed_key_size: U16,
    duplicate: U32,
    erase_flags: U32,
}

impl ErasePayload {
    le_accessors! {
        key_size: u16,
        compressed_key_size: u16,
        duplicate: u32,
        erase_flags: u32,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ChangesetPayload {
    num_pages: U32,
    _pad: U32,
    last_blob_page: U64,
}

impl ChangesetPayload {
    le_accessors! {
        num_pages: u32,
        last_blob_page: u64,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageBlockHeader {
    address: U64,
    size: U32,
    _pad: U32,
}

impl PageBlockHeader {
    le_accessors! {
        address: u64,
        size: u32,
    }
}

const _: () = assert!(std::mem::size_of::<EntryHeader>() == ENTRY_HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<InsertPayload>() == INSERT_PAYLOAD_SIZE);
const _: () = assert!(std::mem::size_of::<ErasePayload>() == ERASE_PAYLOAD_SIZE);
const _: () = assert!(std::mem::size_of::<ChangesetPayload>() == CHANGESET_PAYLOAD_SIZE);
const _: () = assert!(std::mem::size_of::<PageBlockHeader>() == PAGE_BLOCK_HEADER_SIZE);

/// One decoded journal entry plus its raw followup bytes.
pub struct RawEntry {
    pub header: EntryHeader,
    pub aux: Vec<u8>,
    pub next_offset: u64,
}

pub struct Journal {
    paths: [PathBuf; 2],
    files: [File; 2],
    /// Bytes already handed to the OS per file.
    flushed_sizes: [u64; 2],
    buffers: [Vec<u8>; 2],
    current: usize,
    open_txn: [u32; 2],
    closed_txn: [u32; 2],
    switch_threshold: u32,
    buffer_threshold: usize,
    enable_fsync: bool,
    /// Set during recovery so replay does not re-journal itself.
    pub disable_logging: bool,
    bytes_flushed_total: u64,
}

fn journal_paths(base: &Path) -> [PathBuf; 2] {
    let mut name0 = base.as_os_str().to_os_string();
    name0.push(".jrn0");
    let mut name1 = base.as_os_str().to_os_string();
    name1.push(".jrn1");
    [PathBuf::from(name0), PathBuf::from(name1)]
}

impl Journal {
    pub fn create(base: &Path, config: &EnvConfig) -> Result<Self> {
        let paths = journal_paths(base);
        let open = |path: &Path| -> Result<File> {
            OpenOptions::new()
                .create(true)
                .truncate(true)
                .read(true)
                .write(true)
                .open(path)
                .wrap_err_with(|| format!("failed to create journal file at {:?}", path))
        };
        let files = [open(&paths[0])?, open(&paths[1])?];
        Ok(Self::from_parts(paths, files, [0, 0], config))
    }

    pub fn open(base: &Path, config: &EnvConfig) -> Result<Self> {
        let paths = journal_paths(base);
        let open = |path: &Path| -> Result<File> {
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(path)
                .wrap_err_with(|| format!("failed to open journal file at {:?}", path))
        };
        let files = [open(&paths[0])?, open(&paths[1])?];
        let sizes = [
            files[0].metadata().wrap_err(ErrorKind::Io)?.len(),
            files[1].metadata().wrap_err(ErrorKind::Io)?.len(),
        ];
        Ok(Self::from_parts(paths, files, sizes, config))
    }

    fn from_parts(
        paths: [PathBuf; 2],
        files: [File; 2],
        flushed_sizes: [u64; 2],
        config: &EnvConfig,
    ) -> Self {
        Self {
            paths,
            files,
            flushed_sizes,
            buffers: [Vec::new(), Vec::new()],
            current: 0,
            open_txn: [0, 0],
            closed_txn: [0, 0],
            switch_threshold: config.journal_switch_threshold.max(1),
            buffer_threshold: config.journal_buffer_threshold,
            enable_fsync: config.has(crate::config::env_flags::ENABLE_FSYNC),
            disable_logging: false,
            bytes_flushed_total: 0,
        }
    }

    /// Unflushed plus flushed bytes across both files; zero after a
    /// clean close or a completed recovery.
    pub fn total_bytes(&self) -> u64 {
        self.flushed_sizes[0]
            + self.flushed_sizes[1]
            + self.buffers[0].len() as u64
            + self.buffers[1].len() as u64
    }

    pub fn bytes_flushed_total(&self) -> u64 {
        self.bytes_flushed_total
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes() == 0
    }

    pub fn file_size(&self, idx: usize) -> u64 {
        self.flushed_sizes[idx] + self.buffers[idx].len() as u64
    }

    /// Picks the journal file for the next transaction, rotating when
    /// the active file is past the threshold and the other file has no
    /// open transactions.
    fn switch_files_maybe(&mut self) -> Result<usize> {
        let other = 1 - self.current;

        if self.open_txn[self.current] + self.closed_txn[self.current] < self.switch_threshold {
            return Ok(self.current);
        }
        if self.open_txn[other] == 0 {
            self.clear_file(other)?;
            self.current = other;
            debug!(file = other, "journal rotated");
        }
        Ok(self.current)
    }

    // ------------------------------------------------------------------
    // append paths
    // ------------------------------------------------------------------

    fn append_bytes(&mut self, idx: usize, parts: &[&[u8]]) {
        for part in parts {
            self.buffers[idx].extend_from_slice(part);
        }
    }

    fn maybe_flush_buffer(&mut self, idx: usize) -> Result<()> {
        if self.buffers[idx].len() >= self.buffer_threshold {
            self.flush_buffer(idx, false)?;
        }
        Ok(())
    }

    pub fn flush_buffer(&mut self, idx: usize, fsync: bool) -> Result<()> {
        if !self.buffers[idx].is_empty() {
            let buffer = std::mem::take(&mut self.buffers[idx]);
            self.files[idx]
                .write_all_at(&buffer, self.flushed_sizes[idx])
                .wrap_err(ErrorKind::Io)?;
            self.flushed_sizes[idx] += buffer.len() as u64;
            self.bytes_flushed_total += buffer.len() as u64;
        }
        if fsync {
            self.files[idx].sync_data().wrap_err(ErrorKind::Io)?;
        }
        Ok(())
    }

    /// Returns the file index this transaction will log to.
    pub fn append_txn_begin(&mut self, txn_id: TxnId, lsn: u64) -> Result<usize> {
        if self.disable_logging {
            return Ok(self.current);
        }
        let idx = self.switch_files_maybe()?;
        let header = EntryHeader::new(EntryKind::TxnBegin, lsn, txn_id, 0, 0);
        self.append_bytes(idx, &[header.as_bytes()]);
        self.maybe_flush_buffer(idx)?;
        self.open_txn[idx] += 1;
        self.current = idx;
        trace!(txn = txn_id, lsn, file = idx, "journaled txn begin");
        Ok(idx)
    }

    pub fn append_txn_abort(&mut self, idx: usize, txn_id: TxnId, lsn: u64) -> Result<()> {
        if self.disable_logging {
            return Ok(());
        }
        self.open_txn[idx] -= 1;
        self.closed_txn[idx] += 1;
        let header = EntryHeader::new(EntryKind::TxnAbort, lsn, txn_id, 0, 0);
        self.append_bytes(idx, &[header.as_bytes()]);
        // no fsync: an incomplete abort re-aborts on recovery anyway
        self.maybe_flush_buffer(idx)?;
        trace!(txn = txn_id, lsn, "journaled txn abort");
        Ok(())
    }

    pub fn append_txn_commit(&mut self, idx: usize, txn_id: TxnId, lsn: u64) -> Result<()> {
        if self.disable_logging {
            return Ok(());
        }
        let header = EntryHeader::new(EntryKind::TxnCommit, lsn, txn_id, 0, 0);
        self.append_bytes(idx, &[header.as_bytes()]);
        // the commit must reach the OS before the flush starts; the
        // open/closed counters move in transaction_flushed()
        self.flush_buffer(idx, self.enable_fsync)?;
        trace!(txn = txn_id, lsn, "journaled txn commit");
        Ok(())
    }

    /// `txn` is `Some((id, log_index))` for a user transaction, `None`
    /// for a temporary auto-commit one.
    #[allow(clippy::too_many_arguments)]
    pub fn append_insert(
        &mut self,
        dbname: u16,
        txn: Option<(TxnId, usize)>,
        key: &[u8],
        record: &[u8],
        flags: u32,
        partial_size: u32,
        partial_offset: u32,
        lsn: u64,
    ) -> Result<()> {
        if self.disable_logging {
            return Ok(());
        }
        let (txn_id, idx) = match txn {
            Some((id, idx)) => (id, idx),
            None => {
                let idx = self.switch_files_maybe()?;
                self.closed_txn[idx] += 1;
                (0, idx)
            }
        };

        let followup = INSERT_PAYLOAD_SIZE + key.len() + record.len();
        let header = EntryHeader::new(EntryKind::Insert, lsn, txn_id, dbname, followup as u32);
        let payload = InsertPayload {
            key_size: U16::new(key.len() as u16),
            compressed_key_size: U16::new(0),
            record_size: U32::new(record.len() as u32),
            compressed_record_size: U32::new(0),
            record_partial_size: U32::new(partial_size),
            record_partial_offset: U32::new(partial_offset),
            insert_flags: U32::new(flags),
        };
        self.append_bytes(idx, &[header.as_bytes(), payload.as_bytes(), key, record]);
        self.maybe_flush_buffer(idx)?;
        trace!(dbname, txn = txn_id, lsn, "journaled insert");
        Ok(())
    }

    pub fn append_erase(
        &mut self,
        dbname: u16,
        txn: Option<(TxnId, usize)>,
        key: &[u8],
        duplicate: u32,
        flags: u32,
        lsn: u64,
    ) -> Result<()> {
        if self.disable_logging {
            return Ok(());
        }
        let (txn_id, idx) = match txn {
            Some((id, idx)) => (id, idx),
            None => {
                let idx = self.switch_files_maybe()?;
                self.closed_txn[idx] += 1;
                (0, idx)
            }
        };

        let followup = ERASE_PAYLOAD_SIZE + key.len();
        let header = EntryHeader::new(EntryKind::Erase, lsn, txn_id, dbname, followup as u32);
        let payload = ErasePayload {
            key_size: U16::new(key.len() as u16),
            compressed_key_size: U16::new(0),
            duplicate: U32::new(duplicate),
            erase_flags: U32::new(flags),
        };
        self.append_bytes(idx, &[header.as_bytes(), payload.as_bytes(), key]);
        self.maybe_flush_buffer(idx)?;
        trace!(dbname, txn = txn_id, lsn, "journaled erase");
        Ok(())
    }

    /// Appends the full images of `pages` as one changeset entry and
    /// flushes the journal. The entry's LSN is the durability watermark:
    /// everything at or below it is covered by the data file plus this
    /// changeset.
    pub fn append_changeset(
        &mut self,
        pages: &[std::sync::Arc<Page>],
        last_blob_page: u64,
        lsn: u64,
    ) -> Result<usize> {
        ensure!(!pages.is_empty(), ErrorKind::InvalidArg);
        if self.disable_logging {
            return Ok(self.current);
        }

        let idx = self.switch_files_maybe()?;
        let page_size = pages[0].data().len();
        let followup = CHANGESET_PAYLOAD_SIZE
            + pages.len() * (PAGE_BLOCK_HEADER_SIZE + page_size);

        let header =
            EntryHeader::new(EntryKind::Changeset, lsn, 0, 0, followup as u32);
        let payload = ChangesetPayload {
            num_pages: U32::new(pages.len() as u32),
            _pad: U32::new(0),
            last_blob_page: U64::new(last_blob_page),
        };
        self.append_bytes(idx, &[header.as_bytes(), payload.as_bytes()]);

        for page in pages {
            let block = PageBlockHeader {
                address: U64::new(page.address()),
                size: U32::new(page_size as u32),
                _pad: U32::new(0),
            };
            let data = page.data();
            self.append_bytes(idx, &[block.as_bytes(), &data]);
        }

        ErrorInducer::induce(InducePoint::ChangesetFlush)
            .map_err(eyre::Report::new)?;

        self.flush_buffer(idx, self.enable_fsync)?;

        ErrorInducer::induce(InducePoint::ChangesetFlush)
            .map_err(eyre::Report::new)?;

        debug!(pages = pages.len(), lsn, file = idx, "journaled changeset");
        Ok(idx)
    }

    /// A changeset reached the data file; it counts as a closed txn for
    /// rotation accounting.
    pub fn changeset_flushed(&mut self, idx: usize) {
        if !self.disable_logging {
            self.closed_txn[idx] += 1;
        }
    }

    /// A committed transaction's ops reached the B-tree.
    pub fn transaction_flushed(&mut self, idx: usize) {
        if self.disable_logging {
            return;
        }
        debug_assert!(self.open_txn[idx] > 0);
        self.open_txn[idx] -= 1;
        self.closed_txn[idx] += 1;
    }

    // ------------------------------------------------------------------
    // read path (recovery)
    // ------------------------------------------------------------------

    /// Reads the entry at `offset`, or `None` at EOF / on a torn tail.
    pub fn read_entry_at(&self, idx: usize, offset: u64) -> Result<Option<RawEntry>> {
        let size = self.flushed_sizes[idx];
        if offset + ENTRY_HEADER_SIZE as u64 > size {
            return Ok(None);
        }

        let mut header_bytes = [0u8; ENTRY_HEADER_SIZE];
        if self.files[idx].read_exact_at(&mut header_bytes, offset).is_err() {
            // a short read mid-entry ends recovery at the last intact LSN
            return Ok(None);
        }
        let header = EntryHeader::read_from_bytes(&header_bytes)
            .map_err(|_| eyre::Report::new(ErrorKind::IntegrityViolated))?;
        if header.lsn() == 0 {
            return Ok(None);
        }
        ensure!(
            header.entry_kind().is_some(),
            ErrorKind::IntegrityViolated
        );

        let followup = header.followup_size() as usize;
        if offset + (ENTRY_HEADER_SIZE + followup) as u64 > size {
            return Ok(None);
        }
        let mut aux = vec![0u8; followup];
        if self
            .files[idx]
            .read_exact_at(&mut aux, offset + ENTRY_HEADER_SIZE as u64)
            .is_err()
        {
            return Ok(None);
        }

        Ok(Some(RawEntry {
            header,
            aux,
            next_offset: offset + (ENTRY_HEADER_SIZE + followup) as u64,
        }))
    }

    /// LSN of the oldest changeset in file `idx`, or 0.
    pub fn scan_oldest_changeset(&self, idx: usize) -> Result<u64> {
        let mut offset = 0;
        while let Some(entry) = self.read_entry_at(idx, offset)? {
            if entry.header.entry_kind() == Some(EntryKind::Changeset) {
                return Ok(entry.header.lsn());
            }
            offset = entry.next_offset;
        }
        Ok(0)
    }

    pub fn set_current(&mut self, idx: usize) {
        self.current = idx;
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    fn clear_file(&mut self, idx: usize) -> Result<()> {
        self.files[idx].set_len(0).wrap_err(ErrorKind::Io)?;
        self.files[idx].flush().wrap_err(ErrorKind::Io)?;
        self.flushed_sizes[idx] = 0;
        self.open_txn[idx] = 0;
        self.closed_txn[idx] = 0;
        self.buffers[idx].clear();
        Ok(())
    }

    /// Truncates both files; called after a clean flush and at the end
    /// of recovery.
    pub fn clear(&mut self) -> Result<()> {
        self.clear_file(0)?;
        self.clear_file(1)?;
        self.current = 0;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;

    fn test_journal(dir: &tempfile::TempDir, config: &EnvConfig) -> Journal {
        Journal::create(&dir.path().join("test.db"), config).unwrap()
    }

    #[test]
    fn entry_struct_sizes_match_the_format() {
        assert_eq!(std::mem::size_of::<EntryHeader>(), 24);
        assert_eq!(std::mem::size_of::<InsertPayload>(), 24);
        assert_eq!(std::mem::size_of::<ErasePayload>(), 12);
        assert_eq!(std::mem::size_of::<ChangesetPayload>(), 16);
        assert_eq!(std::mem::size_of::<PageBlockHeader>(), 16);
    }

    #[test]
    fn insert_entry_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = test_journal(&dir, &EnvConfig::default());

        journal
            .append_insert(7, None, b"key", b"record", 0x40, 0, 0, 11)
            .unwrap();
        journal.flush_buffer(0, false).unwrap();

        let entry = journal.read_entry_at(0, 0).unwrap().unwrap();
        assert_eq!(entry.header.entry_kind(), Some(EntryKind::Insert));
        assert_eq!(entry.header.lsn(), 11);
        assert_eq!(entry.header.dbname(), 7);
        assert_eq!(entry.header.txn_id(), 0);

        let payload = InsertPayload::read_from_bytes(&entry.aux[..INSERT_PAYLOAD_SIZE]).unwrap();
        assert_eq!(payload.key_size(), 3);
        assert_eq!(payload.record_size(), 6);
        assert_eq!(payload.insert_flags(), 0x40);
        assert_eq!(&entry.aux[INSERT_PAYLOAD_SIZE..INSERT_PAYLOAD_SIZE + 3], b"key");
        assert_eq!(&entry.aux[INSERT_PAYLOAD_SIZE + 3..], b"record");
    }

    #[test]
    fn erase_entry_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = test_journal(&dir, &EnvConfig::default());

        journal.append_erase(3, None, b"gone", 2, 0, 21).unwrap();
        journal.flush_buffer(0, false).unwrap();

        let entry = journal.read_entry_at(0, 0).unwrap().unwrap();
        assert_eq!(entry.header.entry_kind(), Some(EntryKind::Erase));
        let payload = ErasePayload::read_from_bytes(&entry.aux[..ERASE_PAYLOAD_SIZE]).unwrap();
        assert_eq!(payload.key_size(), 4);
        assert_eq!(payload.duplicate(), 2);
        assert_eq!(&entry.aux[ERASE_PAYLOAD_SIZE..], b"gone");
    }

    #[test]
    fn torn_tail_ends_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = test_journal(&dir, &EnvConfig::default());

        journal.append_insert(1, None, b"k1", b"v1", 0, 0, 0, 5).unwrap();
        journal.append_insert(1, None, b"k2", b"v2", 0, 0, 0, 6).unwrap();
        journal.flush_buffer(0, false).unwrap();

        // cut the second entry in half
        let full = journal.flushed_sizes[0];
        journal.files[0].set_len(full - 4).unwrap();
        journal.flushed_sizes[0] = full - 4;

        let first = journal.read_entry_at(0, 0).unwrap().unwrap();
        assert_eq!(first.header.lsn(), 5);
        assert!(journal.read_entry_at(0, first.next_offset).unwrap().is_none());
    }

    #[test]
    fn rotation_waits_for_open_txns() {
        let dir = tempfile::tempdir().unwrap();
        let config = EnvConfig::default().journal_switch_threshold(2);
        let mut journal = test_journal(&dir, &config);

        let idx_a = journal.append_txn_begin(1, 1).unwrap();
        let idx_b = journal.append_txn_begin(2, 2).unwrap();
        assert_eq!(idx_a, idx_b, "threshold not reached yet");

        // threshold reached, but the only other file is empty: rotate
        let idx_c = journal.append_txn_begin(3, 3).unwrap();
        assert_ne!(idx_c, idx_a);

        // file A still has open txns, so rotation back is blocked
        journal.append_txn_begin(4, 4).unwrap();
        let idx_d = journal.append_txn_begin(5, 5).unwrap();
        assert_eq!(idx_d, idx_c);
    }

    #[test]
    fn clear_resets_counters_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = test_journal(&dir, &EnvConfig::default());

        journal.append_insert(1, None, b"k", b"v", 0, 0, 0, 1).unwrap();
        journal.flush_buffer(0, false).unwrap();
        assert!(!journal.is_empty());

        journal.clear().unwrap();
        assert!(journal.is_empty());
        assert_eq!(journal.total_bytes(), 0);
    }

    #[test]
    fn changeset_round_trips_page_images() {
        use crate::page::PageType;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let config = EnvConfig::default().page_size(1024);
        let mut journal = test_journal(&dir, &config);

        let page = Arc::new(Page::new_allocated(2048, PageType::BtreeLeaf, 1024, false));
        page.data_mut()[100] = 0xAA;

        let idx = journal.append_changeset(&[page], 4096, 33).unwrap();
        let entry = journal.read_entry_at(idx, 0).unwrap().unwrap();
        assert_eq!(entry.header.entry_kind(), Some(EntryKind::Changeset));
        assert_eq!(entry.header.lsn(), 33);

        let payload =
            ChangesetPayload::read_from_bytes(&entry.aux[..CHANGESET_PAYLOAD_SIZE]).unwrap();
        assert_eq!(payload.num_pages(), 1);
        assert_eq!(payload.last_blob_page(), 4096);

        let block_start = CHANGESET_PAYLOAD_SIZE;
        let block = PageBlockHeader::read_from_bytes(
            &entry.aux[block_start..block_start + PAGE_BLOCK_HEADER_SIZE],
        )
        .unwrap();
        assert_eq!(block.address(), 2048);
        assert_eq!(block.size(), 1024);
        assert_eq!(
            entry.aux[block_start + PAGE_BLOCK_HEADER_SIZE + 100],
            0xAA
        );
    }
}
