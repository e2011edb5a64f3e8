//! # Journal Recovery
//!
//! Runs at open when the journal has content. Three phases:
//!
//! 1. **Changeset redo.** Both files are scanned for changeset entries;
//!    every page image is copied back to the data file in global LSN
//!    order. The newest changeset LSN becomes the watermark: everything
//!    at or below it is already durable in the data file.
//! 2. **State reload.** The page-manager state blob (possibly restored
//!    in phase 1) is loaded, along with a fresh view of the header page.
//! 3. **Op replay.** With logging muted, every per-op entry above the
//!    watermark is re-applied through the normal mutation paths, in
//!    global LSN order merged across both files. `txn_begin` recreates
//!    transactions under their original ids; `HINT_APPEND`/`HINT_PREPEND`
//!    are stripped from replayed inserts; `KeyNotFound` on a replayed
//!    erase is tolerated (the changeset may already contain the
//!    deletion). Transactions still active at the end abort.
//!
//! Databases opened implicitly for replay are closed again, both journal
//! files are truncated, and the LSN counter resumes above everything
//! seen. A torn entry at a file's tail ends that file's scan at the last
//! intact record; any other replay failure aborts the open.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use tracing::{debug, info, warn};
use zerocopy::FromBytes;

use crate::config::op_flags;
use crate::error::{is_kind, ErrorKind};
use crate::journal::{
    ChangesetPayload, EntryKind, ErasePayload, InsertPayload, PageBlockHeader,
    CHANGESET_PAYLOAD_SIZE, ERASE_PAYLOAD_SIZE, INSERT_PAYLOAD_SIZE, PAGE_BLOCK_HEADER_SIZE,
};
use crate::pager::{fetch_flags, Context};

use super::EnvInner;

struct ReplayEntry {
    lsn: u64,
    txn_id: u64,
    dbname: u16,
    kind: EntryKind,
    aux: Vec<u8>,
    file_idx: usize,
}

impl EnvInner {
    pub(super) fn recover(&mut self) -> Result<()> {
        info!("journal is not empty, starting recovery");
        if let Some(journal) = self.journal.as_mut() {
            journal.disable_logging = true;
        }

        let result = self.recover_inner();

        if let Some(journal) = self.journal.as_mut() {
            journal.disable_logging = false;
        }
        result
    }

    fn recover_inner(&mut self) -> Result<()> {
        let watermark = self.redo_changesets()?;

        // phase 1 restored pages behind the cache's back
        self.pager.invalidate_cache();
        let mut ctx = Context::new(0, None);
        self.header_page = self
            .pager
            .fetch(&mut ctx, 0, fetch_flags::READ_ONLY)?;
        self.verify_header()?;

        let state = self.with_fixed_header(|h| h.pagemanager_blobid());
        if state != 0 {
            let mut ctx = Context::new(0, None);
            self.pager.initialize(&mut ctx, state)?;
        }

        let mut max_lsn = watermark;
        if self.transactions_enabled() {
            let entries = self.collect_replay_entries()?;
            debug!(count = entries.len(), watermark, "replaying journal entries");
            for entry in entries {
                max_lsn = max_lsn.max(entry.lsn);
                self.replay_entry(entry, watermark)?;
            }
            for id in self.txns.active_ids() {
                warn!(txn = id, "aborting transaction left active by the crash");
                self.abort_txn(id)?;
            }
        }

        // databases opened implicitly for replay close again
        self.dbs.clear();

        self.pager.flush_all_pages()?;
        if let Some(journal) = self.journal.as_mut() {
            journal.clear()?;
        }
        self.lsn = self.lsn.max(max_lsn);
        info!(watermark, lsn = self.lsn, "recovery complete");
        Ok(())
    }

    /// Copies every changeset's page images back to the data file, in
    /// LSN order across both files. Returns the newest changeset LSN.
    fn redo_changesets(&mut self) -> Result<u64> {
        let Some(journal) = self.journal.as_ref() else {
            return Ok(0);
        };

        let mut changesets: Vec<(u64, usize, u64)> = Vec::new();
        for idx in 0..2 {
            let mut offset = 0;
            while let Some(entry) = journal.read_entry_at(idx, offset)? {
                if entry.header.entry_kind() == Some(EntryKind::Changeset) {
                    changesets.push((entry.header.lsn(), idx, offset));
                }
                offset = entry.next_offset;
            }
        }
        changesets.sort_unstable_by_key(|(lsn, _, _)| *lsn);

        if let Some((oldest_lsn, oldest_idx, _)) = changesets.first() {
            debug!(
                count = changesets.len(),
                oldest_lsn, "redoing changesets"
            );
            // the file holding the oldest changeset resumes as current
            let oldest = *oldest_idx;
            let device = Arc::clone(self.pager.device());
            let mut last_blob_page = None;
            let mut max_lsn = 0;

            for (lsn, idx, offset) in &changesets {
                let journal = self.journal.as_ref().expect("journal present");
                let entry = journal
                    .read_entry_at(*idx, *offset)?
                    .ok_or_else(|| eyre::Report::new(ErrorKind::IntegrityViolated))?;
                let payload = ChangesetPayload::read_from_bytes(
                    &entry.aux[..CHANGESET_PAYLOAD_SIZE],
                )
                .map_err(|_| eyre::Report::new(ErrorKind::IntegrityViolated))?;
                last_blob_page = Some(payload.last_blob_page());

                let mut cursor = CHANGESET_PAYLOAD_SIZE;
                for _ in 0..payload.num_pages() {
                    ensure!(
                        cursor + PAGE_BLOCK_HEADER_SIZE <= entry.aux.len(),
                        ErrorKind::IntegrityViolated
                    );
                    let block = PageBlockHeader::read_from_bytes(
                        &entry.aux[cursor..cursor + PAGE_BLOCK_HEADER_SIZE],
                    )
                    .map_err(|_| eyre::Report::new(ErrorKind::IntegrityViolated))?;
                    cursor += PAGE_BLOCK_HEADER_SIZE;

                    let size = block.size() as usize;
                    ensure!(
                        cursor + size <= entry.aux.len(),
                        ErrorKind::IntegrityViolated
                    );
                    // write extends the file when the address is beyond
                    // the current end
                    device.write(block.address(), &entry.aux[cursor..cursor + size])?;
                    cursor += size;
                }
                max_lsn = *lsn;
            }
            device.flush()?;

            if let Some(address) = last_blob_page {
                self.pager.set_last_blob_page(address);
            }
            if let Some(journal) = self.journal.as_mut() {
                journal.set_current(oldest);
            }
            return Ok(max_lsn);
        }
        Ok(0)
    }

    /// Pulls every per-op entry out of both files and merges them into
    /// one LSN-ordered stream.
    fn collect_replay_entries(&self) -> Result<Vec<ReplayEntry>> {
        let Some(journal) = self.journal.as_ref() else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for idx in 0..2 {
            let mut offset = 0;
            while let Some(entry) = journal.read_entry_at(idx, offset)? {
                offset = entry.next_offset;
                let Some(kind) = entry.header.entry_kind() else {
                    bail!(ErrorKind::IntegrityViolated);
                };
                if kind == EntryKind::Changeset {
                    continue;
                }
                entries.push(ReplayEntry {
                    lsn: entry.header.lsn(),
                    txn_id: entry.header.txn_id(),
                    dbname: entry.header.dbname(),
                    kind,
                    aux: entry.aux,
                    file_idx: idx,
                });
            }
        }
        entries.sort_by_key(|entry| entry.lsn);
        Ok(entries)
    }

    fn replay_entry(&mut self, entry: ReplayEntry, watermark: u64) -> Result<()> {
        match entry.kind {
            EntryKind::TxnBegin => {
                self.txns.begin_with_id(entry.txn_id, 0, entry.lsn);
                if let Some(txn) = self.txns.txn_mut(entry.txn_id) {
                    txn.log_index = entry.file_idx;
                }
                Ok(())
            }
            EntryKind::TxnCommit => self.commit_txn(entry.txn_id),
            EntryKind::TxnAbort => self.abort_txn(entry.txn_id),
            EntryKind::Insert => {
                // already covered by a changeset
                if entry.lsn <= watermark {
                    return Ok(());
                }
                ensure!(
                    entry.aux.len() >= INSERT_PAYLOAD_SIZE,
                    ErrorKind::IntegrityViolated
                );
                let payload =
                    InsertPayload::read_from_bytes(&entry.aux[..INSERT_PAYLOAD_SIZE])
                        .map_err(|_| eyre::Report::new(ErrorKind::IntegrityViolated))?;
                // this engine journals uncompressed; a compressed entry
                // came from a foreign configuration
                ensure!(
                    payload.compressed_key_size() == 0
                        && payload.compressed_record_size() == 0,
                    ErrorKind::NotImplemented
                );

                let key_start = INSERT_PAYLOAD_SIZE;
                let key_end = key_start + payload.key_size() as usize;
                let record_len = if payload.insert_flags() & op_flags::PARTIAL != 0 {
                    payload.record_partial_size() as usize
                } else {
                    payload.record_size() as usize
                };
                let record_end = key_end + record_len;
                ensure!(entry.aux.len() >= record_end, ErrorKind::IntegrityViolated);
                let key = entry.aux[key_start..key_end].to_vec();
                let record = entry.aux[key_end..record_end].to_vec();

                self.open_db_inner(entry.dbname)?;
                let txn = (entry.txn_id != 0).then_some(entry.txn_id);
                let flags = payload.insert_flags()
                    & !(op_flags::HINT_APPEND | op_flags::HINT_PREPEND);
                self.db_insert(
                    entry.dbname,
                    txn,
                    &key,
                    &record,
                    flags,
                    payload.record_partial_size(),
                    payload.record_partial_offset(),
                )
            }
            EntryKind::Erase => {
                if entry.lsn <= watermark {
                    return Ok(());
                }
                ensure!(
                    entry.aux.len() >= ERASE_PAYLOAD_SIZE,
                    ErrorKind::IntegrityViolated
                );
                let payload = ErasePayload::read_from_bytes(&entry.aux[..ERASE_PAYLOAD_SIZE])
                    .map_err(|_| eyre::Report::new(ErrorKind::IntegrityViolated))?;
                ensure!(
                    payload.compressed_key_size() == 0,
                    ErrorKind::NotImplemented
                );
                let key_end = ERASE_PAYLOAD_SIZE + payload.key_size() as usize;
                ensure!(entry.aux.len() >= key_end, ErrorKind::IntegrityViolated);
                let key = entry.aux[ERASE_PAYLOAD_SIZE..key_end].to_vec();

                self.open_db_inner(entry.dbname)?;
                let txn = (entry.txn_id != 0).then_some(entry.txn_id);
                match self.db_erase(entry.dbname, txn, &key, payload.erase_flags()) {
                    // the changeset may already contain this deletion
                    Err(err) if is_kind(&err, ErrorKind::KeyNotFound) => Ok(()),
                    other => other,
                }
            }
            EntryKind::Changeset => Ok(()),
        }
    }
}
