//! # Transactions
//!
//! A transaction collects operations in memory; the B-tree receives them
//! only at commit. Between those two points the pending operations live
//! in two structures:
//!
//! - the [`Txn`]'s ordered op list (flush order), and
//! - each database's per-key [`OpIndex`](oplist::OpIndex) (lookup and
//!   cursor-merge order).
//!
//! ## Lifecycle
//!
//! ```text
//! begin ──> Active ──commit──> Committed   (ops flushed to the B-tree)
//!              │
//!              └───abort────> Aborted      (ops discarded)
//! ```
//!
//! Transaction ids are monotonic and never reused; id 0 is reserved for
//! temporary (auto-commit) transactions in the journal. Commit flushes
//! synchronously, so the op arena only ever holds operations of active
//! (or not-yet-pruned aborted) transactions.
//!
//! ## Conflict rule
//!
//! A mutation of key `k` scans `k`'s op list: an op owned by another
//! *active* transaction is a `TxnConflict`; aborted ops are skipped;
//! committed ops are already in the tree. Overwrites within one
//! transaction collapse in place.

pub mod oplist;

pub use oplist::{OpIndex, Visibility};

use std::collections::BTreeMap;

use hashbrown::HashMap;
use tracing::trace;

pub type TxnId = u64;
pub type OpId = u64;

pub mod txn_flags {
    /// Wraps a single auto-committed operation; journaled as txn id 0.
    pub const TEMPORARY: u32 = 1 << 0;
    pub const READ_ONLY: u32 = 1 << 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    InsertOverwrite,
    InsertDuplicate,
    Erase,
    Nop,
}

#[derive(Debug)]
pub struct TxnOp {
    pub id: OpId,
    pub txn_id: TxnId,
    pub dbname: u16,
    pub kind: OpKind,
    pub key: Vec<u8>,
    pub record: Vec<u8>,
    pub flags: u32,
    pub duplicate_index: u32,
    /// `PARTIAL` writes: the slice of the record being written.
    pub partial_size: u32,
    pub partial_offset: u32,
    pub lsn: u64,
}

#[derive(Debug)]
pub struct Txn {
    pub id: TxnId,
    pub state: TxnState,
    pub flags: u32,
    /// Op ids in insertion order; this is the flush order.
    pub ops: Vec<OpId>,
    /// Journal file this transaction logs to.
    pub log_index: usize,
    pub begin_lsn: u64,
    pub commit_lsn: u64,
}

impl Txn {
    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }
}

pub struct TxnManager {
    txns: BTreeMap<TxnId, Txn>,
    ops: HashMap<OpId, TxnOp>,
    next_txn_id: TxnId,
    next_op_id: OpId,
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnManager {
    pub fn new() -> Self {
        Self {
            txns: BTreeMap::new(),
            ops: HashMap::new(),
            next_txn_id: 1,
            next_op_id: 1,
        }
    }

    pub fn begin(&mut self, flags: u32, begin_lsn: u64) -> TxnId {
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.insert_txn(id, flags, begin_lsn);
        trace!(txn = id, "transaction started");
        id
    }

    /// Recovery replays transactions under their original ids.
    pub fn begin_with_id(&mut self, id: TxnId, flags: u32, begin_lsn: u64) {
        self.next_txn_id = self.next_txn_id.max(id + 1);
        self.insert_txn(id, flags, begin_lsn);
    }

    fn insert_txn(&mut self, id: TxnId, flags: u32, begin_lsn: u64) {
        self.txns.insert(
            id,
            Txn {
                id,
                state: TxnState::Active,
                flags,
                ops: Vec::new(),
                log_index: 0,
                begin_lsn,
                commit_lsn: 0,
            },
        );
    }

    pub fn txn(&self, id: TxnId) -> Option<&Txn> {
        self.txns.get(&id)
    }

    pub fn txn_mut(&mut self, id: TxnId) -> Option<&mut Txn> {
        self.txns.get_mut(&id)
    }

    pub fn state_of(&self, id: TxnId) -> Option<TxnState> {
        self.txns.get(&id).map(|t| t.state)
    }

    pub fn op(&self, id: OpId) -> Option<&TxnOp> {
        self.ops.get(&id)
    }

    pub fn op_mut(&mut self, id: OpId) -> Option<&mut TxnOp> {
        self.ops.get_mut(&id)
    }

    /// Ids of every active transaction, oldest first.
    pub fn active_ids(&self) -> Vec<TxnId> {
        self.txns
            .values()
            .filter(|t| t.is_active())
            .map(|t| t.id)
            .collect()
    }

    pub fn has_active(&self) -> bool {
        self.txns.values().any(|t| t.is_active())
    }

    /// Records a pending operation for `txn_id` and returns its id.
    #[allow(clippy::too_many_arguments)]
    pub fn record_op(
        &mut self,
        txn_id: TxnId,
        dbname: u16,
        kind: OpKind,
        key: Vec<u8>,
        record: Vec<u8>,
        flags: u32,
        duplicate_index: u32,
        partial: (u32, u32),
        lsn: u64,
    ) -> OpId {
        let id = self.next_op_id;
        self.next_op_id += 1;
        self.ops.insert(
            id,
            TxnOp {
                id,
                txn_id,
                dbname,
                kind,
                key,
                record,
                flags,
                duplicate_index,
                partial_size: partial.0,
                partial_offset: partial.1,
                lsn,
            },
        );
        if let Some(txn) = self.txns.get_mut(&txn_id) {
            txn.ops.push(id);
        }
        id
    }

    /// Removes and returns the transaction's ops in flush order.
    pub fn take_ops(&mut self, txn_id: TxnId) -> Vec<TxnOp> {
        let ids = self
            .txns
            .get_mut(&txn_id)
            .map(|t| std::mem::take(&mut t.ops))
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.ops.remove(&id)).collect()
    }

    pub fn set_committed(&mut self, id: TxnId, commit_lsn: u64) {
        if let Some(txn) = self.txns.get_mut(&id) {
            txn.state = TxnState::Committed;
            txn.commit_lsn = commit_lsn;
        }
    }

    pub fn set_aborted(&mut self, id: TxnId) {
        if let Some(txn) = self.txns.get_mut(&id) {
            txn.state = TxnState::Aborted;
        }
    }

    /// Drops a finished transaction entirely.
    pub fn remove(&mut self, id: TxnId) {
        if let Some(txn) = self.txns.remove(&id) {
            for op in txn.ops {
                self.ops.remove(&op);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_ids_are_monotonic_and_unique() {
        let mut manager = TxnManager::new();
        let a = manager.begin(0, 1);
        let b = manager.begin(0, 2);
        assert!(b > a);

        manager.remove(a);
        let c = manager.begin(0, 3);
        assert!(c > b);
    }

    #[test]
    fn begin_with_id_bumps_the_counter() {
        let mut manager = TxnManager::new();
        manager.begin_with_id(40, 0, 1);
        let next = manager.begin(0, 2);
        assert_eq!(next, 41);
    }

    #[test]
    fn take_ops_preserves_insertion_order() {
        let mut manager = TxnManager::new();
        let txn = manager.begin(0, 1);
        manager.record_op(txn, 1, OpKind::Insert, b"b".to_vec(), vec![], 0, 0, (0, 0), 2);
        manager.record_op(txn, 1, OpKind::Erase, b"a".to_vec(), vec![], 0, 0, (0, 0), 3);

        let ops = manager.take_ops(txn);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].kind, OpKind::Insert);
        assert_eq!(ops[1].kind, OpKind::Erase);
        assert!(manager.take_ops(txn).is_empty());
    }

    #[test]
    fn state_transitions() {
        let mut manager = TxnManager::new();
        let txn = manager.begin(0, 1);
        assert_eq!(manager.state_of(txn), Some(TxnState::Active));

        manager.set_committed(txn, 9);
        assert_eq!(manager.state_of(txn), Some(TxnState::Committed));
        assert_eq!(manager.txn(txn).unwrap().commit_lsn, 9);
        assert!(!manager.has_active());
    }
}
