//! # Per-Key Operation Index
//!
//! Each database keeps an ordered map from key to the list of pending
//! transactional operations on that key (insertion order within a key,
//! the database's comparator order across keys). Cursor merges walk this
//! map instead of re-traversing the B-tree, and conflict detection scans
//! a single key's list.
//!
//! The map outlives individual transactions: commit and abort prune
//! their ops, so at any quiet point the index is empty.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

use eyre::{bail, Result};
use smallvec::SmallVec;

use crate::btree::compare_keys;
use crate::config::KeyType;
use crate::error::ErrorKind;

use super::{OpId, OpKind, TxnId, TxnManager, TxnState};

/// Key wrapper ordering a `BTreeMap` by the database comparator rather
/// than lexicographically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub bytes: Vec<u8>,
    key_type: KeyType,
}

impl IndexKey {
    pub fn new(bytes: Vec<u8>, key_type: KeyType) -> Self {
        Self { bytes, key_type }
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(self.key_type, &self.bytes, &other.bytes)
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// What a transaction sees for one key, after folding its pending ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// No pending op affects this key; the B-tree decides.
    Unchanged,
    /// The newest visible op inserts/overwrites; the op's record wins.
    Inserted(OpId),
    /// The newest visible op erases; the key is shadowed out.
    Erased(OpId),
}

pub struct OpIndex {
    map: BTreeMap<IndexKey, SmallVec<[OpId; 4]>>,
    key_type: KeyType,
}

impl OpIndex {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            map: BTreeMap::new(),
            key_type,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn index_key(&self, key: &[u8]) -> IndexKey {
        IndexKey::new(key.to_vec(), self.key_type)
    }

    /// The conflict rule: any op on `key` owned by a different active
    /// transaction blocks the mutation.
    pub fn conflict_check(
        &self,
        manager: &TxnManager,
        key: &[u8],
        txn: Option<TxnId>,
    ) -> Result<()> {
        let Some(ops) = self.map.get(&self.index_key(key)) else {
            return Ok(());
        };
        for &op_id in ops {
            let Some(op) = manager.op(op_id) else { continue };
            if Some(op.txn_id) == txn {
                continue;
            }
            if manager.state_of(op.txn_id) == Some(TxnState::Active) {
                bail!(ErrorKind::TxnConflict);
            }
        }
        Ok(())
    }

    /// Appends an op to the key's list. An overwrite on a key whose
    /// newest op belongs to the same transaction and also carries a
    /// record collapses into that op instead of growing the list.
    pub fn append(&mut self, manager: &mut TxnManager, key: &[u8], op_id: OpId) {
        let entry = self.map.entry(self.index_key(key)).or_default();

        if let Some(&last_id) = entry.last() {
            let collapse = {
                let (Some(last), Some(new)) = (manager.op(last_id), manager.op(op_id)) else {
                    entry.push(op_id);
                    return;
                };
                last.txn_id == new.txn_id
                    && new.kind == OpKind::InsertOverwrite
                    && matches!(last.kind, OpKind::Insert | OpKind::InsertOverwrite)
            };
            if collapse {
                let record = manager.op(op_id).map(|op| op.record.clone()).unwrap_or_default();
                if let Some(last) = manager.op_mut(last_id) {
                    last.record = record;
                }
                // the collapsed op stays in the txn's flush list as a nop
                if let Some(op) = manager.op_mut(op_id) {
                    op.kind = OpKind::Nop;
                }
                return;
            }
        }
        entry.push(op_id);
    }

    /// Folds the pending ops on `key` into what `txn` sees. Only the
    /// observer's own active transaction shadows the B-tree; other
    /// transactions' pending ops are isolated until they commit.
    pub fn visibility(&self, manager: &TxnManager, key: &[u8], txn: Option<TxnId>) -> Visibility {
        let Some(ops) = self.map.get(&self.index_key(key)) else {
            return Visibility::Unchanged;
        };
        for &op_id in ops.iter().rev() {
            let Some(op) = manager.op(op_id) else { continue };
            if Some(op.txn_id) != txn {
                continue;
            }
            if manager.state_of(op.txn_id) != Some(TxnState::Active) {
                continue;
            }
            return match op.kind {
                OpKind::Erase => Visibility::Erased(op_id),
                OpKind::Nop => continue,
                _ => Visibility::Inserted(op_id),
            };
        }
        Visibility::Unchanged
    }

    /// Next key (strictly after `key`, or the first when `None`) with a
    /// visible op for `txn`, together with its visibility.
    pub fn next_visible(
        &self,
        manager: &TxnManager,
        txn: Option<TxnId>,
        key: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Visibility)> {
        let lower = match key {
            Some(bytes) => Bound::Excluded(self.index_key(bytes)),
            None => Bound::Unbounded,
        };
        for (index_key, _) in self.map.range((lower, Bound::Unbounded)) {
            match self.visibility(manager, &index_key.bytes, txn) {
                Visibility::Unchanged => continue,
                visible => return Some((index_key.bytes.clone(), visible)),
            }
        }
        None
    }

    /// Previous key (strictly before `key`, or the last when `None`)
    /// with a visible op for `txn`.
    pub fn prev_visible(
        &self,
        manager: &TxnManager,
        txn: Option<TxnId>,
        key: Option<&[u8]>,
    ) -> Option<(Vec<u8>, Visibility)> {
        let upper = match key {
            Some(bytes) => Bound::Excluded(self.index_key(bytes)),
            None => Bound::Unbounded,
        };
        for (index_key, _) in self.map.range((Bound::Unbounded, upper)).rev() {
            match self.visibility(manager, &index_key.bytes, txn) {
                Visibility::Unchanged => continue,
                visible => return Some((index_key.bytes.clone(), visible)),
            }
        }
        None
    }

    /// Directional wrapper over [`next_visible`](Self::next_visible) and
    /// [`prev_visible`](Self::prev_visible) for the cursor merge.
    pub fn visible_neighbor(
        &self,
        manager: &TxnManager,
        txn: Option<TxnId>,
        bound: Option<&[u8]>,
        forward: bool,
    ) -> Option<(Vec<u8>, Visibility)> {
        if forward {
            self.next_visible(manager, txn, bound)
        } else {
            self.prev_visible(manager, txn, bound)
        }
    }

    /// Removes every op of `txn_id` from the index (commit flush or
    /// abort).
    pub fn prune_txn(&mut self, manager: &TxnManager, txn_id: TxnId) {
        self.map.retain(|_, ops| {
            ops.retain(|op_id| {
                manager
                    .op(*op_id)
                    .map(|op| op.txn_id != txn_id)
                    .unwrap_or(false)
            });
            !ops.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::txn_flags;

    fn record(
        manager: &mut TxnManager,
        index: &mut OpIndex,
        txn: TxnId,
        kind: OpKind,
        key: &[u8],
        rec: &[u8],
    ) -> OpId {
        let op = manager.record_op(txn, 1, kind, key.to_vec(), rec.to_vec(), 0, 0, (0, 0), 1);
        index.append(manager, key, op);
        op
    }

    #[test]
    fn conflict_with_other_active_txn() {
        let mut manager = TxnManager::new();
        let mut index = OpIndex::new(KeyType::Binary);

        let t1 = manager.begin(0, 1);
        let t2 = manager.begin(0, 2);
        record(&mut manager, &mut index, t1, OpKind::Insert, b"k", b"v");

        assert!(index.conflict_check(&manager, b"k", Some(t1)).is_ok());
        let err = index
            .conflict_check(&manager, b"k", Some(t2))
            .unwrap_err();
        assert_eq!(crate::error::kind_of(&err), Some(ErrorKind::TxnConflict));
        assert!(index.conflict_check(&manager, b"other", Some(t2)).is_ok());
    }

    #[test]
    fn aborted_ops_do_not_conflict() {
        let mut manager = TxnManager::new();
        let mut index = OpIndex::new(KeyType::Binary);

        let t1 = manager.begin(0, 1);
        record(&mut manager, &mut index, t1, OpKind::Insert, b"k", b"v");
        manager.set_aborted(t1);

        let t2 = manager.begin(0, 2);
        assert!(index.conflict_check(&manager, b"k", Some(t2)).is_ok());
    }

    #[test]
    fn same_txn_overwrite_collapses() {
        let mut manager = TxnManager::new();
        let mut index = OpIndex::new(KeyType::Binary);

        let t1 = manager.begin(0, 1);
        let first = record(&mut manager, &mut index, t1, OpKind::Insert, b"k", b"v1");
        record(
            &mut manager,
            &mut index,
            t1,
            OpKind::InsertOverwrite,
            b"k",
            b"v2",
        );

        assert_eq!(manager.op(first).unwrap().record, b"v2");
        match index.visibility(&manager, b"k", Some(t1)) {
            Visibility::Inserted(op) => assert_eq!(op, first),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn erase_shadows_and_navigation_respects_comparator() {
        let mut manager = TxnManager::new();
        let mut index = OpIndex::new(KeyType::U32);

        let t1 = manager.begin(txn_flags::TEMPORARY, 1);
        record(
            &mut manager,
            &mut index,
            t1,
            OpKind::Insert,
            &10u32.to_le_bytes(),
            b"a",
        );
        record(
            &mut manager,
            &mut index,
            t1,
            OpKind::Erase,
            &2u32.to_le_bytes(),
            b"",
        );

        // numeric order: 2 before 10 even though lexicographic order differs
        let (key, visible) = index.next_visible(&manager, Some(t1), None).unwrap();
        assert_eq!(key, 2u32.to_le_bytes());
        assert!(matches!(visible, Visibility::Erased(_)));

        let (key, _) = index
            .next_visible(&manager, Some(t1), Some(&2u32.to_le_bytes()))
            .unwrap();
        assert_eq!(key, 10u32.to_le_bytes());

        let (key, _) = index.prev_visible(&manager, Some(t1), None).unwrap();
        assert_eq!(key, 10u32.to_le_bytes());
    }

    #[test]
    fn other_txns_pending_ops_are_invisible() {
        let mut manager = TxnManager::new();
        let mut index = OpIndex::new(KeyType::Binary);

        let t1 = manager.begin(0, 1);
        record(&mut manager, &mut index, t1, OpKind::Insert, b"k", b"v");

        let t2 = manager.begin(0, 2);
        assert_eq!(
            index.visibility(&manager, b"k", Some(t2)),
            Visibility::Unchanged
        );
        assert_eq!(index.visibility(&manager, b"k", None), Visibility::Unchanged);
        assert!(index.next_visible(&manager, Some(t2), None).is_none());
    }

    #[test]
    fn prune_txn_empties_the_index() {
        let mut manager = TxnManager::new();
        let mut index = OpIndex::new(KeyType::Binary);

        let t1 = manager.begin(0, 1);
        record(&mut manager, &mut index, t1, OpKind::Insert, b"a", b"1");
        record(&mut manager, &mut index, t1, OpKind::Insert, b"b", b"2");

        index.prune_txn(&manager, t1);
        assert!(index.is_empty());
    }
}
