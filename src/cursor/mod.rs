//! # Cursors
//!
//! A cursor is a dual-coupled iterator: its position is either a direct
//! B-tree coupling `(page, slot, duplicate)` or a pending transactional
//! operation of its own transaction. Ordered traversal merges both
//! sources on the fly.
//!
//! ## States
//!
//! ```text
//!            insert/find               commit/abort of txn
//! nil ─────────────────────► coupled-btree ◄─────────────► coupled-txn-op
//!   ▲                           │                │
//!   │                       uncouple         set_to_nil
//!   │                           ▼                ▼
//!   └───────────── uncoupled ◄──┴────────────── nil
//! ```
//!
//! An uncoupled cursor carries a materialised copy of its key and
//! re-seeks lazily on the next use; splits and merges uncouple every
//! cursor on the affected page. `is_first_use` makes the first NEXT
//! behave as FIRST (and PREVIOUS as LAST) on a fresh cursor.
//!
//! ## Merge semantics
//!
//! A directional move advances both sides in comparator order and picks
//! the smaller (NEXT) / greater (PREVIOUS) candidate. Ties resolve to
//! the transaction side, which shadows the tree. An erase-op in the
//! winning position hides its key: both sides skip it and the walk
//! continues. Because every step is computed relative to the cursor's
//! current logical key, a direction change needs no explicit re-seating
//! and keys inserted behind the cursor by its own transaction are never
//! revisited.
//!
//! ## Cursor registry
//!
//! All open cursors of a database live in one registry; the B-tree walks
//! it on every in-place mutation to shift, nil or uncouple affected
//! cursors. Pages do not hold cursor back-pointers.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;

use crate::blob::BlobManager;
use crate::btree::BtreeIndex;
use crate::config::{db_flags, op_flags};
use crate::error::ErrorKind;
use crate::page::Page;
use crate::pager::{Context, PageManager};
use crate::txn::{OpId, OpIndex, TxnId, TxnManager, Visibility};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMove {
    First,
    Last,
    Next,
    Previous,
}

#[derive(Clone)]
pub struct BtreeCoupling {
    pub page: Arc<Page>,
    pub slot: u32,
    pub dup: u32,
}

#[derive(Clone, Default)]
pub enum CursorState {
    #[default]
    Nil,
    Btree(BtreeCoupling),
    TxnOp(OpId),
    Uncoupled {
        key: Vec<u8>,
        dup: u32,
    },
}

pub struct CursorInner {
    pub id: u64,
    pub txn: Option<TxnId>,
    pub state: CursorState,
    pub is_first_use: bool,
}

impl CursorInner {
    pub fn set_to_nil(&mut self) {
        self.state = CursorState::Nil;
        self.is_first_use = true;
    }
}

#[derive(Default)]
pub struct CursorRegistry {
    map: HashMap<u64, CursorInner>,
    next_id: u64,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, txn: Option<TxnId>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.map.insert(
            id,
            CursorInner {
                id,
                txn,
                state: CursorState::Nil,
                is_first_use: true,
            },
        );
        id
    }

    /// Clones a cursor into a sibling with the same state; the clone
    /// moves independently afterwards.
    pub fn clone_cursor(&mut self, id: u64) -> Option<u64> {
        let (txn, state, first) = {
            let cursor = self.map.get(&id)?;
            (cursor.txn, cursor.state.clone(), cursor.is_first_use)
        };
        self.next_id += 1;
        let clone_id = self.next_id;
        self.map.insert(
            clone_id,
            CursorInner {
                id: clone_id,
                txn,
                state,
                is_first_use: first,
            },
        );
        Some(clone_id)
    }

    pub fn close(&mut self, id: u64) {
        self.map.remove(&id);
    }

    pub fn get(&self, id: u64) -> Option<&CursorInner> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut CursorInner> {
        self.map.get_mut(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.map.keys().copied()
    }

    /// True if any cursor is coupled to a pending op of `txn_id`
    /// (commit/abort must fail with `CursorStillOpen` then).
    pub fn any_coupled_to_txn(&self, manager: &TxnManager, txn_id: TxnId) -> bool {
        self.map.values().any(|cursor| match cursor.state {
            CursorState::TxnOp(op) => manager
                .op(op)
                .map(|op| op.txn_id == txn_id)
                .unwrap_or(false),
            _ => false,
        })
    }

    /// Uncouples every cursor coupled to an op of `txn_id`, materialising
    /// the op's key (commit flush path).
    pub fn uncouple_from_txn(&mut self, manager: &TxnManager, txn_id: TxnId) {
        for cursor in self.map.values_mut() {
            if let CursorState::TxnOp(op_id) = cursor.state {
                if let Some(op) = manager.op(op_id) {
                    if op.txn_id == txn_id {
                        cursor.state = CursorState::Uncoupled {
                            key: op.key.clone(),
                            dup: 0,
                        };
                    }
                }
            }
        }
    }

    /// Nils every cursor coupled to an op of `txn_id` (abort path).
    pub fn nil_on_txn(&mut self, manager: &TxnManager, txn_id: TxnId) {
        for cursor in self.map.values_mut() {
            if let CursorState::TxnOp(op_id) = cursor.state {
                let owned = manager
                    .op(op_id)
                    .map(|op| op.txn_id == txn_id)
                    .unwrap_or(true);
                if owned {
                    cursor.set_to_nil();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // b-tree adjustment hooks
    // ------------------------------------------------------------------

    /// Slots on `page` that have at least one coupled cursor.
    pub fn slots_on_page(&self, page: u64) -> Vec<u32> {
        let mut slots: Vec<u32> = self
            .map
            .values()
            .filter_map(|cursor| match &cursor.state {
                CursorState::Btree(c) if c.page.address() == page => Some(c.slot),
                _ => None,
            })
            .collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    /// Uncouples every cursor on `page` using the materialised keys the
    /// b-tree read out beforehand.
    pub fn uncouple_page(&mut self, page: u64, keys: &HashMap<u32, Vec<u8>>) {
        for cursor in self.map.values_mut() {
            if let CursorState::Btree(c) = &cursor.state {
                if c.page.address() == page {
                    if let Some(key) = keys.get(&c.slot) {
                        cursor.state = CursorState::Uncoupled {
                            key: key.clone(),
                            dup: c.dup,
                        };
                    } else {
                        cursor.set_to_nil();
                    }
                }
            }
        }
    }

    /// A key was inserted at `slot`: couplings at or above it shift up.
    pub fn adjust_after_insert(&mut self, page: u64, slot: usize) {
        for cursor in self.map.values_mut() {
            if let CursorState::Btree(c) = &mut cursor.state {
                if c.page.address() == page && c.slot >= slot as u32 {
                    c.slot += 1;
                }
            }
        }
    }

    /// A key was erased at `slot`: couplings exactly there become nil,
    /// higher slots decrement.
    pub fn adjust_after_erase(&mut self, page: u64, slot: u32) {
        for cursor in self.map.values_mut() {
            if let CursorState::Btree(c) = &mut cursor.state {
                if c.page.address() != page {
                    continue;
                }
                if c.slot == slot {
                    cursor.set_to_nil();
                } else if c.slot > slot {
                    c.slot -= 1;
                }
            }
        }
    }

    /// One duplicate was erased: same duplicate nils, higher duplicates
    /// decrement, other slots are untouched.
    pub fn adjust_after_dup_erase(&mut self, page: u64, slot: u32, dup: u32) {
        for cursor in self.map.values_mut() {
            if let CursorState::Btree(c) = &mut cursor.state {
                if c.page.address() != page || c.slot != slot {
                    continue;
                }
                if c.dup == dup {
                    cursor.set_to_nil();
                } else if c.dup > dup {
                    c.dup -= 1;
                }
            }
        }
    }

    pub fn nil_on_page(&mut self, page: u64) {
        for cursor in self.map.values_mut() {
            if let CursorState::Btree(c) = &cursor.state {
                if c.page.address() == page {
                    cursor.set_to_nil();
                }
            }
        }
    }

    pub fn nil_all(&mut self) {
        for cursor in self.map.values_mut() {
            cursor.set_to_nil();
        }
    }
}

// ----------------------------------------------------------------------
// merge traversal
// ----------------------------------------------------------------------

/// One side's candidate during a merge step.
enum Candidate {
    Btree { key: Vec<u8>, page: Arc<Page>, slot: u32 },
    Txn { key: Vec<u8>, visible: Visibility },
}

impl Candidate {
    fn key(&self) -> &[u8] {
        match self {
            Candidate::Btree { key, .. } | Candidate::Txn { key, .. } => key,
        }
    }
}

/// The logical key a cursor currently stands on, if any.
#[allow(clippy::too_many_arguments)]
pub fn current_key(
    ctx: &mut Context,
    pager: &mut PageManager,
    blobs: &mut BlobManager,
    btree: &BtreeIndex,
    txns: &TxnManager,
    cursors: &CursorRegistry,
    id: u64,
) -> Result<Option<Vec<u8>>> {
    let cursor = cursors
        .get(id)
        .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))?;
    match &cursor.state {
        CursorState::Nil => Ok(None),
        CursorState::Uncoupled { key, .. } => Ok(Some(key.clone())),
        CursorState::TxnOp(op_id) => Ok(txns.op(*op_id).map(|op| op.key.clone())),
        CursorState::Btree(c) => Ok(Some(btree.key_at(
            ctx,
            pager,
            blobs,
            &c.page,
            c.slot as usize,
        )?)),
    }
}

/// Reads the record under the cursor without moving it.
#[allow(clippy::too_many_arguments)]
pub fn current_record(
    ctx: &mut Context,
    pager: &mut PageManager,
    blobs: &mut BlobManager,
    btree: &BtreeIndex,
    txns: &TxnManager,
    cursors: &CursorRegistry,
    id: u64,
) -> Result<Option<Vec<u8>>> {
    let cursor = cursors
        .get(id)
        .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))?;
    match &cursor.state {
        CursorState::Nil | CursorState::Uncoupled { .. } => Ok(None),
        CursorState::TxnOp(op_id) => Ok(txns.op(*op_id).map(|op| op.record.clone())),
        CursorState::Btree(c) => Ok(Some(btree.record_at(
            ctx,
            pager,
            blobs,
            &c.page,
            c.slot as usize,
            c.dup,
        )?)),
    }
}

/// Seeks `key` exactly, merging the transaction's pending view over the
/// tree. Couples the cursor on success.
#[allow(clippy::too_many_arguments)]
pub fn cursor_find(
    ctx: &mut Context,
    pager: &mut PageManager,
    blobs: &mut BlobManager,
    btree: &BtreeIndex,
    ops: &OpIndex,
    txns: &TxnManager,
    cursors: &mut CursorRegistry,
    id: u64,
    key: &[u8],
    flags: u32,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let txn = cursors
        .get(id)
        .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))?
        .txn;

    // exact view first
    match ops.visibility(txns, key, txn) {
        Visibility::Inserted(op_id) => {
            if flags & (op_flags::FIND_LT_MATCH | op_flags::FIND_GT_MATCH) == 0
                || flags & (op_flags::FIND_LEQ_MATCH | op_flags::FIND_GEQ_MATCH) != 0
            {
                let record = txns.op(op_id).map(|op| op.record.clone()).unwrap_or_default();
                let cursor = cursors.get_mut(id).expect("cursor exists");
                cursor.state = CursorState::TxnOp(op_id);
                cursor.is_first_use = false;
                return Ok(Some((key.to_vec(), record)));
            }
        }
        Visibility::Erased(_) => {
            if flags & op_flags::FIND_NEAR_MATCH == 0 {
                return Ok(None);
            }
        }
        Visibility::Unchanged => {
            if flags & op_flags::FIND_NEAR_MATCH == 0
                || flags & (op_flags::FIND_LEQ_MATCH | op_flags::FIND_GEQ_MATCH) != 0
            {
                if let Some((page, slot)) = btree.find(ctx, pager, blobs, key, 0)? {
                    let found = btree.key_at(ctx, pager, blobs, &page, slot)?;
                    let record = btree.record_at(ctx, pager, blobs, &page, slot, 0)?;
                    let cursor = cursors.get_mut(id).expect("cursor exists");
                    cursor.state = CursorState::Btree(BtreeCoupling {
                        page,
                        slot: slot as u32,
                        dup: 0,
                    });
                    cursor.is_first_use = false;
                    return Ok(Some((found, record)));
                }
                if flags & op_flags::FIND_NEAR_MATCH == 0 {
                    return Ok(None);
                }
            }
        }
    }

    // approximate match resolves to one merge step from the lookup key
    if flags & (op_flags::FIND_LT_MATCH | op_flags::FIND_LEQ_MATCH) != 0 {
        step(
            ctx, pager, blobs, btree, ops, txns, cursors, id, Some(key), false,
        )
    } else if flags & (op_flags::FIND_GT_MATCH | op_flags::FIND_GEQ_MATCH) != 0 {
        step(
            ctx, pager, blobs, btree, ops, txns, cursors, id, Some(key), true,
        )
    } else {
        Ok(None)
    }
}

/// Moves the cursor. Returns the new `(key, record)` or `None` at the
/// end of traversal (the cursor keeps its position then).
#[allow(clippy::too_many_arguments)]
pub fn cursor_move(
    ctx: &mut Context,
    pager: &mut PageManager,
    blobs: &mut BlobManager,
    btree: &BtreeIndex,
    ops: &OpIndex,
    txns: &TxnManager,
    cursors: &mut CursorRegistry,
    id: u64,
    mov: CursorMove,
    skip_duplicates: bool,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let (is_first_use, state_is_nil) = {
        let cursor = cursors
            .get(id)
            .ok_or_else(|| eyre::Report::new(ErrorKind::InvalidArg))?;
        (
            cursor.is_first_use,
            matches!(cursor.state, CursorState::Nil),
        )
    };

    let mov = match mov {
        CursorMove::Next if is_first_use && state_is_nil => CursorMove::First,
        CursorMove::Previous if is_first_use && state_is_nil => CursorMove::Last,
        other => other,
    };

    match mov {
        CursorMove::First => step(ctx, pager, blobs, btree, ops, txns, cursors, id, None, true),
        CursorMove::Last => step(ctx, pager, blobs, btree, ops, txns, cursors, id, None, false),
        CursorMove::Next => {
            // duplicates of the current key come first
            if !skip_duplicates {
                if let Some(result) =
                    next_duplicate(ctx, pager, blobs, btree, cursors, id)?
                {
                    return Ok(Some(result));
                }
            }
            let Some(key) = current_key(ctx, pager, blobs, btree, txns, cursors, id)? else {
                eyre::bail!(ErrorKind::InvalidArg);
            };
            step(
                ctx, pager, blobs, btree, ops, txns, cursors, id, Some(&key), true,
            )
        }
        CursorMove::Previous => {
            if !skip_duplicates {
                if let Some(result) = prev_duplicate(ctx, pager, blobs, btree, cursors, id)? {
                    return Ok(Some(result));
                }
            }
            let Some(key) = current_key(ctx, pager, blobs, btree, txns, cursors, id)? else {
                eyre::bail!(ErrorKind::InvalidArg);
            };
            step(
                ctx, pager, blobs, btree, ops, txns, cursors, id, Some(&key), false,
            )
        }
    }
}

/// Advances to the next duplicate of the current b-tree coupling, if one
/// exists.
fn next_duplicate(
    ctx: &mut Context,
    pager: &mut PageManager,
    blobs: &mut BlobManager,
    btree: &BtreeIndex,
    cursors: &mut CursorRegistry,
    id: u64,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let coupling = match &cursors.get(id).expect("cursor exists").state {
        CursorState::Btree(c) => c.clone(),
        _ => return Ok(None),
    };
    let dups = btree.dup_count_at(ctx, pager, blobs, &coupling.page, coupling.slot as usize)?;
    if coupling.dup + 1 >= dups {
        return Ok(None);
    }

    let key = btree.key_at(ctx, pager, blobs, &coupling.page, coupling.slot as usize)?;
    let record = btree.record_at(
        ctx,
        pager,
        blobs,
        &coupling.page,
        coupling.slot as usize,
        coupling.dup + 1,
    )?;
    if let Some(cursor) = cursors.get_mut(id) {
        if let CursorState::Btree(c) = &mut cursor.state {
            c.dup += 1;
        }
    }
    Ok(Some((key, record)))
}

/// Steps back to the previous duplicate of the current b-tree coupling.
fn prev_duplicate(
    ctx: &mut Context,
    pager: &mut PageManager,
    blobs: &mut BlobManager,
    btree: &BtreeIndex,
    cursors: &mut CursorRegistry,
    id: u64,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let coupling = match &cursors.get(id).expect("cursor exists").state {
        CursorState::Btree(c) if c.dup > 0 => c.clone(),
        _ => return Ok(None),
    };

    let key = btree.key_at(ctx, pager, blobs, &coupling.page, coupling.slot as usize)?;
    let record = btree.record_at(
        ctx,
        pager,
        blobs,
        &coupling.page,
        coupling.slot as usize,
        coupling.dup - 1,
    )?;
    if let Some(cursor) = cursors.get_mut(id) {
        if let CursorState::Btree(c) = &mut cursor.state {
            c.dup -= 1;
        }
    }
    Ok(Some((key, record)))
}

/// One merge step: the smallest key strictly above `after` (forward) or
/// the greatest strictly below (backward); `None` seeks from the
/// respective end. Erase-shadowed and aborted positions are skipped.
#[allow(clippy::too_many_arguments)]
fn step(
    ctx: &mut Context,
    pager: &mut PageManager,
    blobs: &mut BlobManager,
    btree: &BtreeIndex,
    ops: &OpIndex,
    txns: &TxnManager,
    cursors: &mut CursorRegistry,
    id: u64,
    after: Option<&[u8]>,
    forward: bool,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let txn = cursors.get(id).expect("cursor exists").txn;
    let mut bound: Option<Vec<u8>> = after.map(<[u8]>::to_vec);

    loop {
        let btree_cand = btree_candidate(ctx, pager, blobs, btree, bound.as_deref(), forward)?;
        let txn_cand = ops
            .visible_neighbor(txns, txn, bound.as_deref(), forward)
            .map(|(key, visible)| Candidate::Txn { key, visible });

        let winner = match (btree_cand, txn_cand) {
            (None, None) => return Ok(None),
            (Some(b), None) => b,
            (None, Some(t)) => t,
            (Some(b), Some(t)) => {
                let ord = btree.compare(t.key(), b.key());
                let txn_wins = if forward {
                    ord != std::cmp::Ordering::Greater
                } else {
                    ord != std::cmp::Ordering::Less
                };
                if txn_wins {
                    t
                } else {
                    b
                }
            }
        };

        match winner {
            Candidate::Txn { key, visible } => match visible {
                Visibility::Erased(_) => {
                    // shadowed out; skip this logical key on both sides
                    bound = Some(key);
                    continue;
                }
                Visibility::Inserted(op_id) => {
                    let record = txns.op(op_id).map(|op| op.record.clone()).unwrap_or_default();
                    let cursor = cursors.get_mut(id).expect("cursor exists");
                    cursor.state = CursorState::TxnOp(op_id);
                    cursor.is_first_use = false;
                    return Ok(Some((key, record)));
                }
                Visibility::Unchanged => unreachable!("neighbor search never yields Unchanged"),
            },
            Candidate::Btree { key, page, slot } => {
                let dup = if forward {
                    0
                } else {
                    let dups =
                        btree.dup_count_at(ctx, pager, blobs, &page, slot as usize)?;
                    dups.saturating_sub(1)
                };
                let record = btree.record_at(ctx, pager, blobs, &page, slot as usize, dup)?;
                let cursor = cursors.get_mut(id).expect("cursor exists");
                cursor.state = CursorState::Btree(BtreeCoupling { page, slot, dup });
                cursor.is_first_use = false;
                return Ok(Some((key, record)));
            }
        }
    }
}

/// The tree-side candidate next to `bound`.
fn btree_candidate(
    ctx: &mut Context,
    pager: &mut PageManager,
    blobs: &mut BlobManager,
    btree: &BtreeIndex,
    bound: Option<&[u8]>,
    forward: bool,
) -> Result<Option<Candidate>> {
    let position = match bound {
        Some(key) => {
            let flags = if forward {
                op_flags::FIND_GT_MATCH
            } else {
                op_flags::FIND_LT_MATCH
            };
            btree.find(ctx, pager, blobs, key, flags)?
        }
        None => {
            if forward {
                btree.first_slot(ctx, pager)?
            } else {
                btree.last_slot(ctx, pager)?
            }
        }
    };

    Ok(match position {
        Some((page, slot)) => {
            let key = btree.key_at(ctx, pager, blobs, &page, slot)?;
            Some(Candidate::Btree {
                key,
                page,
                slot: slot as u32,
            })
        }
        None => None,
    })
}

/// Whether the database stores one record per key or a duplicate list;
/// cursor erase picks the duplicate-precise path accordingly.
pub fn erase_dup_index(btree: &BtreeIndex, coupling: &BtreeCoupling) -> Option<u32> {
    if btree.cfg().has(db_flags::ENABLE_DUPLICATE_KEYS) {
        Some(coupling.dup)
    } else {
        None
    }
}

/// Materialises the key of a b-tree coupling so the cursor can uncouple
/// before a fallback keyed erase.
pub fn uncouple(
    ctx: &mut Context,
    pager: &mut PageManager,
    blobs: &mut BlobManager,
    btree: &BtreeIndex,
    cursors: &mut CursorRegistry,
    id: u64,
) -> Result<()> {
    let coupling = match &cursors.get(id).expect("cursor exists").state {
        CursorState::Btree(c) => c.clone(),
        _ => return Ok(()),
    };
    let key = btree.key_at(ctx, pager, blobs, &coupling.page, coupling.slot as usize)?;
    let cursor = cursors.get_mut(id).expect("cursor exists");
    cursor.state = CursorState::Uncoupled {
        key,
        dup: coupling.dup,
    };
    Ok(())
}

