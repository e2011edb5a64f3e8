//! # B-Tree Insert Path
//!
//! Descends root-to-leaf, splitting every full node on the way down so
//! the target leaf and each touched parent are guaranteed to have room
//! (proactive split). The split pivot is the median slot; a leaf split
//! copies the right sibling's first key up as the separator, an internal
//! split promotes the pivot cell itself.
//!
//! The append-hint fast path (`HINT_APPEND`) bypasses the descent when
//! the key provably sorts after everything in the right-most leaf.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use tracing::trace;

use crate::blob::{dup_table, BlobManager};
use crate::config::{db_flags, op_flags, KEY_INLINE_MAX, PAGE_HEADER_SIZE};
use crate::cursor::CursorRegistry;
use crate::error::ErrorKind;
use crate::page::{Page, PageType};
use crate::pager::{Context, PageManager};

use super::keylist::{KeyList, KeySource};
use super::node::{split_internal_cells, split_leaf_cells, Node, NodeMut};
use super::recordlist::{RecordList, RecordRef, RecordSource};
use super::{BtreeIndex, SearchResult};

/// Where the key landed.
pub struct InsertOutcome {
    pub page: Arc<Page>,
    pub slot: usize,
    pub dup_index: u32,
}

/// Separator handed to the parent after a split.
enum ParentKey {
    /// Leaf split: a fresh copy of the right sibling's first key.
    Bytes(Vec<u8>),
    /// Internal split: the pivot's raw cell, ownership moves upward.
    RawCell(Vec<u8>),
}

/// New record encoded for a cell write.
enum OwnedRecord {
    Inline(Vec<u8>),
    Blob(u64),
    Fixed(Vec<u8>),
}

impl BtreeIndex {
    pub fn insert(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        cursors: &mut CursorRegistry,
        key: &[u8],
        record: &[u8],
        flags: u32,
        cursor_dup: Option<u32>,
    ) -> Result<InsertOutcome> {
        self.validate_key(key)?;
        if let RecordList::Fixed { size } = self.layout().leaf_records {
            ensure!(record.len() == size, ErrorKind::InvalidRecordSize);
        }

        if flags & op_flags::HINT_APPEND != 0 {
            if let Some(outcome) =
                self.try_append(ctx, pager, blobs, cursors, key, record, flags)?
            {
                return Ok(outcome);
            }
        }
        if flags & op_flags::HINT_PREPEND != 0 {
            self.stats_mut().prepend_hints += 1;
        }

        let mut address = self.root();
        let mut parent: Option<Arc<Page>> = None;
        loop {
            let page = pager.fetch(ctx, address, 0)?;
            let (is_leaf, is_full) = {
                let data = page.data();
                let node = Node::new(&data[PAGE_HEADER_SIZE..], self.layout());
                (node.is_leaf(), node.is_full())
            };

            if is_full {
                match parent.as_ref() {
                    None => {
                        self.split_root(ctx, pager, blobs, cursors)?;
                        address = self.root();
                        continue;
                    }
                    Some(parent_page) => {
                        let parent_page = Arc::clone(parent_page);
                        self.split_child(ctx, pager, blobs, cursors, &parent_page, &page)?;
                        let idx = self.descend_index(ctx, pager, blobs, &parent_page, key)?;
                        address = {
                            let data = parent_page.data();
                            Node::new(&data[PAGE_HEADER_SIZE..], self.layout()).child_at(idx)
                        };
                        continue;
                    }
                }
            }

            if is_leaf {
                return self.insert_into_leaf(
                    ctx, pager, blobs, cursors, &page, key, record, flags, cursor_dup,
                );
            }

            let idx = self.descend_index(ctx, pager, blobs, &page, key)?;
            address = {
                let data = page.data();
                Node::new(&data[PAGE_HEADER_SIZE..], self.layout()).child_at(idx)
            };
            parent = Some(page);
        }
    }

    /// Append fast path: the key goes straight to the right-most leaf
    /// when it sorts after that leaf's last key and the leaf has room.
    fn try_append(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        cursors: &mut CursorRegistry,
        key: &[u8],
        record: &[u8],
        flags: u32,
    ) -> Result<Option<InsertOutcome>> {
        let address = self.stats().last_leaf;
        if address == 0 {
            return Ok(None);
        }
        let page = pager.fetch(ctx, address, 0)?;
        let (usable, count) = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], self.layout());
            (
                node.is_leaf() && !node.is_full() && node.right_sibling() == 0 && node.count() > 0,
                node.count(),
            )
        };
        if !usable {
            return Ok(None);
        }
        let last = self.key_at(ctx, pager, blobs, &page, count - 1)?;
        if self.compare(key, &last) != std::cmp::Ordering::Greater {
            return Ok(None);
        }

        self.stats_mut().append_hits += 1;
        trace!(address, "append-hint fast path");
        self.insert_into_leaf(ctx, pager, blobs, cursors, &page, key, record, flags, None)
            .map(Some)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_into_leaf(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        cursors: &mut CursorRegistry,
        page: &Arc<Page>,
        key: &[u8],
        record: &[u8],
        flags: u32,
        cursor_dup: Option<u32>,
    ) -> Result<InsertOutcome> {
        match self.search_node(ctx, pager, blobs, page, key)? {
            SearchResult::Found(slot) => {
                if flags & op_flags::OVERWRITE != 0 {
                    let dup = cursor_dup.unwrap_or(0);
                    self.overwrite_record(ctx, pager, blobs, page, slot, dup, record)?;
                    Ok(InsertOutcome {
                        page: Arc::clone(page),
                        slot,
                        dup_index: dup,
                    })
                } else if flags
                    & (op_flags::DUPLICATE
                        | op_flags::DUPLICATE_INSERT_BEFORE
                        | op_flags::DUPLICATE_INSERT_AFTER
                        | op_flags::DUPLICATE_INSERT_FIRST
                        | op_flags::DUPLICATE_INSERT_LAST)
                    != 0
                {
                    let dup =
                        self.add_duplicate(ctx, pager, blobs, page, slot, record, flags, cursor_dup)?;
                    Ok(InsertOutcome {
                        page: Arc::clone(page),
                        slot,
                        dup_index: dup,
                    })
                } else {
                    bail!(ErrorKind::DuplicateKey)
                }
            }
            SearchResult::NotFound(idx) => {
                let overflow = self.key_overflow(ctx, pager, blobs, key)?;
                let owned = self.encode_record(ctx, pager, blobs, record)?;
                {
                    let mut data = page.data_mut();
                    let mut node = NodeMut::new(&mut data[PAGE_HEADER_SIZE..], self.layout());
                    node.insert_gap(idx);
                    match overflow {
                        Some(blob_id) => node.write_key(
                            idx,
                            KeySource::Overflow {
                                blob_id,
                                size: key.len() as u32,
                            },
                        )?,
                        None => node.write_key(idx, KeySource::Inline(key))?,
                    }
                    write_owned_record(&mut node, idx, &owned)?;
                }
                page.set_dirty();
                cursors.adjust_after_insert(page.address(), idx);

                let is_last_leaf = {
                    let data = page.data();
                    Node::new(&data[PAGE_HEADER_SIZE..], self.layout()).right_sibling() == 0
                };
                if is_last_leaf {
                    self.stats_mut().last_leaf = page.address();
                }

                Ok(InsertOutcome {
                    page: Arc::clone(page),
                    slot: idx,
                    dup_index: 0,
                })
            }
        }
    }

    /// Replaces the record of an existing key; never moves the cursor
    /// and never changes the duplicate count.
    pub(crate) fn overwrite_record(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        page: &Arc<Page>,
        slot: usize,
        dup_index: u32,
        record: &[u8],
    ) -> Result<()> {
        let old = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], self.layout());
            match node.record_ref(slot) {
                RecordRef::Inline(_) => OldRecord::Inline,
                RecordRef::Fixed(_) => OldRecord::Fixed,
                RecordRef::Blob(id) => OldRecord::Blob(id),
                RecordRef::DupTable(id) => OldRecord::DupTable(id),
            }
        };

        match old {
            OldRecord::DupTable(table_id) => {
                dup_table::overwrite(blobs, pager, ctx, table_id, dup_index, record)?;
            }
            OldRecord::Blob(blob_id) => {
                ensure!(dup_index == 0, ErrorKind::KeyNotFound);
                if record.len() <= crate::config::RECORD_INLINE_MAX {
                    blobs.erase(pager, ctx, blob_id)?;
                    self.write_record_cell(page, slot, RecordSource::Inline(record))?;
                } else {
                    let new_id = blobs.overwrite(pager, ctx, blob_id, record)?;
                    if new_id != blob_id {
                        self.write_record_cell(page, slot, RecordSource::Blob(new_id))?;
                    }
                }
            }
            OldRecord::Inline | OldRecord::Fixed => {
                ensure!(dup_index == 0, ErrorKind::KeyNotFound);
                let owned = self.encode_record(ctx, pager, blobs, record)?;
                let mut data = page.data_mut();
                let mut node = NodeMut::new(&mut data[PAGE_HEADER_SIZE..], self.layout());
                write_owned_record(&mut node, slot, &owned)?;
            }
        }
        page.set_dirty();
        Ok(())
    }

    /// Adds a duplicate record for an existing key, creating the
    /// duplicate table on the second record.
    #[allow(clippy::too_many_arguments)]
    fn add_duplicate(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        page: &Arc<Page>,
        slot: usize,
        record: &[u8],
        flags: u32,
        cursor_dup: Option<u32>,
    ) -> Result<u32> {
        ensure!(
            self.cfg().has(db_flags::ENABLE_DUPLICATE_KEYS),
            ErrorKind::InvalidArg
        );

        let old = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], self.layout());
            match node.record_ref(slot) {
                RecordRef::DupTable(id) => OldRecord::DupTable(id),
                RecordRef::Blob(id) => OldRecord::Blob(id),
                RecordRef::Inline(_) => OldRecord::Inline,
                RecordRef::Fixed(_) => OldRecord::Fixed,
            }
        };

        let dup = match old {
            OldRecord::DupTable(table_id) => {
                let count = dup_table::count(blobs, pager, ctx, table_id)?;
                let pos = duplicate_position(flags, cursor_dup, count);
                let new_table = dup_table::insert(blobs, pager, ctx, table_id, pos, record)?;
                if new_table != table_id {
                    self.write_record_cell(page, slot, RecordSource::DupTable(new_table))?;
                }
                pos
            }
            old => {
                // second record for this key: move both into a table
                let existing = self.record_at(ctx, pager, blobs, page, slot, 0)?;
                let pos = duplicate_position(flags, cursor_dup, 1);
                let entries: [&[u8]; 2] = if pos == 0 {
                    [record, &existing]
                } else {
                    [&existing, record]
                };
                let table_id = dup_table::create(blobs, pager, ctx, &entries)?;
                if let OldRecord::Blob(blob_id) = old {
                    blobs.erase(pager, ctx, blob_id)?;
                }
                self.write_record_cell(page, slot, RecordSource::DupTable(table_id))?;
                pos.min(1)
            }
        };
        page.set_dirty();
        Ok(dup)
    }

    // ------------------------------------------------------------------
    // splits
    // ------------------------------------------------------------------

    /// Grows the tree by one level: the old root splits and a fresh
    /// internal root takes its place.
    pub(super) fn split_root(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        cursors: &mut CursorRegistry,
    ) -> Result<()> {
        let old_root = pager.fetch(ctx, self.root(), 0)?;
        let is_leaf = {
            let data = old_root.data();
            Node::new(&data[PAGE_HEADER_SIZE..], self.layout()).is_leaf()
        };

        let right = pager.alloc(
            ctx,
            if is_leaf {
                PageType::BtreeLeaf
            } else {
                PageType::BtreeInternal
            },
            0,
        )?;
        right.set_db(self.dbname());
        let new_root = pager.alloc(ctx, PageType::BtreeRoot, 0)?;
        new_root.set_db(self.dbname());

        let parent_key = self.split_into(ctx, pager, blobs, cursors, &old_root, &right)?;

        {
            let mut data = new_root.data_mut();
            let mut node = NodeMut::init(&mut data[PAGE_HEADER_SIZE..], self.layout(), false);
            node.set_left_link(old_root.address());
            node.insert_gap(0);
            if let ParentKey::RawCell(cell) = &parent_key {
                node.write_raw_key_cell(0, cell);
            }
            node.set_child(1, right.address())?;
        }
        if let ParentKey::Bytes(bytes) = &parent_key {
            self.write_separator(ctx, pager, blobs, &new_root, 0, bytes)?;
        }
        new_root.set_dirty();
        old_root.set_page_type(if is_leaf {
            PageType::BtreeLeaf
        } else {
            PageType::BtreeInternal
        });
        self.root = new_root.address();
        self.stats_mut().splits += 1;
        Ok(())
    }

    /// Splits a full child; the parent is guaranteed to have room.
    pub(super) fn split_child(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        cursors: &mut CursorRegistry,
        parent: &Arc<Page>,
        child: &Arc<Page>,
    ) -> Result<()> {
        let is_leaf = {
            let data = child.data();
            Node::new(&data[PAGE_HEADER_SIZE..], self.layout()).is_leaf()
        };

        let right = pager.alloc(
            ctx,
            if is_leaf {
                PageType::BtreeLeaf
            } else {
                PageType::BtreeInternal
            },
            0,
        )?;
        right.set_db(self.dbname());

        let parent_key = self.split_into(ctx, pager, blobs, cursors, child, &right)?;

        // hang the separator into the parent right of the child pointer
        let j = self.child_position(parent, child.address())?;
        {
            let mut data = parent.data_mut();
            let mut node = NodeMut::new(&mut data[PAGE_HEADER_SIZE..], self.layout());
            node.insert_gap(j);
            if let ParentKey::RawCell(cell) = &parent_key {
                node.write_raw_key_cell(j, cell);
                node.write_record(j, RecordSource::Blob(right.address()))?;
            }
        }
        if let ParentKey::Bytes(bytes) = &parent_key {
            self.write_separator(ctx, pager, blobs, parent, j, bytes)?;
            let mut data = parent.data_mut();
            let mut node = NodeMut::new(&mut data[PAGE_HEADER_SIZE..], self.layout());
            node.write_record(j, RecordSource::Blob(right.address()))?;
        }
        parent.set_dirty();
        self.stats_mut().splits += 1;
        Ok(())
    }

    /// Moves the upper half of `left` into the freshly allocated `right`
    /// and returns the separator for the parent. Cursors coupled to a
    /// splitting leaf are uncoupled first (they re-seek lazily).
    fn split_into(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        cursors: &mut CursorRegistry,
        left: &Arc<Page>,
        right: &Arc<Page>,
    ) -> Result<ParentKey> {
        let (is_leaf, count) = {
            let data = left.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], self.layout());
            (node.is_leaf(), node.count())
        };
        let pivot = count / 2;

        if is_leaf {
            self.uncouple_cursors_on(ctx, pager, blobs, cursors, left)?;
            let separator = self.key_at(ctx, pager, blobs, left, pivot)?;

            let old_right = {
                let mut left_data = left.data_mut();
                let mut right_data = right.data_mut();
                let mut l = NodeMut::new(&mut left_data[PAGE_HEADER_SIZE..], self.layout());
                let mut r =
                    NodeMut::init(&mut right_data[PAGE_HEADER_SIZE..], self.layout(), true);
                split_leaf_cells(&mut l, &mut r, pivot);

                let old_right = l.as_node().right_sibling();
                r.set_right_sibling(old_right);
                r.set_left_link(left.address());
                l.set_right_sibling(right.address());
                old_right
            };
            left.set_dirty();
            right.set_dirty();

            if old_right != 0 {
                let next = pager.fetch(ctx, old_right, 0)?;
                let mut data = next.data_mut();
                let mut node = NodeMut::new(&mut data[PAGE_HEADER_SIZE..], self.layout());
                node.set_left_link(right.address());
                drop(data);
                next.set_dirty();
            } else if self.stats().last_leaf == left.address() {
                self.stats_mut().last_leaf = right.address();
            }

            trace!(
                left = left.address(),
                right = right.address(),
                "split leaf at median"
            );
            Ok(ParentKey::Bytes(separator))
        } else {
            let raw = {
                let data = left.data();
                Node::new(&data[PAGE_HEADER_SIZE..], self.layout()).raw_key_cell(pivot)
            };
            {
                let mut left_data = left.data_mut();
                let mut right_data = right.data_mut();
                let mut l = NodeMut::new(&mut left_data[PAGE_HEADER_SIZE..], self.layout());
                let mut r =
                    NodeMut::init(&mut right_data[PAGE_HEADER_SIZE..], self.layout(), false);
                split_internal_cells(&mut l, &mut r, pivot);
            }
            left.set_dirty();
            right.set_dirty();
            trace!(
                left = left.address(),
                right = right.address(),
                "split internal node at median"
            );
            Ok(ParentKey::RawCell(raw))
        }
    }

    /// Writes a separator key (a fresh copy) into an internal node slot,
    /// spilling into a new overflow blob when it is too long.
    fn write_separator(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        page: &Arc<Page>,
        slot: usize,
        key: &[u8],
    ) -> Result<()> {
        let overflow = self.key_overflow(ctx, pager, blobs, key)?;
        let mut data = page.data_mut();
        let mut node = NodeMut::new(&mut data[PAGE_HEADER_SIZE..], self.layout());
        match overflow {
            Some(blob_id) => node.write_key(
                slot,
                KeySource::Overflow {
                    blob_id,
                    size: key.len() as u32,
                },
            ),
            None => node.write_key(slot, KeySource::Inline(key)),
        }
    }

    /// Index of the child pointer to `child_address` within `parent`.
    fn child_position(&self, parent: &Arc<Page>, child_address: u64) -> Result<usize> {
        let data = parent.data();
        let node = Node::new(&data[PAGE_HEADER_SIZE..], self.layout());
        for idx in 0..=node.count() {
            if node.child_at(idx) == child_address {
                return Ok(idx);
            }
        }
        bail!(ErrorKind::Internal)
    }

    /// Allocates an overflow blob for keys beyond the inline capacity of
    /// the variable key list.
    fn key_overflow(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        key: &[u8],
    ) -> Result<Option<u64>> {
        if matches!(self.layout().keys, KeyList::Variable) && key.len() > KEY_INLINE_MAX {
            Ok(Some(blobs.allocate(pager, ctx, key)?))
        } else {
            Ok(None)
        }
    }

    /// Encodes a record for a leaf cell: fixed bytes, inline bytes, or a
    /// blob reference.
    fn encode_record(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        record: &[u8],
    ) -> Result<OwnedRecord> {
        Ok(match self.layout().leaf_records {
            RecordList::Fixed { .. } => OwnedRecord::Fixed(record.to_vec()),
            _ => {
                if record.len() <= crate::config::RECORD_INLINE_MAX {
                    OwnedRecord::Inline(record.to_vec())
                } else {
                    OwnedRecord::Blob(blobs.allocate(pager, ctx, record)?)
                }
            }
        })
    }

    fn write_record_cell(
        &self,
        page: &Arc<Page>,
        slot: usize,
        record: RecordSource<'_>,
    ) -> Result<()> {
        let mut data = page.data_mut();
        let mut node = NodeMut::new(&mut data[PAGE_HEADER_SIZE..], self.layout());
        node.write_record(slot, record)
    }

    /// Uncouples every cursor coupled to `page`, materialising their keys
    /// so they can re-seek after the page is rearranged.
    pub(crate) fn uncouple_cursors_on(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        cursors: &mut CursorRegistry,
        page: &Arc<Page>,
    ) -> Result<()> {
        let slots = cursors.slots_on_page(page.address());
        if slots.is_empty() {
            return Ok(());
        }
        let mut keys: HashMap<u32, Vec<u8>> = HashMap::new();
        for slot in slots {
            let key = self.key_at(ctx, pager, blobs, page, slot as usize)?;
            keys.insert(slot, key);
        }
        cursors.uncouple_page(page.address(), &keys);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum OldRecord {
    Inline,
    Fixed,
    Blob(u64),
    DupTable(u64),
}

fn write_owned_record(node: &mut NodeMut<'_>, slot: usize, record: &OwnedRecord) -> Result<()> {
    match record {
        OwnedRecord::Inline(bytes) => node.write_record(slot, RecordSource::Inline(bytes)),
        OwnedRecord::Blob(id) => node.write_record(slot, RecordSource::Blob(*id)),
        OwnedRecord::Fixed(bytes) => node.write_record(slot, RecordSource::Fixed(bytes)),
    }
}

/// Target position for a new duplicate.
fn duplicate_position(flags: u32, cursor_dup: Option<u32>, count: u32) -> u32 {
    if flags & op_flags::DUPLICATE_INSERT_FIRST != 0 {
        0
    } else if flags & op_flags::DUPLICATE_INSERT_BEFORE != 0 {
        cursor_dup.unwrap_or(0)
    } else if flags & op_flags::DUPLICATE_INSERT_AFTER != 0 {
        cursor_dup.map(|d| d + 1).unwrap_or(count)
    } else {
        count
    }
}
