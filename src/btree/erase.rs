//! # B-Tree Erase Path
//!
//! Removes a single duplicate or a whole key in place. The slot removal
//! itself can only fail for key-list layouts that are not delete-stable;
//! the driver reacts to that `LimitsReached` by splitting the leaf at the
//! median and retrying once.
//!
//! A leaf left empty is unlinked from the sibling chain, its separator is
//! demoted out of the parent, and the page returns to the freelist. If
//! that leaves an internal root without keys, the tree shrinks by one
//! level. Merging beyond the empty-page case is deliberately not
//! attempted.

use std::sync::Arc;

use eyre::{bail, Result};
use tracing::{debug, trace};

use crate::blob::{dup_table, BlobManager};
use crate::config::PAGE_HEADER_SIZE;
use crate::cursor::CursorRegistry;
use crate::error::{is_kind, ErrorKind};
use crate::page::{Page, PageType};
use crate::pager::{fetch_flags, Context, PageManager};

use super::node::{Node, NodeMut};
use super::recordlist::{RecordRef, RecordSource};
use super::{BtreeIndex, SearchResult};

impl BtreeIndex {
    /// Erases `key` (one duplicate when `dup_index` is given, otherwise
    /// the whole key). `KeyNotFound` when nothing matches.
    pub fn erase(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        cursors: &mut CursorRegistry,
        key: &[u8],
        dup_index: Option<u32>,
    ) -> Result<()> {
        self.validate_key(key)?;
        match self.erase_keyed(ctx, pager, blobs, cursors, key, dup_index) {
            Err(err) if is_kind(&err, ErrorKind::LimitsReached) => {
                // non-delete-stable layout refused the in-place removal:
                // split the leaf at the median and retry once
                debug!("erase hit layout limits, splitting and retrying");
                self.split_for_erase(ctx, pager, blobs, cursors, key)?;
                self.erase_keyed(ctx, pager, blobs, cursors, key, dup_index)
            }
            other => other,
        }
    }

    fn erase_keyed(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        cursors: &mut CursorRegistry,
        key: &[u8],
        dup_index: Option<u32>,
    ) -> Result<()> {
        let mut address = self.root();
        let mut path: Vec<Arc<Page>> = Vec::new();
        let leaf = loop {
            let page = pager.fetch(ctx, address, 0)?;
            let is_leaf = {
                let data = page.data();
                Node::new(&data[PAGE_HEADER_SIZE..], self.layout()).is_leaf()
            };
            if is_leaf {
                break page;
            }
            let idx = self.descend_index(ctx, pager, blobs, &page, key)?;
            address = {
                let data = page.data();
                Node::new(&data[PAGE_HEADER_SIZE..], self.layout()).child_at(idx)
            };
            path.push(page);
        };

        let slot = match self.search_node(ctx, pager, blobs, &leaf, key)? {
            SearchResult::Found(slot) => slot,
            SearchResult::NotFound(_) => bail!(ErrorKind::KeyNotFound),
        };

        self.erase_slot(ctx, pager, blobs, cursors, &leaf, slot, dup_index)?;
        self.cleanup_empty_leaf(ctx, pager, cursors, leaf, &path)
    }

    /// Removes a duplicate or the whole entry at a known `(page, slot)`.
    /// This is the cursor-coupled entry point; `LimitsReached` propagates
    /// so the cursor layer can uncouple and fall back to the keyed path.
    pub fn erase_slot(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        cursors: &mut CursorRegistry,
        page: &Arc<Page>,
        slot: usize,
        dup_index: Option<u32>,
    ) -> Result<()> {
        let record = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], self.layout());
            match node.record_ref(slot) {
                RecordRef::DupTable(id) => Some(id),
                _ => None,
            }
        };

        if let (Some(table_id), Some(dup)) = (record, dup_index) {
            match dup_table::erase(blobs, pager, ctx, table_id, dup)? {
                Some(new_table) => {
                    if new_table != table_id {
                        let mut data = page.data_mut();
                        let mut node = NodeMut::new(&mut data[PAGE_HEADER_SIZE..], self.layout());
                        node.write_record(slot, RecordSource::DupTable(new_table))?;
                    }
                    page.set_dirty();
                    cursors.adjust_after_dup_erase(page.address(), slot as u32, dup);
                    trace!(page = page.address(), slot, dup, "erased one duplicate");
                    return Ok(());
                }
                None => {
                    // the table died with its last record; only the key's
                    // own overflow blob is left to free
                    self.free_key_overflow(ctx, pager, blobs, page, slot)?;
                    return self.remove_whole_slot(ctx, pager, cursors, page, slot);
                }
            }
        }

        if let Some(dup) = dup_index {
            // single record: only duplicate 0 exists
            eyre::ensure!(dup == 0, ErrorKind::KeyNotFound);
        }

        self.free_slot_storage(ctx, pager, blobs, page, slot)?;
        self.remove_whole_slot(ctx, pager, cursors, page, slot)
    }

    fn remove_whole_slot(
        &mut self,
        _ctx: &mut Context,
        _pager: &mut PageManager,
        cursors: &mut CursorRegistry,
        page: &Arc<Page>,
        slot: usize,
    ) -> Result<()> {
        {
            let mut data = page.data_mut();
            let mut node = NodeMut::new(&mut data[PAGE_HEADER_SIZE..], self.layout());
            node.remove_entry(slot)?;
        }
        page.set_dirty();
        cursors.adjust_after_erase(page.address(), slot as u32);
        trace!(page = page.address(), slot, "erased key");
        Ok(())
    }

    fn free_key_overflow(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        page: &Arc<Page>,
        slot: usize,
    ) -> Result<()> {
        use super::keylist::KeyRef;
        let blob = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], self.layout());
            match node.key_ref(slot) {
                KeyRef::Overflow { blob_id, .. } => Some(blob_id),
                KeyRef::Inline(_) => None,
            }
        };
        if let Some(blob_id) = blob {
            blobs.erase(pager, ctx, blob_id)?;
        }
        Ok(())
    }

    /// Unlinks and frees a leaf that ended up empty, demoting its
    /// separator from the parent. Opportunistic: only the empty-page case
    /// is handled, and only one level of parent shrink (the root).
    fn cleanup_empty_leaf(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        cursors: &mut CursorRegistry,
        leaf: Arc<Page>,
        path: &[Arc<Page>],
    ) -> Result<()> {
        let (count, left, right) = {
            let data = leaf.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], self.layout());
            (node.count(), node.left_link(), node.right_sibling())
        };
        if count > 0 || leaf.address() == self.root() {
            return Ok(());
        }
        let Some(parent) = path.last() else {
            return Ok(());
        };

        // unlink from the sibling chain
        if left != 0 {
            let sibling = pager.fetch(ctx, left, 0)?;
            let mut data = sibling.data_mut();
            let mut node = NodeMut::new(&mut data[PAGE_HEADER_SIZE..], self.layout());
            node.set_right_sibling(right);
            drop(data);
            sibling.set_dirty();
        }
        if right != 0 {
            let sibling = pager.fetch(ctx, right, 0)?;
            let mut data = sibling.data_mut();
            let mut node = NodeMut::new(&mut data[PAGE_HEADER_SIZE..], self.layout());
            node.set_left_link(left);
            drop(data);
            sibling.set_dirty();
        }
        if self.stats().last_leaf == leaf.address() {
            self.stats_mut().last_leaf = left;
        }

        // demote the separator
        let j = {
            let data = parent.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], self.layout());
            let mut found = None;
            for idx in 0..=node.count() {
                if node.child_at(idx) == leaf.address() {
                    found = Some(idx);
                    break;
                }
            }
            found.ok_or_else(|| eyre::Report::new(ErrorKind::Internal))?
        };
        {
            let mut data = parent.data_mut();
            let mut node = NodeMut::new(&mut data[PAGE_HEADER_SIZE..], self.layout());
            if j == 0 {
                let new_left = node.as_node().child_at(1);
                node.set_left_link(new_left);
                node.remove_entry(0)?;
            } else {
                node.remove_entry(j - 1)?;
            }
        }
        parent.set_dirty();

        let leaf_address = leaf.address();
        cursors.nil_on_page(leaf_address);
        drop(leaf);
        pager.del(ctx, leaf_address, 1)?;
        self.stats_mut().page_merges += 1;
        debug!(page = leaf_address, "freed empty leaf");

        // a root left without separators shrinks the tree by one level
        if parent.address() == self.root() {
            let (root_count, only_child) = {
                let data = parent.data();
                let node = Node::new(&data[PAGE_HEADER_SIZE..], self.layout());
                (node.count(), node.left_link())
            };
            if root_count == 0 {
                let root_address = parent.address();
                pager.del(ctx, root_address, 1)?;
                self.root = only_child;
                let new_root = pager.fetch(ctx, only_child, 0)?;
                new_root.set_page_type(PageType::BtreeRoot);
                new_root.set_dirty();
                debug!(root = only_child, "tree shrank by one level");
            }
        }
        Ok(())
    }

    /// Median split of the leaf holding `key`, used by the erase retry
    /// driver for layouts that can grow on delete.
    fn split_for_erase(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        cursors: &mut CursorRegistry,
        key: &[u8],
    ) -> Result<()> {
        let mut address = self.root();
        let mut parent: Option<Arc<Page>> = None;
        loop {
            let page = pager.fetch(ctx, address, 0)?;
            let is_leaf = {
                let data = page.data();
                Node::new(&data[PAGE_HEADER_SIZE..], self.layout()).is_leaf()
            };
            if is_leaf {
                return match parent {
                    Some(parent_page) => {
                        self.split_child(ctx, pager, blobs, cursors, &parent_page, &page)
                    }
                    None => self.split_root(ctx, pager, blobs, cursors),
                };
            }
            let idx = self.descend_index(ctx, pager, blobs, &page, key)?;
            address = {
                let data = page.data();
                Node::new(&data[PAGE_HEADER_SIZE..], self.layout()).child_at(idx)
            };
            parent = Some(page);
        }
    }
}
