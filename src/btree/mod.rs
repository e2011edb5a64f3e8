//! # B-Tree Index
//!
//! One ordered index per database. All data lives in the leaves; internal
//! nodes hold separator keys and child pointers. Leaves chain in both
//! directions for range scans. Keys within the tree are unique; a key
//! with multiple records points at a duplicate table.
//!
//! ```text
//!                  [internal]
//!                 /    |     \
//!        [leaf] <-> [leaf] <-> [leaf]
//! ```
//!
//! ## Separator rule
//!
//! The key at slot `i` of an internal node separates child `i` (keys
//! strictly below it) from child `i + 1` (keys at or above it). Descent
//! therefore routes a key to the child after the last separator that is
//! less than or equal to it.
//!
//! ## Insert
//!
//! Descent splits every full node on the way down (proactive split at the
//! median), so the target leaf and every touched parent always have room.
//! A root split grows the tree by one level.
//!
//! ## Erase
//!
//! Keys are removed in place. A leaf that becomes empty is unlinked from
//! the sibling chain, its separator is demoted from the parent, and the
//! page returns to the freelist; merging beyond that is opportunistic,
//! not mandatory. Key-list layouts that are not delete-stable may refuse
//! an in-place erase with `LimitsReached`; the driver then splits the
//! node at the median and retries.
//!
//! ## Cursors
//!
//! Every in-place mutation walks the database's open-cursor registry and
//! shifts, nils or uncouples affected cursors; see
//! [`CursorRegistry`](crate::cursor::CursorRegistry). Pages never hold
//! cursor back-pointers.

pub mod keylist;
pub mod node;
pub mod recordlist;

mod erase;
mod insert;

pub use insert::InsertOutcome;

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::{ensure, Result};

use crate::blob::{dup_table, BlobManager};
use crate::config::{op_flags, DbConfig, KeyType, KEY_SIZE_UNLIMITED, PAGE_HEADER_SIZE};
use crate::cursor::CursorRegistry;
use crate::error::ErrorKind;
use crate::page::{Page, PageType};
use crate::pager::{fetch_flags, Context, PageManager};

use keylist::KeyRef;
use node::{Node, NodeLayout, NodeMut};
use recordlist::RecordRef;

/// Ordered comparison under a database's key type: numeric for the
/// fixed-width types, lexicographic for binary.
pub fn compare_keys(key_type: KeyType, a: &[u8], b: &[u8]) -> Ordering {
    match key_type {
        KeyType::U8 => a[0].cmp(&b[0]),
        KeyType::U16 => {
            let left = u16::from_le_bytes(a.try_into().unwrap());
            let right = u16::from_le_bytes(b.try_into().unwrap());
            left.cmp(&right)
        }
        KeyType::U32 => {
            let left = u32::from_le_bytes(a.try_into().unwrap());
            let right = u32::from_le_bytes(b.try_into().unwrap());
            left.cmp(&right)
        }
        KeyType::U64 => {
            let left = u64::from_le_bytes(a.try_into().unwrap());
            let right = u64::from_le_bytes(b.try_into().unwrap());
            left.cmp(&right)
        }
        KeyType::F32 => {
            let left = f32::from_le_bytes(a.try_into().unwrap());
            let right = f32::from_le_bytes(b.try_into().unwrap());
            left.partial_cmp(&right).unwrap_or(Ordering::Equal)
        }
        KeyType::F64 => {
            let left = f64::from_le_bytes(a.try_into().unwrap());
            let right = f64::from_le_bytes(b.try_into().unwrap());
            left.partial_cmp(&right).unwrap_or(Ordering::Equal)
        }
        KeyType::Binary => a.cmp(b),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    /// The slot where the key would be inserted.
    NotFound(usize),
}

/// Visitor for [`BtreeIndex::scan`]. `visit_array` receives the packed
/// key cells of a whole leaf when the key list is a plain array of a
/// fixed POD type; the default implementation unpacks it key by key.
pub trait ScanVisitor {
    fn visit_key(&mut self, key: &[u8], dup_count: u64);

    fn visit_array(&mut self, packed: &[u8], key_size: usize, count: usize) {
        for i in 0..count {
            self.visit_key(&packed[i * key_size..(i + 1) * key_size], 1);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BtreeStats {
    /// Right-most leaf, the append-hint fast path target.
    pub last_leaf: u64,
    pub append_hits: u64,
    pub prepend_hints: u64,
    pub splits: u64,
    pub page_merges: u64,
}

pub struct BtreeIndex {
    dbname: u16,
    root: u64,
    layout: NodeLayout,
    cfg: DbConfig,
    stats: BtreeStats,
}

impl BtreeIndex {
    /// Creates a new index with an empty leaf as its root.
    pub fn create(
        ctx: &mut Context,
        pager: &mut PageManager,
        dbname: u16,
        cfg: DbConfig,
        page_size: usize,
    ) -> Result<Self> {
        let layout = NodeLayout::new(&cfg, page_size)?;
        let page = pager.alloc(ctx, PageType::BtreeRoot, 0)?;
        {
            let mut data = page.data_mut();
            NodeMut::init(&mut data[PAGE_HEADER_SIZE..], &layout, true);
        }
        page.set_db(dbname);
        page.set_dirty();

        Ok(Self {
            dbname,
            root: page.address(),
            layout,
            cfg,
            stats: BtreeStats {
                last_leaf: page.address(),
                ..Default::default()
            },
        })
    }

    /// Opens an existing index rooted at `root`.
    pub fn open(dbname: u16, cfg: DbConfig, root: u64, page_size: usize) -> Result<Self> {
        let layout = NodeLayout::new(&cfg, page_size)?;
        Ok(Self {
            dbname,
            root,
            layout,
            cfg,
            stats: BtreeStats::default(),
        })
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn dbname(&self) -> u16 {
        self.dbname
    }

    pub fn cfg(&self) -> &DbConfig {
        &self.cfg
    }

    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    pub fn stats(&self) -> &BtreeStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut BtreeStats {
        &mut self.stats
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        compare_keys(self.layout.key_type, a, b)
    }

    /// Checks a key against the database's type and size constraints.
    pub fn validate_key(&self, key: &[u8]) -> Result<()> {
        ensure!(!key.is_empty(), ErrorKind::InvalidKeySize);
        match self.layout.key_type {
            KeyType::Binary => {
                if self.cfg.key_size != KEY_SIZE_UNLIMITED {
                    ensure!(
                        key.len() == self.cfg.key_size as usize,
                        ErrorKind::InvalidKeySize
                    );
                }
            }
            KeyType::F32 => {
                ensure!(key.len() == 4, ErrorKind::InvalidKeySize);
                let value = f32::from_le_bytes(key.try_into().unwrap());
                ensure!(!value.is_nan(), ErrorKind::InvalidArg);
            }
            KeyType::F64 => {
                ensure!(key.len() == 8, ErrorKind::InvalidKeySize);
                let value = f64::from_le_bytes(key.try_into().unwrap());
                ensure!(!value.is_nan(), ErrorKind::InvalidArg);
            }
            other => {
                let expected = other.fixed_size().unwrap_or(0);
                ensure!(key.len() == expected, ErrorKind::InvalidKeySize);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // key / record resolution
    // ------------------------------------------------------------------

    /// Materializes the key at `slot`, following the overflow blob when
    /// the cell only holds a reference.
    pub fn key_at(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        page: &Arc<Page>,
        slot: usize,
    ) -> Result<Vec<u8>> {
        let overflow = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
            match node.key_ref(slot) {
                KeyRef::Inline(bytes) => return Ok(bytes.to_vec()),
                KeyRef::Overflow { blob_id, .. } => blob_id,
            }
        };
        blobs.read(pager, ctx, overflow)
    }

    /// Materializes the record at `(slot, dup_index)`.
    pub fn record_at(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        page: &Arc<Page>,
        slot: usize,
        dup_index: u32,
    ) -> Result<Vec<u8>> {
        let stored = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
            match node.record_ref(slot) {
                RecordRef::Inline(bytes) | RecordRef::Fixed(bytes) => {
                    ensure!(dup_index == 0, ErrorKind::KeyNotFound);
                    return Ok(bytes.to_vec());
                }
                RecordRef::Blob(blob_id) => {
                    ensure!(dup_index == 0, ErrorKind::KeyNotFound);
                    Ok(blob_id)
                }
                RecordRef::DupTable(table_id) => Err(table_id),
            }
        };
        match stored {
            Ok(blob_id) => blobs.read(pager, ctx, blob_id),
            Err(table_id) => dup_table::record(blobs, pager, ctx, table_id, dup_index),
        }
    }

    /// Number of records stored for the key at `slot`.
    pub fn dup_count_at(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        page: &Arc<Page>,
        slot: usize,
    ) -> Result<u32> {
        let table_id = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
            match node.record_ref(slot) {
                RecordRef::DupTable(table_id) => table_id,
                _ => return Ok(1),
            }
        };
        dup_table::count(blobs, pager, ctx, table_id)
    }

    /// Binary search within one node; overflow keys are resolved through
    /// the blob manager.
    pub(crate) fn search_node(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        page: &Arc<Page>,
        key: &[u8],
    ) -> Result<SearchResult> {
        let count = {
            let data = page.data();
            Node::new(&data[PAGE_HEADER_SIZE..], &self.layout).count()
        };

        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let probe = self.key_at(ctx, pager, blobs, page, mid)?;
            match self.compare(&probe, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(SearchResult::Found(mid)),
            }
        }
        Ok(SearchResult::NotFound(lo))
    }

    /// Descent child index for `key`: the number of separators that are
    /// less than or equal to it.
    pub(crate) fn descend_index(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        page: &Arc<Page>,
        key: &[u8],
    ) -> Result<usize> {
        Ok(match self.search_node(ctx, pager, blobs, page, key)? {
            SearchResult::Found(slot) => slot + 1,
            SearchResult::NotFound(idx) => idx,
        })
    }

    // ------------------------------------------------------------------
    // find
    // ------------------------------------------------------------------

    /// Root-to-leaf lookup. Returns the leaf page and slot of the match,
    /// honoring the approximate-match flags, or `None`.
    pub fn find(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        key: &[u8],
        flags: u32,
    ) -> Result<Option<(Arc<Page>, usize)>> {
        let page = self.descend_to_leaf(ctx, pager, blobs, key)?;

        let result = self.search_node(ctx, pager, blobs, &page, key)?;
        let count = {
            let data = page.data();
            Node::new(&data[PAGE_HEADER_SIZE..], &self.layout).count()
        };

        match result {
            SearchResult::Found(slot) => {
                if flags & op_flags::FIND_LT_MATCH != 0 && flags & op_flags::FIND_LEQ_MATCH == 0 {
                    self.step_before(ctx, pager, page, slot)
                } else if flags & op_flags::FIND_GT_MATCH != 0
                    && flags & op_flags::FIND_GEQ_MATCH == 0
                {
                    self.step_after(ctx, pager, page, slot, count)
                } else {
                    Ok(Some((page, slot)))
                }
            }
            SearchResult::NotFound(idx) => {
                if flags & (op_flags::FIND_LT_MATCH | op_flags::FIND_LEQ_MATCH) != 0 {
                    self.step_before(ctx, pager, page, idx)
                } else if flags & (op_flags::FIND_GT_MATCH | op_flags::FIND_GEQ_MATCH) != 0 {
                    if idx < count {
                        Ok(Some((page, idx)))
                    } else {
                        self.step_after(ctx, pager, page, idx, count)
                    }
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Walks root to leaf for `key` without splitting anything.
    pub(crate) fn descend_to_leaf(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        key: &[u8],
    ) -> Result<Arc<Page>> {
        let mut address = self.root;
        loop {
            let page = pager.fetch(ctx, address, fetch_flags::READ_ONLY)?;
            let is_leaf = {
                let data = page.data();
                Node::new(&data[PAGE_HEADER_SIZE..], &self.layout).is_leaf()
            };
            if is_leaf {
                return Ok(page);
            }
            let idx = self.descend_index(ctx, pager, blobs, &page, key)?;
            address = {
                let data = page.data();
                Node::new(&data[PAGE_HEADER_SIZE..], &self.layout).child_at(idx)
            };
        }
    }

    /// Position strictly before `(page, slot)`, crossing to the left
    /// sibling when needed.
    fn step_before(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        page: Arc<Page>,
        slot: usize,
    ) -> Result<Option<(Arc<Page>, usize)>> {
        if slot > 0 {
            return Ok(Some((page, slot - 1)));
        }
        let mut left = {
            let data = page.data();
            Node::new(&data[PAGE_HEADER_SIZE..], &self.layout).left_link()
        };
        while left != 0 {
            let sibling = pager.fetch(ctx, left, fetch_flags::READ_ONLY)?;
            let (count, further) = {
                let data = sibling.data();
                let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
                (node.count(), node.left_link())
            };
            if count > 0 {
                return Ok(Some((sibling, count - 1)));
            }
            left = further;
        }
        Ok(None)
    }

    /// Position at or after `(page, slot)`, crossing to the right
    /// sibling when the slot runs off the node.
    fn step_after(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        page: Arc<Page>,
        slot: usize,
        count: usize,
    ) -> Result<Option<(Arc<Page>, usize)>> {
        if slot + 1 < count {
            return Ok(Some((page, slot + 1)));
        }
        let mut right = {
            let data = page.data();
            Node::new(&data[PAGE_HEADER_SIZE..], &self.layout).right_sibling()
        };
        while right != 0 {
            let sibling = pager.fetch(ctx, right, fetch_flags::READ_ONLY)?;
            let (count, further) = {
                let data = sibling.data();
                let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
                (node.count(), node.right_sibling())
            };
            if count > 0 {
                return Ok(Some((sibling, 0)));
            }
            right = further;
        }
        Ok(None)
    }

    /// First populated position of the tree, or `None` when empty.
    pub fn first_slot(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
    ) -> Result<Option<(Arc<Page>, usize)>> {
        let mut page = self.leftmost_leaf(ctx, pager)?;
        loop {
            let (count, right) = {
                let data = page.data();
                let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
                (node.count(), node.right_sibling())
            };
            if count > 0 {
                return Ok(Some((page, 0)));
            }
            if right == 0 {
                return Ok(None);
            }
            page = pager.fetch(ctx, right, fetch_flags::READ_ONLY)?;
        }
    }

    /// Last populated position of the tree, or `None` when empty.
    pub fn last_slot(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
    ) -> Result<Option<(Arc<Page>, usize)>> {
        let mut page = self.rightmost_leaf(ctx, pager)?;
        loop {
            let (count, left) = {
                let data = page.data();
                let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
                (node.count(), node.left_link())
            };
            if count > 0 {
                return Ok(Some((page, count - 1)));
            }
            if left == 0 {
                return Ok(None);
            }
            page = pager.fetch(ctx, left, fetch_flags::READ_ONLY)?;
        }
    }

    /// Left-most leaf of the tree.
    pub(crate) fn leftmost_leaf(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
    ) -> Result<Arc<Page>> {
        let mut address = self.root;
        loop {
            let page = pager.fetch(ctx, address, fetch_flags::READ_ONLY)?;
            let (is_leaf, left) = {
                let data = page.data();
                let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
                (node.is_leaf(), node.child_at_or_zero())
            };
            if is_leaf {
                return Ok(page);
            }
            address = left;
        }
    }

    /// Right-most leaf of the tree.
    pub(crate) fn rightmost_leaf(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
    ) -> Result<Arc<Page>> {
        let mut address = self.root;
        loop {
            let page = pager.fetch(ctx, address, fetch_flags::READ_ONLY)?;
            let (is_leaf, next) = {
                let data = page.data();
                let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
                (node.is_leaf(), if node.is_leaf() { 0 } else { node.child_at(node.count()) })
            };
            if is_leaf {
                return Ok(page);
            }
            address = next;
        }
    }

    // ------------------------------------------------------------------
    // scan
    // ------------------------------------------------------------------

    /// Visits every key left to right. With `distinct`, each key counts
    /// once regardless of duplicates. The packed-array path is taken for
    /// fixed POD key lists in databases without duplicates.
    pub fn scan(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        visitor: &mut dyn ScanVisitor,
        distinct: bool,
    ) -> Result<()> {
        use crate::config::db_flags;

        let packed_ok = self.layout.keys.is_packed_pod()
            && !self.cfg.has(db_flags::ENABLE_DUPLICATE_KEYS);

        let mut page = self.leftmost_leaf(ctx, pager)?;
        loop {
            let next = {
                let data = page.data();
                let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
                node.right_sibling()
            };

            if packed_ok {
                let data = page.data();
                let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
                visitor.visit_array(
                    node.packed_keys(),
                    self.layout.keys.cell_size(),
                    node.count(),
                );
            } else {
                let count = {
                    let data = page.data();
                    Node::new(&data[PAGE_HEADER_SIZE..], &self.layout).count()
                };
                for slot in 0..count {
                    let key = self.key_at(ctx, pager, blobs, &page, slot)?;
                    let dups = if distinct {
                        1
                    } else {
                        self.dup_count_at(ctx, pager, blobs, &page, slot)? as u64
                    };
                    visitor.visit_key(&key, dups);
                }
            }

            if next == 0 {
                return Ok(());
            }
            page = pager.fetch(ctx, next, fetch_flags::READ_ONLY)?;
        }
    }

    /// Frees every page and blob owned by this index (database erase).
    pub fn drop_tree(
        &mut self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        cursors: &mut CursorRegistry,
    ) -> Result<()> {
        self.drop_subtree(ctx, pager, blobs, self.root)?;
        cursors.nil_all();
        Ok(())
    }

    fn drop_subtree(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        address: u64,
    ) -> Result<()> {
        let page = pager.fetch(ctx, address, fetch_flags::READ_ONLY)?;
        let (is_leaf, count) = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
            (node.is_leaf(), node.count())
        };

        if is_leaf {
            for slot in 0..count {
                self.free_slot_storage(ctx, pager, blobs, &page, slot)?;
            }
        } else {
            for idx in 0..=count {
                let child = {
                    let data = page.data();
                    Node::new(&data[PAGE_HEADER_SIZE..], &self.layout).child_at(idx)
                };
                self.drop_subtree(ctx, pager, blobs, child)?;
            }
        }
        drop(page);
        pager.del(ctx, address, 1)
    }

    /// Frees the overflow key blob and record storage of one leaf slot.
    pub(crate) fn free_slot_storage(
        &self,
        ctx: &mut Context,
        pager: &mut PageManager,
        blobs: &mut BlobManager,
        page: &Arc<Page>,
        slot: usize,
    ) -> Result<()> {
        let (key_blob, record) = {
            let data = page.data();
            let node = Node::new(&data[PAGE_HEADER_SIZE..], &self.layout);
            let key_blob = match node.key_ref(slot) {
                KeyRef::Overflow { blob_id, .. } => Some(blob_id),
                KeyRef::Inline(_) => None,
            };
            let record = match node.record_ref(slot) {
                RecordRef::Blob(id) => Some((id, false)),
                RecordRef::DupTable(id) => Some((id, true)),
                _ => None,
            };
            (key_blob, record)
        };

        if let Some(blob_id) = key_blob {
            blobs.erase(pager, ctx, blob_id)?;
        }
        match record {
            Some((id, true)) => dup_table::erase_all(blobs, pager, ctx, id)?,
            Some((id, false)) => blobs.erase(pager, ctx, id)?,
            None => {}
        }
        Ok(())
    }
}

impl<'a> Node<'a> {
    /// `child_at(0)` for internal nodes, 0 for leaves; lets descent code
    /// read both shapes uniformly.
    fn child_at_or_zero(&self) -> u64 {
        if self.is_leaf() {
            0
        } else {
            self.child_at(0)
        }
    }
}

