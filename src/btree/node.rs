//! # B-Tree Node Decoder
//!
//! A node occupies one page payload:
//!
//! ```text
//! { count u32, flags u32, right_sibling u64, left_link u64 }   24 bytes
//! key cells      capacity * key_cell_size
//! record cells   capacity * record_cell_size
//! ```
//!
//! `left_link` is the left-most child for internal nodes and the left
//! sibling for leaves (leaves chain in both directions, internal nodes do
//! not). The key list and record list are parallel arrays: slot `i` of
//! one belongs to slot `i` of the other.
//!
//! Internal nodes with `count` keys address `count + 1` children via
//! [`Node::child_at`]: child 0 is `left_link`, child `i + 1` is record
//! cell `i`. The key at slot `i` separates child `i` (keys below it)
//! from child `i + 1` (keys at or above it).
//!
//! [`Node`] and [`NodeMut`] borrow the payload slice out of the page's
//! buffer lock; they are plain decoders with no allocation.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{DbConfig, db_flags, KeyType, PAGE_HEADER_SIZE, RECORD_SIZE_UNLIMITED};
use crate::error::ErrorKind;

use super::keylist::{KeyList, KeyRef, KeySource};
use super::recordlist::{RecordList, RecordRef, RecordSource};

pub const NODE_HEADER_SIZE: usize = 24;

const FLAG_LEAF: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct NodeHeader {
    count: U32,
    flags: U32,
    right_sibling: U64,
    left_link: U64,
}

impl NodeHeader {
    le_accessors! {
        count: u32,
        flags: u32,
        right_sibling: u64,
        left_link: u64,
    }
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

/// Cell geometry for one database, derived from its configuration and
/// the page size.
#[derive(Debug, Clone)]
pub struct NodeLayout {
    pub key_type: KeyType,
    pub keys: KeyList,
    pub leaf_records: RecordList,
    pub internal_records: RecordList,
    pub leaf_capacity: usize,
    pub internal_capacity: usize,
}

impl NodeLayout {
    pub fn new(cfg: &DbConfig, page_size: usize) -> Result<Self> {
        let keys = KeyList::for_db(cfg.key_type, cfg.key_size);
        let payload = page_size - PAGE_HEADER_SIZE - NODE_HEADER_SIZE;

        // exact-sized records inline into the cell when they leave room
        // for a sane fan-out; everything else uses the default layout
        let mut leaf_records = RecordList::Default;
        if cfg.record_size != RECORD_SIZE_UNLIMITED
            && !cfg.has(db_flags::ENABLE_DUPLICATE_KEYS)
        {
            let candidate = RecordList::Fixed {
                size: cfg.record_size as usize,
            };
            if payload / (keys.cell_size() + candidate.cell_size()) >= 4 {
                leaf_records = candidate;
            }
        }

        let internal_records = RecordList::Internal;
        let leaf_capacity = payload / (keys.cell_size() + leaf_records.cell_size());
        let internal_capacity = payload / (keys.cell_size() + internal_records.cell_size());

        ensure!(leaf_capacity >= 4, ErrorKind::InvalidKeySize);

        Ok(Self {
            key_type: cfg.key_type,
            keys,
            leaf_records,
            internal_records,
            leaf_capacity,
            internal_capacity,
        })
    }

    fn records_for(&self, leaf: bool) -> &RecordList {
        if leaf {
            &self.leaf_records
        } else {
            &self.internal_records
        }
    }

    fn capacity_for(&self, leaf: bool) -> usize {
        if leaf {
            self.leaf_capacity
        } else {
            self.internal_capacity
        }
    }

    fn key_region(&self, leaf: bool) -> std::ops::Range<usize> {
        let start = NODE_HEADER_SIZE;
        start..start + self.capacity_for(leaf) * self.keys.cell_size()
    }

    fn record_region(&self, leaf: bool) -> std::ops::Range<usize> {
        let start = self.key_region(leaf).end;
        start..start + self.capacity_for(leaf) * self.records_for(leaf).cell_size()
    }
}

/// Read-only view over a node payload.
pub struct Node<'a> {
    payload: &'a [u8],
    layout: &'a NodeLayout,
}

impl<'a> Node<'a> {
    pub fn new(payload: &'a [u8], layout: &'a NodeLayout) -> Self {
        Self { payload, layout }
    }

    fn header(&self) -> NodeHeader {
        NodeHeader::read_from_bytes(&self.payload[..NODE_HEADER_SIZE])
            .expect("node payload shorter than header")
    }

    pub fn count(&self) -> usize {
        self.header().count() as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.header().flags() & FLAG_LEAF != 0
    }

    pub fn right_sibling(&self) -> u64 {
        self.header().right_sibling()
    }

    pub fn left_link(&self) -> u64 {
        self.header().left_link()
    }

    pub fn capacity(&self) -> usize {
        self.layout.capacity_for(self.is_leaf())
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity()
    }

    pub fn key_ref(&self, slot: usize) -> KeyRef<'_> {
        debug_assert!(slot < self.count());
        let region = self.layout.key_region(self.is_leaf());
        self.layout.keys.key_ref(&self.payload[region], slot)
    }

    pub fn record_ref(&self, slot: usize) -> RecordRef<'_> {
        debug_assert!(slot < self.count());
        let leaf = self.is_leaf();
        let region = self.layout.record_region(leaf);
        self.layout
            .records_for(leaf)
            .record_ref(&self.payload[region], slot)
    }

    /// Child address `idx` of an internal node, `0 ..= count`.
    pub fn child_at(&self, idx: usize) -> u64 {
        debug_assert!(!self.is_leaf());
        debug_assert!(idx <= self.count());
        if idx == 0 {
            self.left_link()
        } else {
            let region = self.layout.record_region(false);
            self.layout
                .internal_records
                .child(&self.payload[region], idx - 1)
        }
    }

    /// The packed key-cell area, for array-visitor scans over fixed POD
    /// key lists.
    pub fn packed_keys(&self) -> &[u8] {
        let region = self.layout.key_region(self.is_leaf());
        let size = self.layout.keys.cell_size();
        &self.payload[region][..self.count() * size]
    }

    /// Raw key cell, used to transfer cell ownership between nodes.
    pub fn raw_key_cell(&self, slot: usize) -> Vec<u8> {
        let region = self.layout.key_region(self.is_leaf());
        let size = self.layout.keys.cell_size();
        self.payload[region][slot * size..(slot + 1) * size].to_vec()
    }
}

/// Mutable view over a node payload.
pub struct NodeMut<'a> {
    payload: &'a mut [u8],
    layout: &'a NodeLayout,
}

impl<'a> NodeMut<'a> {
    pub fn new(payload: &'a mut [u8], layout: &'a NodeLayout) -> Self {
        Self { payload, layout }
    }

    /// Zeroes the header and stamps the leaf flag.
    pub fn init(payload: &'a mut [u8], layout: &'a NodeLayout, leaf: bool) -> Self {
        payload[..NODE_HEADER_SIZE].fill(0);
        let mut node = Self { payload, layout };
        if leaf {
            node.set_flags(FLAG_LEAF);
        }
        node
    }

    pub fn as_node(&self) -> Node<'_> {
        Node {
            payload: self.payload,
            layout: self.layout,
        }
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        NodeHeader::mut_from_bytes(&mut self.payload[..NODE_HEADER_SIZE])
            .expect("node payload shorter than header")
    }

    pub fn count(&self) -> usize {
        self.as_node().count()
    }

    pub fn is_leaf(&self) -> bool {
        self.as_node().is_leaf()
    }

    pub fn set_count(&mut self, count: usize) {
        self.header_mut().set_count(count as u32);
    }

    fn set_flags(&mut self, flags: u32) {
        self.header_mut().set_flags(flags);
    }

    pub fn set_right_sibling(&mut self, address: u64) {
        self.header_mut().set_right_sibling(address);
    }

    pub fn set_left_link(&mut self, address: u64) {
        self.header_mut().set_left_link(address);
    }

    pub fn write_key(&mut self, slot: usize, key: KeySource<'_>) -> Result<()> {
        let leaf = self.is_leaf();
        let region = self.layout.key_region(leaf);
        let keys = self.layout.keys;
        keys.write_key(&mut self.payload[region], slot, key)
    }

    pub fn write_raw_key_cell(&mut self, slot: usize, cell: &[u8]) {
        let leaf = self.is_leaf();
        let region = self.layout.key_region(leaf);
        let size = self.layout.keys.cell_size();
        debug_assert_eq!(cell.len(), size);
        self.payload[region][slot * size..(slot + 1) * size].copy_from_slice(cell);
    }

    pub fn write_record(&mut self, slot: usize, record: RecordSource<'_>) -> Result<()> {
        let leaf = self.is_leaf();
        let region = self.layout.record_region(leaf);
        let records = *self.layout.records_for(leaf);
        records.write_record(&mut self.payload[region], slot, record)
    }

    pub fn set_child(&mut self, idx: usize, address: u64) -> Result<()> {
        debug_assert!(!self.is_leaf());
        if idx == 0 {
            self.set_left_link(address);
            Ok(())
        } else {
            self.write_record(idx - 1, RecordSource::Blob(address))
        }
    }

    /// Opens a gap at `slot` in both lists and bumps the count. The
    /// caller writes the key and record into the gap.
    pub fn insert_gap(&mut self, slot: usize) {
        let leaf = self.is_leaf();
        let count = self.count();
        debug_assert!(count < self.as_node().capacity());

        let key_region = self.layout.key_region(leaf);
        let keys = self.layout.keys;
        keys.insert_gap(&mut self.payload[key_region], count, slot);

        let record_region = self.layout.record_region(leaf);
        let records = *self.layout.records_for(leaf);
        records.insert_gap(&mut self.payload[record_region], count, slot);

        self.set_count(count + 1);
    }

    /// Removes `slot` from both lists. Fails with `LimitsReached` only
    /// for key lists that are not delete-stable.
    pub fn remove_entry(&mut self, slot: usize) -> Result<()> {
        let leaf = self.is_leaf();
        let count = self.count();
        debug_assert!(slot < count);

        let key_region = self.layout.key_region(leaf);
        let keys = self.layout.keys;
        keys.remove(&mut self.payload[key_region], count, slot)?;

        let record_region = self.layout.record_region(leaf);
        let records = *self.layout.records_for(leaf);
        records.remove(&mut self.payload[record_region], count, slot);

        self.set_count(count - 1);
        Ok(())
    }
}

/// Moves slots `[pivot, count)` of a leaf into an empty right sibling.
pub fn split_leaf_cells(src: &mut NodeMut<'_>, dst: &mut NodeMut<'_>, pivot: usize) {
    debug_assert!(src.is_leaf() && dst.is_leaf());
    debug_assert_eq!(dst.count(), 0);
    let count = src.count();
    let moved = count - pivot;

    let key_size = src.layout.keys.cell_size();
    let src_keys = src.layout.key_region(true);
    let dst_keys = dst.layout.key_region(true);
    dst.payload[dst_keys][..moved * key_size].copy_from_slice(
        &src.payload[src_keys][pivot * key_size..count * key_size],
    );

    let rec_size = src.layout.leaf_records.cell_size();
    let src_records = src.layout.record_region(true);
    let dst_records = dst.layout.record_region(true);
    dst.payload[dst_records][..moved * rec_size].copy_from_slice(
        &src.payload[src_records][pivot * rec_size..count * rec_size],
    );

    src.set_count(pivot);
    dst.set_count(moved);
}

/// Splits an internal node: slot `pivot` is promoted (the caller copied
/// its raw cell out beforehand), keys above it move to the empty right
/// sibling, and the right sibling's left-most child becomes the promoted
/// key's right child.
pub fn split_internal_cells(src: &mut NodeMut<'_>, dst: &mut NodeMut<'_>, pivot: usize) {
    debug_assert!(!src.is_leaf() && !dst.is_leaf());
    debug_assert_eq!(dst.count(), 0);
    let count = src.count();
    let moved = count - pivot - 1;

    let key_size = src.layout.keys.cell_size();
    let src_keys = src.layout.key_region(false);
    let dst_keys = dst.layout.key_region(false);
    dst.payload[dst_keys][..moved * key_size].copy_from_slice(
        &src.payload[src_keys][(pivot + 1) * key_size..count * key_size],
    );

    let rec_size = src.layout.internal_records.cell_size();
    let src_records = src.layout.record_region(false);
    let dst_records = dst.layout.record_region(false);
    dst.payload[dst_records][..moved * rec_size].copy_from_slice(
        &src.payload[src_records][(pivot + 1) * rec_size..count * rec_size],
    );

    let pivot_child = src.as_node().child_at(pivot + 1);
    dst.set_left_link(pivot_child);

    src.set_count(pivot);
    dst.set_count(moved);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;

    const PAGE_SIZE: usize = 16384;

    fn layout() -> NodeLayout {
        NodeLayout::new(&DbConfig::default(), PAGE_SIZE).unwrap()
    }

    fn payload_buf() -> Vec<u8> {
        vec![0u8; PAGE_SIZE - PAGE_HEADER_SIZE]
    }

    #[test]
    fn layout_capacities_are_sane() {
        let layout = layout();
        assert!(layout.leaf_capacity > 100);
        assert!(layout.internal_capacity > 100);
    }

    #[test]
    fn fixed_record_layout_kicks_in_for_exact_records() {
        let cfg = DbConfig::default().record_size(16);
        let layout = NodeLayout::new(&cfg, PAGE_SIZE).unwrap();
        assert_eq!(layout.leaf_records.cell_size(), 16);
    }

    #[test]
    fn huge_fixed_records_fall_back_to_blobs() {
        let cfg = DbConfig::default().record_size(8000);
        let layout = NodeLayout::new(&cfg, PAGE_SIZE).unwrap();
        assert_eq!(
            layout.leaf_records.cell_size(),
            crate::config::RECORD_CELL_SIZE
        );
    }

    #[test]
    fn init_and_slot_round_trip() {
        let layout = layout();
        let mut buf = payload_buf();
        let mut node = NodeMut::init(&mut buf, &layout, true);

        node.insert_gap(0);
        node.write_key(0, KeySource::Inline(b"bbb")).unwrap();
        node.write_record(0, RecordSource::Inline(b"2")).unwrap();

        node.insert_gap(0);
        node.write_key(0, KeySource::Inline(b"aaa")).unwrap();
        node.write_record(0, RecordSource::Inline(b"1")).unwrap();

        let view = node.as_node();
        assert_eq!(view.count(), 2);
        assert!(view.is_leaf());
        assert_eq!(view.key_ref(0), KeyRef::Inline(b"aaa"));
        assert_eq!(view.key_ref(1), KeyRef::Inline(b"bbb"));
        assert_eq!(view.record_ref(0), RecordRef::Inline(b"1"));
    }

    #[test]
    fn remove_entry_shifts_slots() {
        let layout = layout();
        let mut buf = payload_buf();
        let mut node = NodeMut::init(&mut buf, &layout, true);

        for (i, key) in [b"a", b"b", b"c"].iter().enumerate() {
            node.insert_gap(i);
            node.write_key(i, KeySource::Inline(*key)).unwrap();
            node.write_record(i, RecordSource::Inline(&[i as u8])).unwrap();
        }

        node.remove_entry(1).unwrap();
        let view = node.as_node();
        assert_eq!(view.count(), 2);
        assert_eq!(view.key_ref(1), KeyRef::Inline(b"c"));
        assert_eq!(view.record_ref(1), RecordRef::Inline(&[2u8]));
    }

    #[test]
    fn internal_children_map_around_keys() {
        let layout = layout();
        let mut buf = payload_buf();
        let mut node = NodeMut::init(&mut buf, &layout, false);

        node.set_left_link(1000);
        node.insert_gap(0);
        node.write_key(0, KeySource::Inline(b"m")).unwrap();
        node.set_child(1, 2000).unwrap();

        let view = node.as_node();
        assert_eq!(view.child_at(0), 1000);
        assert_eq!(view.child_at(1), 2000);
    }

    #[test]
    fn split_leaf_moves_the_upper_half() {
        let layout = layout();
        let mut left_buf = payload_buf();
        let mut right_buf = payload_buf();

        let mut left = NodeMut::init(&mut left_buf, &layout, true);
        for i in 0..6usize {
            left.insert_gap(i);
            left.write_key(i, KeySource::Inline(&[b'a' + i as u8]))
                .unwrap();
            left.write_record(i, RecordSource::Inline(&[i as u8])).unwrap();
        }
        let mut right = NodeMut::init(&mut right_buf, &layout, true);

        split_leaf_cells(&mut left, &mut right, 3);

        assert_eq!(left.count(), 3);
        assert_eq!(right.count(), 3);
        assert_eq!(right.as_node().key_ref(0), KeyRef::Inline(b"d"));
        assert_eq!(right.as_node().record_ref(2), RecordRef::Inline(&[5u8]));
    }

    #[test]
    fn split_internal_promotes_the_pivot() {
        let layout = layout();
        let mut left_buf = payload_buf();
        let mut right_buf = payload_buf();

        let mut left = NodeMut::init(&mut left_buf, &layout, false);
        left.set_left_link(100);
        for i in 0..5usize {
            left.insert_gap(i);
            left.write_key(i, KeySource::Inline(&[b'k', i as u8])).unwrap();
            left.set_child(i + 1, 200 + i as u64).unwrap();
        }
        let mut right = NodeMut::init(&mut right_buf, &layout, false);

        split_internal_cells(&mut left, &mut right, 2);

        assert_eq!(left.count(), 2);
        assert_eq!(right.count(), 2);
        // right's left-most child was the pivot's right child
        assert_eq!(right.as_node().child_at(0), 202);
        assert_eq!(right.as_node().child_at(1), 203);
        assert_eq!(right.as_node().key_ref(0), KeyRef::Inline(&[b'k', 3]));
    }
}
