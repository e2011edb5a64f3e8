//! # Changeset and Context
//!
//! A [`Context`] travels through every engine operation and carries the
//! operation's identity (database, transaction) plus its [`Changeset`]:
//! the ordered set of pages the operation has touched. Membership in the
//! changeset pins a page (the `Arc` keeps it from being evicted) and, at
//! the end of a mutation, the dirty members become the unit of atomic
//! write: their images go into one journal changeset entry, then they are
//! flushed to the device.

use std::sync::Arc;

use crate::page::Page;
use crate::txn::TxnId;

#[derive(Default)]
pub struct Changeset {
    pages: Vec<Arc<Page>>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a page; keeps the set free of duplicates.
    pub fn put(&mut self, page: Arc<Page>) {
        if !self.contains(page.address()) {
            self.pages.push(page);
        }
    }

    /// Drops a page from the set (used when the page is freed mid-op).
    pub fn remove(&mut self, address: u64) {
        self.pages.retain(|p| p.address() != address);
    }

    pub fn contains(&self, address: u64) -> bool {
        self.pages.iter().any(|p| p.address() == address)
    }

    pub fn get(&self, address: u64) -> Option<&Arc<Page>> {
        self.pages.iter().find(|p| p.address() == address)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[Arc<Page>] {
        &self.pages
    }

    /// The dirty members, in insertion order.
    pub fn dirty_pages(&self) -> Vec<Arc<Page>> {
        self.pages.iter().filter(|p| p.is_dirty()).cloned().collect()
    }

    /// Releases every pin.
    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

/// Transient per-operation state.
pub struct Context {
    pub dbname: u16,
    pub txn: Option<TxnId>,
    pub changeset: Changeset,
}

impl Context {
    pub fn new(dbname: u16, txn: Option<TxnId>) -> Self {
        Self {
            dbname,
            txn,
            changeset: Changeset::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;

    #[test]
    fn changeset_deduplicates_by_address() {
        let mut changeset = Changeset::new();
        let page = Arc::new(Page::new_allocated(4096, PageType::BtreeLeaf, 4096, false));

        changeset.put(Arc::clone(&page));
        changeset.put(Arc::clone(&page));

        assert_eq!(changeset.len(), 1);
        assert!(changeset.contains(4096));
    }

    #[test]
    fn dirty_pages_filters_clean_members() {
        let mut changeset = Changeset::new();
        let clean = Arc::new(Page::new_allocated(0, PageType::Header, 4096, false));
        let dirty = Arc::new(Page::new_allocated(4096, PageType::BtreeLeaf, 4096, false));
        dirty.set_dirty();

        changeset.put(clean);
        changeset.put(Arc::clone(&dirty));

        let result = changeset.dirty_pages();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].address(), 4096);
    }
}
