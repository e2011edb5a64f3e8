//! # Page Cache
//!
//! Bounded map from page address to `Arc<Page>` with LRU eviction. The
//! budget is expressed in bytes (`cache_size_bytes`), so one cache serves
//! any page size.
//!
//! Recency is tracked with a monotonically increasing tick per access; the
//! eviction scan picks the unpinned entries with the smallest ticks. This
//! trades the O(1) unlink of an intrusive LRU list for simplicity: the
//! scan runs only when the cache is over budget, and the candidate batch
//! is collected in one pass.
//!
//! A page is *pinned* while any reference outside the cache exists
//! (a changeset, a coupled cursor, the flush worker); pinned pages are
//! never evicted.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::page::{is_unreferenced, Page};

pub struct Cache {
    map: HashMap<u64, Entry>,
    page_size: usize,
    capacity_bytes: usize,
    tick: u64,
    hits: u64,
    misses: u64,
}

struct Entry {
    page: Arc<Page>,
    last_used: u64,
}

impl Cache {
    pub fn new(capacity_bytes: usize, page_size: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity_bytes / page_size.max(1)),
            page_size,
            capacity_bytes,
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, address: u64) -> Option<Arc<Page>> {
        self.tick += 1;
        let tick = self.tick;
        match self.map.get_mut(&address) {
            Some(entry) => {
                entry.last_used = tick;
                self.hits += 1;
                Some(Arc::clone(&entry.page))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Peeks without touching recency or the hit counters.
    pub fn peek(&self, address: u64) -> Option<&Arc<Page>> {
        self.map.get(&address).map(|e| &e.page)
    }

    pub fn insert(&mut self, page: Arc<Page>) {
        self.tick += 1;
        let tick = self.tick;
        self.map.insert(
            page.address(),
            Entry {
                page,
                last_used: tick,
            },
        );
    }

    pub fn remove(&mut self, address: u64) -> Option<Arc<Page>> {
        self.map.remove(&address).map(|e| e.page)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.map.len() * self.page_size
    }

    pub fn is_over_budget(&self) -> bool {
        self.used_bytes() > self.capacity_bytes
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Removes and returns the least-recently-used unpinned entries until
    /// the cache is back under budget (or no evictable entry remains).
    /// Dirty pages are returned too; flushing them is the caller's job.
    pub fn collect_victims(&mut self) -> Vec<Arc<Page>> {
        let mut victims = Vec::new();
        while self.used_bytes() > self.capacity_bytes {
            let candidate = self
                .map
                .iter()
                .filter(|(_, e)| is_unreferenced(&e.page))
                .min_by_key(|(_, e)| e.last_used)
                .map(|(addr, _)| *addr);

            match candidate {
                Some(addr) => {
                    if let Some(entry) = self.map.remove(&addr) {
                        victims.push(entry.page);
                    }
                }
                None => break,
            }
        }
        victims
    }

    /// All entries for one database, used when a database closes.
    pub fn pages_of_db(&self, dbname: u16) -> Vec<Arc<Page>> {
        self.map
            .values()
            .filter(|e| e.page.db() == dbname)
            .map(|e| Arc::clone(&e.page))
            .collect()
    }

    /// Every cached page, in no particular order.
    pub fn all_pages(&self) -> Vec<Arc<Page>> {
        self.map.values().map(|e| Arc::clone(&e.page)).collect()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;

    const PAGE_SIZE: usize = 4096;

    fn page(address: u64) -> Arc<Page> {
        Arc::new(Page::new_allocated(
            address,
            PageType::BtreeLeaf,
            PAGE_SIZE,
            false,
        ))
    }

    #[test]
    fn get_returns_inserted_page_and_counts_hit() {
        let mut cache = Cache::new(16 * PAGE_SIZE, PAGE_SIZE);
        cache.insert(page(0));

        assert!(cache.get(0).is_some());
        assert!(cache.get(PAGE_SIZE as u64).is_none());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn victims_come_in_lru_order() {
        let mut cache = Cache::new(2 * PAGE_SIZE, PAGE_SIZE);
        for i in 0..4u64 {
            cache.insert(page(i * PAGE_SIZE as u64));
        }
        // touch page 0 so it is the most recent
        cache.get(0);

        let victims = cache.collect_victims();
        assert_eq!(victims.len(), 2);
        assert_eq!(victims[0].address(), PAGE_SIZE as u64);
        assert_eq!(victims[1].address(), 2 * PAGE_SIZE as u64);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn pinned_pages_are_not_evicted() {
        let mut cache = Cache::new(PAGE_SIZE, PAGE_SIZE);
        let pinned = page(0);
        cache.insert(Arc::clone(&pinned)); // external Arc keeps it pinned
        cache.insert(page(PAGE_SIZE as u64));
        cache.insert(page(2 * PAGE_SIZE as u64));

        let victims = cache.collect_victims();
        assert!(victims.iter().all(|p| p.address() != 0));
    }

    #[test]
    fn pages_of_db_filters_by_tag() {
        let mut cache = Cache::new(16 * PAGE_SIZE, PAGE_SIZE);
        let a = page(0);
        a.set_db(7);
        let b = page(PAGE_SIZE as u64);
        b.set_db(9);
        cache.insert(a);
        cache.insert(b);

        let of_seven = cache.pages_of_db(7);
        assert_eq!(of_seven.len(), 1);
        assert_eq!(of_seven[0].db(), 7);
    }
}
