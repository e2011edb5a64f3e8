//! # Freelist
//!
//! Map from free page address to run length, kept coalesced: adjacent
//! runs merge on insert, so the map stays proportional to fragmentation
//! rather than to the number of freed pages.
//!
//! Allocation policy:
//! - single pages use **first-fit** (lowest address wins, which keeps the
//!   file front-loaded and helps `reclaim_space` truncate the tail)
//! - multi-page runs use **best-fit** (smallest run that holds the
//!   request), the residual returns to the map
//!
//! The freelist is persisted inside the page-manager state blob as a
//! sequence of little-endian `(address u64, length u64)` pairs preceded by
//! a count; see [`serialize`](Freelist::serialize).

use std::collections::BTreeMap;

use eyre::{ensure, Result};

use crate::error::ErrorKind;

#[derive(Debug, Default)]
pub struct Freelist {
    runs: BTreeMap<u64, u64>,
}

impl Freelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn free_pages(&self) -> u64 {
        self.runs.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Returns a run to the map, merging with neighbours.
    pub fn put(&mut self, address: u64, length: u64, page_size: usize) {
        debug_assert!(length > 0);
        let span = length * page_size as u64;

        let mut start = address;
        let mut len = length;

        // merge with the predecessor if it ends exactly at `address`
        if let Some((&prev_start, &prev_len)) = self.runs.range(..address).next_back() {
            if prev_start + prev_len * page_size as u64 == address {
                start = prev_start;
                len += prev_len;
                self.runs.remove(&prev_start);
            }
        }

        // merge with the successor if it starts exactly at the end
        if let Some(next_len) = self.runs.remove(&(address + span)) {
            len += next_len;
        }

        self.runs.insert(start, len);
    }

    /// First-fit single-page allocation.
    pub fn alloc(&mut self, page_size: usize) -> Option<u64> {
        let (&start, &len) = self.runs.iter().next()?;
        self.runs.remove(&start);
        if len > 1 {
            self.runs.insert(start + page_size as u64, len - 1);
        }
        Some(start)
    }

    /// Best-fit allocation of `count` consecutive pages.
    pub fn alloc_run(&mut self, count: u64, page_size: usize) -> Option<u64> {
        let best = self
            .runs
            .iter()
            .filter(|(_, &len)| len >= count)
            .min_by_key(|(_, &len)| len)
            .map(|(&start, &len)| (start, len))?;

        let (start, len) = best;
        self.runs.remove(&start);
        if len > count {
            self.runs
                .insert(start + count * page_size as u64, len - count);
        }
        Some(start)
    }

    /// If a free run ends exactly at `file_size`, removes it and returns
    /// the new (smaller) file size. Used by `reclaim_space`.
    pub fn truncate_tail(&mut self, file_size: u64, page_size: usize) -> Option<u64> {
        let (&start, &len) = self.runs.iter().next_back()?;
        if start + len * page_size as u64 == file_size {
            self.runs.remove(&start);
            Some(start)
        } else {
            None
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.runs.len() as u32).to_le_bytes());
        for (&address, &length) in &self.runs {
            out.extend_from_slice(&address.to_le_bytes());
            out.extend_from_slice(&length.to_le_bytes());
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<(Self, usize)> {
        ensure!(data.len() >= 4, ErrorKind::IntegrityViolated);
        let count = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
        let needed = 4 + count * 16;
        ensure!(data.len() >= needed, ErrorKind::IntegrityViolated);

        let mut runs = BTreeMap::new();
        let mut offset = 4;
        for _ in 0..count {
            let address = u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap());
            let length = u64::from_le_bytes(data[offset + 8..offset + 16].try_into().unwrap());
            runs.insert(address, length);
            offset += 16;
        }
        Ok((Self { runs }, needed))
    }
}
