//! # Record List Layouts
//!
//! Records, like keys, live in fixed-size cells. Three layouts:
//!
//! - **Default** (leaves, variable-size records): a 9-byte cell
//!   `{ flags u8, payload [8] }`. Records of up to 8 bytes are inline in
//!   the payload; larger records are blobs; a key with more than one
//!   record points at a duplicate table instead:
//!
//! ```text
//! flags bits 0..=3: inline length (0..=8)
//! flags bit  4:     payload is a blob id
//! flags bit  5:     payload is a duplicate-table id
//! ```
//!
//! - **Fixed** (leaves, exact-sized records): the raw record bytes.
//! - **Internal** (internal nodes): an 8-byte child page address.

use eyre::Result;

use crate::config::{RECORD_CELL_SIZE, RECORD_INLINE_MAX};

const FLAG_BLOB: u8 = 1 << 4;
const FLAG_DUP_TABLE: u8 = 1 << 5;
const INLINE_MASK: u8 = 0x0F;

/// A record as stored in a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRef<'a> {
    Inline(&'a [u8]),
    Blob(u64),
    DupTable(u64),
    Fixed(&'a [u8]),
}

/// A record value to write into a cell.
#[derive(Debug, Clone, Copy)]
pub enum RecordSource<'a> {
    Inline(&'a [u8]),
    Blob(u64),
    DupTable(u64),
    Fixed(&'a [u8]),
}

#[derive(Debug, Clone, Copy)]
pub enum RecordList {
    Default,
    Fixed { size: usize },
    Internal,
}

impl RecordList {
    pub fn cell_size(&self) -> usize {
        match self {
            RecordList::Default => RECORD_CELL_SIZE,
            RecordList::Fixed { size } => *size,
            RecordList::Internal => 8,
        }
    }

    fn cell<'a>(&self, cells: &'a [u8], slot: usize) -> &'a [u8] {
        let size = self.cell_size();
        &cells[slot * size..(slot + 1) * size]
    }

    fn cell_mut<'a>(&self, cells: &'a mut [u8], slot: usize) -> &'a mut [u8] {
        let size = self.cell_size();
        &mut cells[slot * size..(slot + 1) * size]
    }

    pub fn record_ref<'a>(&self, cells: &'a [u8], slot: usize) -> RecordRef<'a> {
        let cell = self.cell(cells, slot);
        match self {
            RecordList::Fixed { .. } => RecordRef::Fixed(cell),
            RecordList::Internal => {
                RecordRef::Blob(u64::from_le_bytes(cell.try_into().unwrap()))
            }
            RecordList::Default => {
                let flags = cell[0];
                if flags & FLAG_DUP_TABLE != 0 {
                    RecordRef::DupTable(u64::from_le_bytes(cell[1..9].try_into().unwrap()))
                } else if flags & FLAG_BLOB != 0 {
                    RecordRef::Blob(u64::from_le_bytes(cell[1..9].try_into().unwrap()))
                } else {
                    let len = (flags & INLINE_MASK) as usize;
                    RecordRef::Inline(&cell[1..1 + len])
                }
            }
        }
    }

    pub fn write_record(
        &self,
        cells: &mut [u8],
        slot: usize,
        record: RecordSource<'_>,
    ) -> Result<()> {
        let cell = self.cell_mut(cells, slot);
        match (self, record) {
            (RecordList::Fixed { size }, RecordSource::Fixed(bytes)) => {
                eyre::ensure!(
                    bytes.len() == *size,
                    crate::error::ErrorKind::InvalidRecordSize
                );
                cell.copy_from_slice(bytes);
            }
            (RecordList::Internal, RecordSource::Blob(address)) => {
                cell.copy_from_slice(&address.to_le_bytes());
            }
            (RecordList::Default, RecordSource::Inline(bytes)) => {
                eyre::ensure!(
                    bytes.len() <= RECORD_INLINE_MAX,
                    crate::error::ErrorKind::InvalidRecordSize
                );
                cell.fill(0);
                cell[0] = bytes.len() as u8;
                cell[1..1 + bytes.len()].copy_from_slice(bytes);
            }
            (RecordList::Default, RecordSource::Blob(blob_id)) => {
                cell.fill(0);
                cell[0] = FLAG_BLOB;
                cell[1..9].copy_from_slice(&blob_id.to_le_bytes());
            }
            (RecordList::Default, RecordSource::DupTable(table_id)) => {
                cell.fill(0);
                cell[0] = FLAG_DUP_TABLE;
                cell[1..9].copy_from_slice(&table_id.to_le_bytes());
            }
            _ => eyre::bail!(crate::error::ErrorKind::Internal),
        }
        Ok(())
    }

    /// Child address stored in an internal-node cell.
    pub fn child(&self, cells: &[u8], slot: usize) -> u64 {
        debug_assert!(matches!(self, RecordList::Internal));
        u64::from_le_bytes(self.cell(cells, slot).try_into().unwrap())
    }

    pub fn insert_gap(&self, cells: &mut [u8], count: usize, slot: usize) {
        let size = self.cell_size();
        cells.copy_within(slot * size..count * size, (slot + 1) * size);
    }

    pub fn remove(&self, cells: &mut [u8], count: usize, slot: usize) {
        let size = self.cell_size();
        cells.copy_within((slot + 1) * size..count * size, slot * size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_inline_round_trips() {
        let list = RecordList::Default;
        let mut cells = vec![0u8; 2 * RECORD_CELL_SIZE];
        list.write_record(&mut cells, 1, RecordSource::Inline(b"abc"))
            .unwrap();

        assert_eq!(list.record_ref(&cells, 1), RecordRef::Inline(b"abc"));
    }

    #[test]
    fn default_blob_and_dup_table_are_distinguished() {
        let list = RecordList::Default;
        let mut cells = vec![0u8; 2 * RECORD_CELL_SIZE];
        list.write_record(&mut cells, 0, RecordSource::Blob(77)).unwrap();
        list.write_record(&mut cells, 1, RecordSource::DupTable(88))
            .unwrap();

        assert_eq!(list.record_ref(&cells, 0), RecordRef::Blob(77));
        assert_eq!(list.record_ref(&cells, 1), RecordRef::DupTable(88));
    }

    #[test]
    fn inline_longer_than_eight_bytes_is_rejected() {
        let list = RecordList::Default;
        let mut cells = vec![0u8; RECORD_CELL_SIZE];
        assert!(list
            .write_record(&mut cells, 0, RecordSource::Inline(b"123456789"))
            .is_err());
    }

    #[test]
    fn fixed_cells_hold_raw_records() {
        let list = RecordList::Fixed { size: 4 };
        let mut cells = vec![0u8; 8];
        list.write_record(&mut cells, 1, RecordSource::Fixed(b"wxyz"))
            .unwrap();

        assert_eq!(list.record_ref(&cells, 1), RecordRef::Fixed(b"wxyz"));
    }

    #[test]
    fn internal_cells_hold_child_addresses() {
        let list = RecordList::Internal;
        let mut cells = vec![0u8; 16];
        list.write_record(&mut cells, 0, RecordSource::Blob(16384))
            .unwrap();

        assert_eq!(list.child(&cells, 0), 16384);
    }
}
