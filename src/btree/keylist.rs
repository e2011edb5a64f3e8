//! # Key List Layouts
//!
//! A node's keys live in an array of fixed-size cells so that insert and
//! erase are plain `memmove`s of whole cells. Two layouts exist, selected
//! per database by the key type:
//!
//! - **Fixed**: POD key types (`u8..u64`, `f32`, `f64`) and fixed-size
//!   binary keys. The cell is the raw key encoding, nothing else.
//! - **Variable**: unlimited binary keys. A 32-byte cell holds up to 30
//!   inline bytes; longer keys spill into an overflow blob and the cell
//!   stores the blob id plus the full key size:
//!
//! ```text
//! inline:   { flags=0, size u8, bytes[30] }
//! overflow: { flags=1, 0,       blob_id u64, key_size u32, unused[18] }
//! ```
//!
//! Both layouts are delete-stable: erasing a key never needs more space
//! than before. The `delete_stable` capability is still surfaced because
//! the erase driver falls back to split-and-retry for layouts that are
//! not (compressed encodings can grow on delete).

use eyre::{ensure, Result};

use crate::config::{KeyType, KEY_CELL_SIZE, KEY_INLINE_MAX};
use crate::error::ErrorKind;

const FLAG_OVERFLOW: u8 = 1 << 0;

/// A key as stored in a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRef<'a> {
    Inline(&'a [u8]),
    Overflow { blob_id: u64, size: u32 },
}

/// A key to be written into a cell.
#[derive(Debug, Clone, Copy)]
pub enum KeySource<'a> {
    Inline(&'a [u8]),
    Overflow { blob_id: u64, size: u32 },
}

#[derive(Debug, Clone, Copy)]
pub enum KeyList {
    Fixed { size: usize, key_type: KeyType },
    Variable,
}

impl KeyList {
    pub fn for_db(key_type: KeyType, key_size: u32) -> Self {
        match key_type.fixed_size() {
            Some(size) => KeyList::Fixed { size, key_type },
            None if key_size != crate::config::KEY_SIZE_UNLIMITED => KeyList::Fixed {
                size: key_size as usize,
                key_type,
            },
            None => KeyList::Variable,
        }
    }

    pub fn cell_size(&self) -> usize {
        match self {
            KeyList::Fixed { size, .. } => *size,
            KeyList::Variable => KEY_CELL_SIZE,
        }
    }

    /// Erase never grows either layout.
    pub fn delete_stable(&self) -> bool {
        true
    }

    /// True when the cells are a packed array of the raw keys (enables
    /// the packed-array scan path).
    pub fn is_packed_pod(&self) -> bool {
        matches!(self, KeyList::Fixed { .. })
    }

    fn cell<'a>(&self, cells: &'a [u8], slot: usize) -> &'a [u8] {
        let size = self.cell_size();
        &cells[slot * size..(slot + 1) * size]
    }

    fn cell_mut<'a>(&self, cells: &'a mut [u8], slot: usize) -> &'a mut [u8] {
        let size = self.cell_size();
        &mut cells[slot * size..(slot + 1) * size]
    }

    /// Decodes the key stored at `slot`.
    pub fn key_ref<'a>(&self, cells: &'a [u8], slot: usize) -> KeyRef<'a> {
        let cell = self.cell(cells, slot);
        match self {
            KeyList::Fixed { .. } => KeyRef::Inline(cell),
            KeyList::Variable => {
                if cell[0] & FLAG_OVERFLOW != 0 {
                    KeyRef::Overflow {
                        blob_id: u64::from_le_bytes(cell[2..10].try_into().unwrap()),
                        size: u32::from_le_bytes(cell[10..14].try_into().unwrap()),
                    }
                } else {
                    let len = cell[1] as usize;
                    KeyRef::Inline(&cell[2..2 + len])
                }
            }
        }
    }

    /// Writes a key into `slot`, overwriting the cell.
    pub fn write_key(&self, cells: &mut [u8], slot: usize, key: KeySource<'_>) -> Result<()> {
        let cell = self.cell_mut(cells, slot);
        match (self, key) {
            (KeyList::Fixed { size, .. }, KeySource::Inline(bytes)) => {
                ensure!(bytes.len() == *size, ErrorKind::InvalidKeySize);
                cell.copy_from_slice(bytes);
            }
            (KeyList::Fixed { .. }, KeySource::Overflow { .. }) => {
                eyre::bail!(ErrorKind::InvalidKeySize)
            }
            (KeyList::Variable, KeySource::Inline(bytes)) => {
                ensure!(bytes.len() <= KEY_INLINE_MAX, ErrorKind::InvalidKeySize);
                cell.fill(0);
                cell[1] = bytes.len() as u8;
                cell[2..2 + bytes.len()].copy_from_slice(bytes);
            }
            (KeyList::Variable, KeySource::Overflow { blob_id, size }) => {
                cell.fill(0);
                cell[0] = FLAG_OVERFLOW;
                cell[2..10].copy_from_slice(&blob_id.to_le_bytes());
                cell[10..14].copy_from_slice(&size.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Opens a gap at `slot` by shifting cells `[slot, count)` right.
    pub fn insert_gap(&self, cells: &mut [u8], count: usize, slot: usize) {
        let size = self.cell_size();
        cells.copy_within(slot * size..count * size, (slot + 1) * size);
    }

    /// Removes `slot` by shifting cells `(slot, count)` left.
    pub fn remove(&self, cells: &mut [u8], count: usize, slot: usize) -> Result<()> {
        let size = self.cell_size();
        cells.copy_within((slot + 1) * size..count * size, slot * size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_cells_store_raw_keys() {
        let list = KeyList::for_db(KeyType::U32, 4);
        assert_eq!(list.cell_size(), 4);

        let mut cells = vec![0u8; 16];
        list.write_key(&mut cells, 1, KeySource::Inline(&7u32.to_le_bytes()))
            .unwrap();

        match list.key_ref(&cells, 1) {
            KeyRef::Inline(bytes) => assert_eq!(bytes, 7u32.to_le_bytes()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn fixed_rejects_wrong_size() {
        let list = KeyList::for_db(KeyType::U64, 8);
        let mut cells = vec![0u8; 8];
        assert!(list
            .write_key(&mut cells, 0, KeySource::Inline(b"abc"))
            .is_err());
    }

    #[test]
    fn variable_inline_round_trips() {
        let list = KeyList::for_db(KeyType::Binary, crate::config::KEY_SIZE_UNLIMITED);
        let mut cells = vec![0u8; 2 * KEY_CELL_SIZE];
        list.write_key(&mut cells, 0, KeySource::Inline(b"hello"))
            .unwrap();

        assert_eq!(list.key_ref(&cells, 0), KeyRef::Inline(b"hello"));
    }

    #[test]
    fn variable_overflow_round_trips() {
        let list = KeyList::Variable;
        let mut cells = vec![0u8; KEY_CELL_SIZE];
        list.write_key(
            &mut cells,
            0,
            KeySource::Overflow {
                blob_id: 0xDEAD_BEEF,
                size: 1000,
            },
        )
        .unwrap();

        assert_eq!(
            list.key_ref(&cells, 0),
            KeyRef::Overflow {
                blob_id: 0xDEAD_BEEF,
                size: 1000
            }
        );
    }

    #[test]
    fn gap_and_remove_shift_whole_cells() {
        let list = KeyList::for_db(KeyType::U8, 1);
        let mut cells = vec![10u8, 20, 30, 0];

        list.insert_gap(&mut cells, 3, 1);
        list.write_key(&mut cells, 1, KeySource::Inline(&[15]))
            .unwrap();
        assert_eq!(&cells[..4], &[10, 15, 20, 30]);

        list.remove(&mut cells, 4, 0).unwrap();
        assert_eq!(&cells[..3], &[15, 20, 30]);
    }
}
