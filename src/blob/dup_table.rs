//! # Duplicate Tables
//!
//! When a key holds more than one record, the records move out of the
//! node into a duplicate table: a blob with an 8-byte header
//! `{ count u32, capacity u32 }` followed by fixed 16-byte entries.
//!
//! ```text
//! entry: { flags u8, _pad [3], size u32, payload [8] }
//! ```
//!
//! A record of up to 8 bytes lives inline in the payload; anything larger
//! is its own blob and the payload holds the blob id. The table grows by
//! doubling its capacity, which relocates the table blob; callers must
//! store the returned table id back into the record cell.

use eyre::{ensure, Result};

use crate::config::DUP_TABLE_ENTRY_SIZE;
use crate::error::ErrorKind;
use crate::pager::{Context, PageManager};

use super::BlobManager;

const TABLE_HEADER_SIZE: usize = 8;
const ENTRY_BLOB: u8 = 1 << 0;
const INITIAL_CAPACITY: u32 = 8;

fn entry_range(index: u32) -> std::ops::Range<usize> {
    let start = TABLE_HEADER_SIZE + index as usize * DUP_TABLE_ENTRY_SIZE;
    start..start + DUP_TABLE_ENTRY_SIZE
}

fn read_header(bytes: &[u8]) -> Result<(u32, u32)> {
    ensure!(bytes.len() >= TABLE_HEADER_SIZE, ErrorKind::IntegrityViolated);
    let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let capacity = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    ensure!(count <= capacity, ErrorKind::IntegrityViolated);
    Ok((count, capacity))
}

fn write_entry(
    blobs: &mut BlobManager,
    pager: &mut PageManager,
    ctx: &mut Context,
    bytes: &mut [u8],
    index: u32,
    record: &[u8],
) -> Result<()> {
    let range = entry_range(index);
    let entry = &mut bytes[range];
    entry.fill(0);
    entry[4..8].copy_from_slice(&(record.len() as u32).to_le_bytes());
    if record.len() <= 8 {
        entry[8..8 + record.len()].copy_from_slice(record);
    } else {
        entry[0] = ENTRY_BLOB;
        let blob_id = blobs.allocate(pager, ctx, record)?;
        entry[8..16].copy_from_slice(&blob_id.to_le_bytes());
    }
    Ok(())
}

fn free_entry_blob(
    blobs: &mut BlobManager,
    pager: &mut PageManager,
    ctx: &mut Context,
    bytes: &[u8],
    index: u32,
) -> Result<()> {
    let range = entry_range(index);
    let entry = &bytes[range];
    if entry[0] & ENTRY_BLOB != 0 {
        let blob_id = u64::from_le_bytes(entry[8..16].try_into().unwrap());
        blobs.erase(pager, ctx, blob_id)?;
    }
    Ok(())
}

/// Creates a table holding `records`, returns the table blob id.
pub fn create(
    blobs: &mut BlobManager,
    pager: &mut PageManager,
    ctx: &mut Context,
    records: &[&[u8]],
) -> Result<u64> {
    let capacity = (records.len() as u32).next_power_of_two().max(INITIAL_CAPACITY);
    let mut bytes = vec![0u8; TABLE_HEADER_SIZE + capacity as usize * DUP_TABLE_ENTRY_SIZE];
    bytes[0..4].copy_from_slice(&(records.len() as u32).to_le_bytes());
    bytes[4..8].copy_from_slice(&capacity.to_le_bytes());

    for (i, record) in records.iter().enumerate() {
        write_entry(blobs, pager, ctx, &mut bytes, i as u32, record)?;
    }
    blobs.allocate(pager, ctx, &bytes)
}

pub fn count(
    blobs: &mut BlobManager,
    pager: &mut PageManager,
    ctx: &mut Context,
    table_id: u64,
) -> Result<u32> {
    let bytes = blobs.read(pager, ctx, table_id)?;
    Ok(read_header(&bytes)?.0)
}

pub fn record(
    blobs: &mut BlobManager,
    pager: &mut PageManager,
    ctx: &mut Context,
    table_id: u64,
    index: u32,
) -> Result<Vec<u8>> {
    let bytes = blobs.read(pager, ctx, table_id)?;
    let (table_count, _) = read_header(&bytes)?;
    ensure!(index < table_count, ErrorKind::KeyNotFound);

    let range = entry_range(index);
    let entry = &bytes[range];
    let size = u32::from_le_bytes(entry[4..8].try_into().unwrap()) as usize;
    if entry[0] & ENTRY_BLOB != 0 {
        let blob_id = u64::from_le_bytes(entry[8..16].try_into().unwrap());
        blobs.read(pager, ctx, blob_id)
    } else {
        Ok(entry[8..8 + size].to_vec())
    }
}

/// Inserts a record at `index` (entries at and above shift up). Returns
/// the table id, which changes when the table grows.
pub fn insert(
    blobs: &mut BlobManager,
    pager: &mut PageManager,
    ctx: &mut Context,
    table_id: u64,
    index: u32,
    new_record: &[u8],
) -> Result<u64> {
    let mut bytes = blobs.read(pager, ctx, table_id)?;
    let (table_count, capacity) = read_header(&bytes)?;
    ensure!(index <= table_count, ErrorKind::InvalidArg);

    if table_count == capacity {
        let new_capacity = capacity * 2;
        bytes.resize(
            TABLE_HEADER_SIZE + new_capacity as usize * DUP_TABLE_ENTRY_SIZE,
            0,
        );
        bytes[4..8].copy_from_slice(&new_capacity.to_le_bytes());
    }

    // shift entries up
    let src = entry_range(index).start;
    let len = (table_count - index) as usize * DUP_TABLE_ENTRY_SIZE;
    bytes.copy_within(src..src + len, src + DUP_TABLE_ENTRY_SIZE);

    write_entry(blobs, pager, ctx, &mut bytes, index, new_record)?;
    bytes[0..4].copy_from_slice(&(table_count + 1).to_le_bytes());
    blobs.overwrite(pager, ctx, table_id, &bytes)
}

/// Replaces the record at `index` in place.
pub fn overwrite(
    blobs: &mut BlobManager,
    pager: &mut PageManager,
    ctx: &mut Context,
    table_id: u64,
    index: u32,
    new_record: &[u8],
) -> Result<()> {
    let mut bytes = blobs.read(pager, ctx, table_id)?;
    let (table_count, _) = read_header(&bytes)?;
    ensure!(index < table_count, ErrorKind::KeyNotFound);

    free_entry_blob(blobs, pager, ctx, &bytes, index)?;
    write_entry(blobs, pager, ctx, &mut bytes, index, new_record)?;
    let id = blobs.overwrite(pager, ctx, table_id, &bytes)?;
    debug_assert_eq!(id, table_id, "in-place table overwrite must not relocate");
    Ok(())
}

/// Removes the record at `index`. Returns the surviving table id, or
/// `None` when the table became empty and was freed.
pub fn erase(
    blobs: &mut BlobManager,
    pager: &mut PageManager,
    ctx: &mut Context,
    table_id: u64,
    index: u32,
) -> Result<Option<u64>> {
    let mut bytes = blobs.read(pager, ctx, table_id)?;
    let (table_count, _) = read_header(&bytes)?;
    ensure!(index < table_count, ErrorKind::KeyNotFound);

    free_entry_blob(blobs, pager, ctx, &bytes, index)?;

    if table_count == 1 {
        blobs.erase(pager, ctx, table_id)?;
        return Ok(None);
    }

    let dst = entry_range(index).start;
    let len = (table_count - index - 1) as usize * DUP_TABLE_ENTRY_SIZE;
    bytes.copy_within(dst + DUP_TABLE_ENTRY_SIZE..dst + DUP_TABLE_ENTRY_SIZE + len, dst);
    bytes[0..4].copy_from_slice(&(table_count - 1).to_le_bytes());

    let id = blobs.overwrite(pager, ctx, table_id, &bytes)?;
    Ok(Some(id))
}

/// Frees the table and every record blob it references.
pub fn erase_all(
    blobs: &mut BlobManager,
    pager: &mut PageManager,
    ctx: &mut Context,
    table_id: u64,
) -> Result<()> {
    let bytes = blobs.read(pager, ctx, table_id)?;
    let (table_count, _) = read_header(&bytes)?;
    for index in 0..table_count {
        free_entry_blob(blobs, pager, ctx, &bytes, index)?;
    }
    blobs.erase(pager, ctx, table_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::device::MemoryDevice;
    use std::sync::Arc;

    fn setup() -> (PageManager, BlobManager, Context) {
        let config = EnvConfig::default();
        let device = MemoryDevice::new(config.page_size);
        let pager = PageManager::new(Arc::new(device), &config);
        let blobs = BlobManager::new(config.page_size);
        (pager, blobs, Context::new(0, None))
    }

    #[test]
    fn create_and_read_back_entries() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let table = create(
            &mut blobs,
            &mut pager,
            &mut ctx,
            &[b"one", b"two", b"three"],
        )
        .unwrap();

        assert_eq!(count(&mut blobs, &mut pager, &mut ctx, table).unwrap(), 3);
        assert_eq!(
            record(&mut blobs, &mut pager, &mut ctx, table, 1).unwrap(),
            b"two"
        );
    }

    #[test]
    fn long_records_round_trip_through_entry_blobs() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let long = vec![0xEE; 300];
        let table = create(&mut blobs, &mut pager, &mut ctx, &[b"short", &long]).unwrap();

        assert_eq!(
            record(&mut blobs, &mut pager, &mut ctx, table, 1).unwrap(),
            long
        );
    }

    #[test]
    fn insert_shifts_entries() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let table = create(&mut blobs, &mut pager, &mut ctx, &[b"a", b"c"]).unwrap();
        let table = insert(&mut blobs, &mut pager, &mut ctx, table, 1, b"b").unwrap();

        assert_eq!(count(&mut blobs, &mut pager, &mut ctx, table).unwrap(), 3);
        for (i, expected) in [b"a", b"b", b"c"].iter().enumerate() {
            assert_eq!(
                record(&mut blobs, &mut pager, &mut ctx, table, i as u32).unwrap(),
                expected.to_vec()
            );
        }
    }

    #[test]
    fn growth_relocates_the_table() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let records: Vec<&[u8]> = (0..INITIAL_CAPACITY).map(|_| b"x".as_slice()).collect();
        let table = create(&mut blobs, &mut pager, &mut ctx, &records).unwrap();
        let grown = insert(&mut blobs, &mut pager, &mut ctx, table, 0, b"y").unwrap();

        assert_ne!(grown, table);
        assert_eq!(
            count(&mut blobs, &mut pager, &mut ctx, grown).unwrap(),
            INITIAL_CAPACITY + 1
        );
        assert_eq!(
            record(&mut blobs, &mut pager, &mut ctx, grown, 0).unwrap(),
            b"y"
        );
    }

    #[test]
    fn erase_last_entry_frees_the_table() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let table = create(&mut blobs, &mut pager, &mut ctx, &[b"solo"]).unwrap();
        let result = erase(&mut blobs, &mut pager, &mut ctx, table, 0).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn erase_middle_entry_compacts() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let table = create(&mut blobs, &mut pager, &mut ctx, &[b"a", b"b", b"c"]).unwrap();
        let table = erase(&mut blobs, &mut pager, &mut ctx, table, 1)
            .unwrap()
            .unwrap();

        assert_eq!(count(&mut blobs, &mut pager, &mut ctx, table).unwrap(), 2);
        assert_eq!(
            record(&mut blobs, &mut pager, &mut ctx, table, 1).unwrap(),
            b"c"
        );
    }

    #[test]
    fn overwrite_replaces_in_place() {
        let (mut pager, mut blobs, mut ctx) = setup();

        let table = create(&mut blobs, &mut pager, &mut ctx, &[b"old", b"keep"]).unwrap();
        overwrite(&mut blobs, &mut pager, &mut ctx, table, 0, b"new").unwrap();

        assert_eq!(
            record(&mut blobs, &mut pager, &mut ctx, table, 0).unwrap(),
            b"new"
        );
        assert_eq!(
            record(&mut blobs, &mut pager, &mut ctx, table, 1).unwrap(),
            b"keep"
        );
    }
}
