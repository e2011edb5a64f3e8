//! # Configuration Constants
//!
//! Central definitions for the page layout and the engine's tuning knobs.
//! Constants that depend on each other are co-located; compile-time
//! assertions guard the derivations.
//!
//! ```text
//! DEFAULT_PAGE_SIZE (16384 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (16 bytes, fixed)
//!       │     { address u64, flags u32, crc32 u32 }
//!       │
//!       └─> usable payload = page_size - PAGE_HEADER_SIZE
//!
//! JOURNAL_SWITCH_THRESHOLD (32 transactions)
//!       │
//!       └─> when (open + closed) txns of the active journal file reach
//!           this count and the other file has no open txns, the other
//!           file is truncated and becomes the active file
//!
//! FREELIST_STORE_THRESHOLD (64 entries)
//!       │
//!       └─> the page-manager state blob is re-persisted once the
//!           freelist has grown by this many runs since the last store
//! ```

/// Size of each database page in bytes (16KB). The fundamental unit of
/// I/O, caching and journal changesets.
pub const DEFAULT_PAGE_SIZE: usize = 16384;

/// Smallest page size accepted by [`EnvConfig`](super::EnvConfig).
pub const MIN_PAGE_SIZE: usize = 1024;

/// Size of the persisted page header. Every page written to the device
/// begins with this header except blob continuation pages.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Default capacity of the page cache in bytes (2MB = 128 pages).
pub const DEFAULT_CACHE_SIZE: usize = 2 * 1024 * 1024;

/// Default upper bound for the data file. Allocations beyond this fail
/// with `LimitsReached`.
pub const DEFAULT_FILE_SIZE_LIMIT: u64 = u64::MAX;

/// Default number of database slots in the environment header page.
pub const DEFAULT_MAX_DATABASES: u16 = 64;

/// Journal file rotation threshold, counted in transactions per file.
pub const JOURNAL_SWITCH_THRESHOLD: u32 = 32;

/// Size at which a journal file's write-behind buffer is flushed to the
/// OS even without a commit.
pub const JOURNAL_BUFFER_THRESHOLD: usize = 1024 * 1024;

/// Number of freelist runs added since the last persisted state that
/// forces the page manager to re-store its state blob.
pub const FREELIST_STORE_THRESHOLD: usize = 64;

/// Depth of the queue feeding the page manager's flush worker.
pub const WORKER_QUEUE_DEPTH: usize = 16;

/// Inline capacity of a variable-length key cell; longer keys spill into
/// an overflow blob.
pub const KEY_INLINE_MAX: usize = 30;

/// On-node cell size for variable-length keys.
pub const KEY_CELL_SIZE: usize = 32;

/// On-node cell size for the default record layout:
/// one flag byte plus an 8-byte payload (inline bytes or a blob id).
pub const RECORD_CELL_SIZE: usize = 9;

/// Records up to this many bytes are stored inline in the record cell.
pub const RECORD_INLINE_MAX: usize = 8;

/// Size of one duplicate-table entry.
pub const DUP_TABLE_ENTRY_SIZE: usize = 16;

/// Magic bytes at offset 0 of the environment header page.
pub const ENV_MAGIC: [u8; 8] = *b"STRA0001";

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 3;

const _: () = assert!(KEY_CELL_SIZE == KEY_INLINE_MAX + 2, "key cell derivation mismatch");
const _: () = assert!(
    RECORD_CELL_SIZE == RECORD_INLINE_MAX + 1,
    "record cell derivation mismatch"
);
const _: () = assert!(MIN_PAGE_SIZE > PAGE_HEADER_SIZE * 8);
