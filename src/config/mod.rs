//! # Environment and Database Configuration
//!
//! [`EnvConfig`] describes one file environment (page size, cache budget,
//! journal tuning, behavior flags); [`DbConfig`] describes one named
//! database inside it (key type and size, record size, duplicate policy).
//! Both are plain builders consumed by `Environment::create`/`open` and
//! `Environment::create_db`.
//!
//! Flags are plain `u32` bit constants grouped in the [`env_flags`],
//! [`db_flags`] and [`op_flags`] modules; they travel through the journal
//! unchanged, so their values are part of the on-disk format.

pub mod constants;

pub use constants::*;

/// Environment behavior flags.
pub mod env_flags {
    /// Keep everything in memory; no data file, no journal.
    pub const IN_MEMORY: u32 = 1 << 0;
    /// Enable the transaction layer and the journal.
    pub const ENABLE_TRANSACTIONS: u32 = 1 << 1;
    /// fsync the journal on every commit.
    pub const ENABLE_FSYNC: u32 = 1 << 2;
    /// Open the environment read-only; all mutations fail.
    pub const READ_ONLY: u32 = 1 << 3;
    /// Flush changesets immediately when a transaction commits.
    pub const FLUSH_WHEN_COMMITTED: u32 = 1 << 4;
    /// Skip journal recovery on open even if the journal has content.
    pub const DISABLE_RECOVERY: u32 = 1 << 5;
    /// Fail cache-overflowing allocations instead of purging best-effort.
    pub const CACHE_STRICT: u32 = 1 << 6;
    /// Never mmap the data file; reads go through pread.
    pub const DISABLE_MMAP: u32 = 1 << 7;
    /// Maintain and verify per-page CRC32 checksums.
    pub const ENABLE_CRC32: u32 = 1 << 8;
    /// Run recovery automatically when the journal is non-empty.
    pub const AUTO_RECOVERY: u32 = 1 << 9;
    /// Close open databases/cursors automatically on environment close.
    pub const AUTO_CLEANUP: u32 = 1 << 10;
}

/// Per-database flags.
pub mod db_flags {
    /// Allow more than one record per key.
    pub const ENABLE_DUPLICATE_KEYS: u32 = 1 << 0;
    /// Keys are auto-assigned ascending u64 record numbers.
    pub const RECORD_NUMBER: u32 = 1 << 1;
    /// Keys are auto-assigned ascending u32 record numbers.
    pub const RECORD_NUMBER32: u32 = 1 << 2;
}

/// Per-operation flags for insert, erase, find and cursor moves.
pub mod op_flags {
    /// Replace the record if the key exists.
    pub const OVERWRITE: u32 = 1 << 0;
    /// Add a duplicate if the key exists.
    pub const DUPLICATE: u32 = 1 << 1;
    /// Insert the duplicate before the current cursor position.
    pub const DUPLICATE_INSERT_BEFORE: u32 = 1 << 2;
    /// Insert the duplicate after the current cursor position.
    pub const DUPLICATE_INSERT_AFTER: u32 = 1 << 3;
    /// Insert the duplicate at the head of the duplicate list.
    pub const DUPLICATE_INSERT_FIRST: u32 = 1 << 4;
    /// Insert the duplicate at the tail of the duplicate list.
    pub const DUPLICATE_INSERT_LAST: u32 = 1 << 5;
    /// Caller promises the key sorts after every existing key.
    pub const HINT_APPEND: u32 = 1 << 6;
    /// Caller promises the key sorts before every existing key.
    pub const HINT_PREPEND: u32 = 1 << 7;
    /// Read or write only a slice of the record.
    pub const PARTIAL: u32 = 1 << 8;
    /// Approximate find: greatest key strictly below the lookup key.
    pub const FIND_LT_MATCH: u32 = 1 << 9;
    /// Approximate find: smallest key strictly above the lookup key.
    pub const FIND_GT_MATCH: u32 = 1 << 10;
    /// Approximate find: exact match or the next key below.
    pub const FIND_LEQ_MATCH: u32 = 1 << 11;
    /// Approximate find: exact match or the next key above.
    pub const FIND_GEQ_MATCH: u32 = 1 << 12;
    /// Internal: the caller already holds the environment lock.
    pub const DONT_LOCK: u32 = 1 << 13;

    /// Any of the approximate-match bits.
    pub const FIND_NEAR_MATCH: u32 =
        FIND_LT_MATCH | FIND_GT_MATCH | FIND_LEQ_MATCH | FIND_GEQ_MATCH;
}

/// Key encodings supported by the b-tree, each with its own comparator.
///
/// Numeric types compare by value (little-endian on disk); `Binary`
/// compares lexicographically. NaN floats are rejected on insert because
/// they are unordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Binary,
}

impl KeyType {
    /// Fixed encoded width, or `None` for variable-size binary keys.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            KeyType::U8 => Some(1),
            KeyType::U16 => Some(2),
            KeyType::U32 => Some(4),
            KeyType::U64 => Some(8),
            KeyType::F32 => Some(4),
            KeyType::F64 => Some(8),
            KeyType::Binary => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            KeyType::U8 => 1,
            KeyType::U16 => 2,
            KeyType::U32 => 3,
            KeyType::U64 => 4,
            KeyType::F32 => 5,
            KeyType::F64 => 6,
            KeyType::Binary => 7,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(KeyType::U8),
            2 => Some(KeyType::U16),
            3 => Some(KeyType::U32),
            4 => Some(KeyType::U64),
            5 => Some(KeyType::F32),
            6 => Some(KeyType::F64),
            7 => Some(KeyType::Binary),
            _ => None,
        }
    }
}

/// Key size value meaning "no fixed size".
pub const KEY_SIZE_UNLIMITED: u32 = 0;
/// Record size value meaning "no fixed size".
pub const RECORD_SIZE_UNLIMITED: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub page_size: usize,
    pub cache_size_bytes: usize,
    pub max_databases: u16,
    pub file_size_limit_bytes: u64,
    pub journal_switch_threshold: u32,
    pub journal_buffer_threshold: usize,
    pub flags: u32,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size_bytes: DEFAULT_CACHE_SIZE,
            max_databases: DEFAULT_MAX_DATABASES,
            file_size_limit_bytes: DEFAULT_FILE_SIZE_LIMIT,
            journal_switch_threshold: JOURNAL_SWITCH_THRESHOLD,
            journal_buffer_threshold: JOURNAL_BUFFER_THRESHOLD,
            flags: 0,
        }
    }
}

impl EnvConfig {
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.cache_size_bytes = bytes;
        self
    }

    pub fn max_databases(mut self, n: u16) -> Self {
        self.max_databases = n;
        self
    }

    pub fn file_size_limit(mut self, bytes: u64) -> Self {
        self.file_size_limit_bytes = bytes;
        self
    }

    pub fn journal_switch_threshold(mut self, txns: u32) -> Self {
        self.journal_switch_threshold = txns;
        self
    }

    pub fn in_memory(self, on: bool) -> Self {
        self.toggle(env_flags::IN_MEMORY, on)
    }

    pub fn enable_transactions(self, on: bool) -> Self {
        self.toggle(env_flags::ENABLE_TRANSACTIONS, on)
    }

    pub fn enable_fsync(self, on: bool) -> Self {
        self.toggle(env_flags::ENABLE_FSYNC, on)
    }

    pub fn read_only(self, on: bool) -> Self {
        self.toggle(env_flags::READ_ONLY, on)
    }

    pub fn disable_recovery(self, on: bool) -> Self {
        self.toggle(env_flags::DISABLE_RECOVERY, on)
    }

    pub fn cache_strict(self, on: bool) -> Self {
        self.toggle(env_flags::CACHE_STRICT, on)
    }

    pub fn disable_mmap(self, on: bool) -> Self {
        self.toggle(env_flags::DISABLE_MMAP, on)
    }

    pub fn enable_crc32(self, on: bool) -> Self {
        self.toggle(env_flags::ENABLE_CRC32, on)
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    fn toggle(mut self, flag: u32, on: bool) -> Self {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub key_type: KeyType,
    pub key_size: u32,
    pub record_size: u32,
    pub flags: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            key_type: KeyType::Binary,
            key_size: KEY_SIZE_UNLIMITED,
            record_size: RECORD_SIZE_UNLIMITED,
            flags: 0,
        }
    }
}

impl DbConfig {
    pub fn key_type(mut self, kt: KeyType) -> Self {
        self.key_type = kt;
        if let Some(size) = kt.fixed_size() {
            self.key_size = size as u32;
        }
        self
    }

    pub fn key_size(mut self, bytes: u32) -> Self {
        self.key_size = bytes;
        self
    }

    pub fn record_size(mut self, bytes: u32) -> Self {
        self.record_size = bytes;
        self
    }

    pub fn enable_duplicates(mut self, on: bool) -> Self {
        if on {
            self.flags |= db_flags::ENABLE_DUPLICATE_KEYS;
        } else {
            self.flags &= !db_flags::ENABLE_DUPLICATE_KEYS;
        }
        self
    }

    pub fn record_number(mut self, on: bool) -> Self {
        if on {
            self.flags |= db_flags::RECORD_NUMBER;
            self.key_type = KeyType::U64;
            self.key_size = 8;
        } else {
            self.flags &= !db_flags::RECORD_NUMBER;
        }
        self
    }

    pub fn record_number32(mut self, on: bool) -> Self {
        if on {
            self.flags |= db_flags::RECORD_NUMBER32;
            self.key_type = KeyType::U32;
            self.key_size = 4;
        } else {
            self.flags &= !db_flags::RECORD_NUMBER32;
        }
        self
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn is_record_number(&self) -> bool {
        self.flags & (db_flags::RECORD_NUMBER | db_flags::RECORD_NUMBER32) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_config_defaults() {
        let config = EnvConfig::default();
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.max_databases, DEFAULT_MAX_DATABASES);
        assert_eq!(config.flags, 0);
    }

    #[test]
    fn env_config_flag_toggles() {
        let config = EnvConfig::default()
            .enable_transactions(true)
            .enable_fsync(true)
            .enable_fsync(false);
        assert!(config.has(env_flags::ENABLE_TRANSACTIONS));
        assert!(!config.has(env_flags::ENABLE_FSYNC));
    }

    #[test]
    fn db_config_key_type_sets_fixed_size() {
        let config = DbConfig::default().key_type(KeyType::U32);
        assert_eq!(config.key_size, 4);

        let config = DbConfig::default().key_type(KeyType::Binary);
        assert_eq!(config.key_size, KEY_SIZE_UNLIMITED);
    }

    #[test]
    fn record_number_forces_u64_keys() {
        let config = DbConfig::default().record_number(true);
        assert_eq!(config.key_type, KeyType::U64);
        assert_eq!(config.key_size, 8);
        assert!(config.is_record_number());
    }

    #[test]
    fn key_type_round_trips_through_byte() {
        for kt in [
            KeyType::U8,
            KeyType::U16,
            KeyType::U32,
            KeyType::U64,
            KeyType::F32,
            KeyType::F64,
            KeyType::Binary,
        ] {
            assert_eq!(KeyType::from_byte(kt.to_byte()), Some(kt));
        }
        assert_eq!(KeyType::from_byte(0), None);
    }
}
