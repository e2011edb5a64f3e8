//! # stratadb - Embedded Transactional Key-Value Storage
//!
//! stratadb is an embedded storage engine providing ordered, durable,
//! transactional access to one or more named databases stored within a
//! single file environment. This implementation prioritizes:
//!
//! - **Crash safety**: every mutation is journaled before it touches the
//!   data file; recovery replays the journal on the next open
//! - **Predictable memory**: a bounded page cache with LRU eviction and a
//!   background flush worker
//! - **Zero-copy page access**: on-disk headers are decoded in place with
//!   `zerocopy`, never deserialized into intermediate structs
//!
//! ## Quick Start
//!
//! ```ignore
//! use stratadb::{Environment, EnvConfig, DbConfig};
//!
//! let env = Environment::create("./app.db", EnvConfig::default()
//!     .enable_transactions(true))?;
//! let db = env.create_db(1, DbConfig::default())?;
//!
//! let txn = env.begin_txn(0)?;
//! db.insert(Some(&txn), b"hello", b"world", 0)?;
//! txn.commit()?;
//!
//! assert_eq!(db.find(None, b"hello", 0)?, Some(b"world".to_vec()));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Public API (Environment / Database)    │
//! ├──────────────────────────────────────────┤
//! │  Cursors  │  Transactions (op lists)     │
//! ├──────────────────────────────────────────┤
//! │        B-Tree Index │ Blob Manager       │
//! ├──────────────────────────────────────────┤
//! │  Page Manager (cache, freelist, worker)  │
//! ├──────────────────────────────────────────┤
//! │     Journal (WAL) │ Device (file/mem)    │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! A single environment is one data file plus two rotating journal files:
//!
//! ```text
//! app.db          # header page, b-tree nodes, blob and freelist pages
//! app.db.jrn0     # journal file 0
//! app.db.jrn1     # journal file 1
//! ```
//!
//! ## Module Overview
//!
//! - [`env`]: environment lifecycle, database handles, recovery driver
//! - [`btree`]: per-database ordered index with pluggable key/record layouts
//! - [`cursor`]: dual-coupled iterators merging pending txn ops with the tree
//! - [`txn`]: transaction manager, per-key operation lists, conflict checks
//! - [`journal`]: two-file rotating write-ahead log and changesets
//! - [`pager`]: page manager with LRU cache, freelist and flush worker
//! - [`blob`]: variable-sized records, overflow keys, duplicate tables
//! - [`device`]: positional page I/O over a file or an in-memory arena

#[macro_use]
mod macros;

pub mod blob;
pub mod btree;
pub mod config;
pub mod cursor;
pub mod device;
pub mod env;
pub mod error;
pub mod induce;
pub mod journal;
pub mod page;
pub mod pager;
pub mod txn;

pub use config::{db_flags, env_flags, op_flags, DbConfig, EnvConfig, KeyType};
pub use cursor::CursorMove;
pub use env::{Cursor, Database, EnvMetrics, Environment, Transaction};
pub use error::ErrorKind;
