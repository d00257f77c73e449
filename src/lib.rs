//! An embedded, transactional, ordered key-value storage engine backed by a
//! single paged file.
//!
//! The public surface is [`env::Environment`] (open/create a database file,
//! hold its page cache and WAL) and [`database::Database`] (the per-database
//! handle: insert/find/erase and cursor creation). [`cursor::Cursor`] walks a
//! database in key order, including duplicates.

#![allow(dead_code)]

pub mod blob;
pub mod btree;
pub mod cache;
pub mod cursor;
pub mod database;
pub mod device;
pub mod encoding;
pub mod env;
pub mod error;
pub mod extkey;
pub mod freelist;
pub mod page;
pub mod stats;
pub mod txn;
pub mod types;
pub mod util;
pub mod wal;

pub use cursor::Cursor;
pub use database::Database;
pub use env::Environment;
pub use error::{Error, ErrorCode, Result};
pub use types::{
    key_to_record_number, record_number_to_key, Comparator, DataAccessMode, EnvFlags,
    LexicographicComparator, OpFlags,
};
