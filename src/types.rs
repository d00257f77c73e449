//! Core type aliases, flag sets, and the key comparator contract.

use bitflags::bitflags;
use std::cmp::Ordering;

/// Byte offset of a page within the database file; doubles as that page's
/// identity (`self_offset` in its persistent header).
pub type PageId = u64;

/// Byte offset of a blob (record payload, duplicate table, or extended-key
/// tail) within the database file.
pub type BlobId = u64;

/// Monotonic write-ahead-log sequence number.
pub type Lsn = u64;

/// Monotonic transaction identifier.
pub type TxnId = u64;

/// 0-based position within a slot's duplicate table.
pub type DupId = u32;

bitflags! {
    /// Flags recognized by `Environment::open`/`create`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        const IN_MEMORY_DB        = 0x0001;
        const READ_ONLY           = 0x0002;
        const WRITE_THROUGH       = 0x0004;
        const DISABLE_MMAP        = 0x0008;
        const CACHE_STRICT        = 0x0010;
        const CACHE_UNLIMITED     = 0x0020;
        const ENABLE_TRANSACTIONS = 0x0040;
        const ENABLE_RECOVERY     = 0x0080;
        const ENABLE_DUPLICATES   = 0x0100;
        const RECORD_NUMBER       = 0x0200;
    }

    /// Bits of `DATA_ACCESS_MODE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DataAccessMode: u32 {
        const SEQUENTIAL_INSERT     = 0x0001;
        const RANDOM_WRITE          = 0x0002;
        const ENFORCE_PRE110_FORMAT = 0x0004;
        const UBER_FAST_ACCESS      = 0x0008;
    }

    /// Per-operation flags for insert/find/cursor-move.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        const OVERWRITE                  = 0x0000_0001;
        const DUPLICATE                  = 0x0000_0002;
        const DUPLICATE_INSERT_BEFORE    = 0x0000_0004;
        const DUPLICATE_INSERT_AFTER     = 0x0000_0008;
        const DUPLICATE_INSERT_FIRST     = 0x0000_0010;
        const DUPLICATE_INSERT_LAST      = 0x0000_0020;
        const HINT_APPEND                = 0x0000_0040;
        const HINT_PREPEND               = 0x0000_0080;
        const HINT_SEQUENTIAL            = 0x0000_0100;
        const HINT_UBER_FAST_ACCESS      = 0x0000_0200;
        const SKIP_DUPLICATES            = 0x0000_0400;
        const ONLY_DUPLICATES            = 0x0000_0800;
        const PARTIAL                    = 0x0000_1000;
        const FIND_LT_MATCH               = 0x0000_2000;
        const FIND_GT_MATCH               = 0x0000_4000;
        const FIND_EXACT_MATCH             = 0x0002_0000;
        const FIND_GEQ_MATCH               = Self::FIND_GT_MATCH.bits() | Self::FIND_EXACT_MATCH.bits();
        const FIND_LEQ_MATCH               = Self::FIND_LT_MATCH.bits() | Self::FIND_EXACT_MATCH.bits();
    }
}

impl OpFlags {
    /// Any approximate-match bit set (LT, GT, GEQ, or LEQ).
    pub fn wants_approx(self) -> bool {
        self.intersects(
            OpFlags::FIND_LT_MATCH | OpFlags::FIND_GT_MATCH | OpFlags::FIND_EXACT_MATCH,
        )
    }
}

/// Outcome of comparing a search key against a candidate key. `NeedsFullKey`
/// lets a registered prefix comparator bail out of a bounded-inline-bytes
/// comparison and ask the caller to fetch the extended-key remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    Less,
    Equal,
    Greater,
    NeedsFullKey,
}

impl CompareResult {
    pub fn from_ordering(o: Ordering) -> Self {
        match o {
            Ordering::Less => CompareResult::Less,
            Ordering::Equal => CompareResult::Equal,
            Ordering::Greater => CompareResult::Greater,
        }
    }
}

/// A key comparator for a database. The default is lexicographic byte
/// comparison; callers may register a custom one (e.g. numeric, reversed).
pub trait Comparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Lexicographic byte-wise comparator; the database default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicographicComparator;

impl Comparator for LexicographicComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Record-number-mode keys are 8-byte big-endian monotonic counters.
pub fn record_number_to_key(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

pub fn key_to_record_number(key: &[u8]) -> Option<u64> {
    if key.len() != 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(key);
    Some(u64::from_be_bytes(buf))
}
