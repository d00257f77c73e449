//! Block-level file I/O: the core's only window onto the outside world.
//!
//! Everything above this trait (cache, freelist, WAL, B+-tree) is written
//! against `Device` and never touches `std::fs` directly: read at offset,
//! write at offset, truncate, flush, filesize. Locking, shared memory, and
//! dynamic-library loading are not part of this crate's scope
//! (single-process, no plugins).

mod memory;
mod unix;

pub use memory::InMemoryDevice;
pub use unix::FileDevice;

use crate::error::Result;

/// A block-level storage device. Implementations must make `read`/`write`
/// safe to call with arbitrary (non-page-aligned) offsets for blob access,
/// even though the B+-tree and cache only ever address whole pages.
pub trait Device: Send + Sync {
    /// Read exactly `buf.len()` bytes starting at `offset`. Short reads past
    /// end-of-file are zero-filled, matching the convention that a freshly
    /// truncated-out region reads as zeros.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write exactly `buf.len()` bytes starting at `offset`.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Grow or shrink the file to exactly `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Flush buffered writes to stable storage.
    fn flush(&self) -> Result<()>;

    /// Current file size in bytes.
    fn file_size(&self) -> Result<u64>;

    /// Optional fast path: map `len` bytes at `offset` for zero-copy reads.
    /// The default implementation reports no support; the cache falls back
    /// to `read` whenever this returns `None`.
    fn mmap(&self, _offset: u64, _len: usize) -> Option<Vec<u8>> {
        None
    }
}
