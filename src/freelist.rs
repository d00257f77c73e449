//! Free-space allocator: a chain of bitmap pages tracking chunks of the
//! file not currently owned by any B+-tree node or blob.
//!
//! A chunk-granularity model rather than a singly linked freelist of whole
//! pages: each freelist page owns a bitmap over a
//! contiguous region of the file, one bit per `CHUNK_SIZE`-byte chunk, so
//! sub-page allocations (extended-key tails, small blobs) don't waste a
//! whole page. Freelist pages are themselves cache-managed pages; to avoid
//! a `Cache`/`Freelist` ownership cycle, every method here takes `&mut
//! Cache` as a parameter rather than owning one.

use std::collections::HashMap;

use crate::cache::{usable_payload, Cache};
use crate::encoding::{read_u32, read_u64, write_u32, write_u64};
use crate::error::{Error, ErrorCode, Result};
use crate::page::PageKind;
use crate::types::PageId;
use crate::util::bitvec::BitVec;

/// Bytes tracked by a single bitmap bit.
pub const CHUNK_SIZE: u64 = 32;

/// Bytes of a freelist page's payload spent on its own bookkeeping, before
/// the bitmap itself: `region_start: u64` + `bit_count: u32`.
const FREELIST_PAGE_PREFIX: usize = 12;

pub struct Freelist {
    root: Option<PageId>,
    page_size: u32,
    /// Per freelist page, the bit index to resume scanning from — avoids
    /// re-scanning already-exhausted prefixes of a busy page on every call.
    hints: HashMap<PageId, usize>,
}

impl Freelist {
    pub fn new(root: Option<PageId>, page_size: u32) -> Self {
        Self {
            root,
            page_size,
            hints: HashMap::new(),
        }
    }

    pub fn root(&self) -> Option<PageId> {
        self.root
    }

    fn bitmap_capacity(&self) -> usize {
        (usable_payload(self.page_size) as usize - FREELIST_PAGE_PREFIX) * 8
    }

    /// Allocates `size` bytes of free space, returning its file offset.
    /// When `whole_page` is set the result is additionally page-aligned (and
    /// sized to exactly one page), as required for B+-tree node/root pages.
    pub fn alloc_bytes(&mut self, cache: &mut Cache, size: u64, whole_page: bool) -> Result<PageId> {
        let chunks_needed = size.div_ceil(CHUNK_SIZE) as usize;

        let mut candidate = self.root;
        while let Some(page_offset) = candidate {
            if let Some(found) =
                self.try_alloc_in_page(cache, page_offset, chunks_needed, whole_page)?
            {
                return Ok(found);
            }
            candidate = cache.fetch(page_offset)?.list_next_opt();
        }

        // No existing page could satisfy the request: reserve a fresh region
        // and bind a new freelist page to track it.
        self.grow_and_retry(cache, chunks_needed, whole_page)
    }

    fn try_alloc_in_page(
        &mut self,
        cache: &mut Cache,
        page_offset: PageId,
        chunks_needed: usize,
        whole_page: bool,
    ) -> Result<Option<PageId>> {
        let hint = *self.hints.get(&page_offset).unwrap_or(&0);
        let page = cache.fetch(page_offset)?;
        let region_start = read_u64(page.payload(), 0)?;
        let bit_count = read_u32(page.payload(), 8)? as usize;
        let bitmap_bytes = &page.payload()[FREELIST_PAGE_PREFIX..];
        let mut bits = BitVec::from_bytes(bitmap_bytes, bit_count);

        let align = if whole_page {
            (self.page_size as u64 / CHUNK_SIZE) as usize
        } else {
            1
        };
        let start = find_aligned_run(&bits, chunks_needed, align, hint);
        cache.unpin(page_offset);
        let Some(start) = start else {
            return Ok(None);
        };

        bits.set_run(start, chunks_needed, false);
        let page = cache.fetch(page_offset)?;
        page.payload_mut()[FREELIST_PAGE_PREFIX..].copy_from_slice(bits.as_bytes());
        cache.mark_dirty(page_offset)?;
        cache.unpin(page_offset);

        self.hints.insert(
            page_offset,
            bits.first_free_from(start + chunks_needed).unwrap_or(0),
        );
        Ok(Some(region_start + start as u64 * CHUNK_SIZE))
    }

    fn grow_and_retry(
        &mut self,
        cache: &mut Cache,
        chunks_needed: usize,
        whole_page: bool,
    ) -> Result<PageId> {
        let capacity = self.bitmap_capacity();
        let chunks_in_region = capacity.max(chunks_needed);
        let region_bytes = chunks_in_region as u64 * CHUNK_SIZE;

        let new_page_offset = cache.reserve_region(self.page_size as u64)?;
        let region_start = cache.reserve_region(region_bytes)?;

        let page = cache.alloc_page(new_page_offset, PageKind::Freelist, false)?;
        write_u64(page.payload_mut(), 0, region_start)?;
        write_u32(page.payload_mut(), 8, chunks_in_region as u32)?;
        let mut bits = BitVec::new(chunks_in_region);
        bits.set_run(0, chunks_in_region, true);
        page.payload_mut()[FREELIST_PAGE_PREFIX..FREELIST_PAGE_PREFIX + bits.as_bytes().len()]
            .copy_from_slice(bits.as_bytes());
        if let Some(old_root) = self.root {
            page.set_list_next(old_root);
        }
        let new_page_offset_captured = page.offset;
        cache.unpin(new_page_offset_captured);
        self.root = Some(new_page_offset_captured);

        self.try_alloc_in_page(cache, new_page_offset_captured, chunks_needed, whole_page)?
            .ok_or_else(|| Error::with_context(ErrorCode::OutOfMemory, "freshly grown region too small"))
    }

    pub fn alloc_page(&mut self, cache: &mut Cache) -> Result<PageId> {
        self.alloc_bytes(cache, self.page_size as u64, true)
    }

    /// Releases a previously allocated range back to the freelist, and
    /// drops any cached hint that now points inside the freed run (a stale
    /// hint would otherwise keep pointing at bits that are free again but
    /// were already skipped past).
    pub fn free_bytes(&mut self, cache: &mut Cache, offset: PageId, size: u64) -> Result<()> {
        let chunks = size.div_ceil(CHUNK_SIZE) as usize;

        let mut candidate = self.root;
        while let Some(page_offset) = candidate {
            let page = cache.fetch(page_offset)?;
            let region_start = read_u64(page.payload(), 0)?;
            let bit_count = read_u32(page.payload(), 8)? as usize;
            let region_end = region_start + bit_count as u64 * CHUNK_SIZE;
            if offset >= region_start && offset < region_end {
                let start = ((offset - region_start) / CHUNK_SIZE) as usize;
                let mut bits = BitVec::from_bytes(&page.payload()[FREELIST_PAGE_PREFIX..], bit_count);
                bits.set_run(start, chunks, true);
                let page = cache.fetch(page_offset)?;
                page.payload_mut()[FREELIST_PAGE_PREFIX..].copy_from_slice(bits.as_bytes());
                cache.mark_dirty(page_offset)?;
                cache.unpin(page_offset);

                if let Some(hint) = self.hints.get(&page_offset) {
                    if *hint >= start && *hint < start + chunks {
                        self.hints.remove(&page_offset);
                    }
                }
                return Ok(());
            }
            let next = page.list_next_opt();
            cache.unpin(page_offset);
            candidate = next;
        }
        Err(Error::with_context(
            ErrorCode::InvParameter,
            format!("offset {offset} is not tracked by any freelist region"),
        ))
    }

    pub fn free_page(&mut self, cache: &mut Cache, offset: PageId) -> Result<()> {
        self.free_bytes(cache, offset, self.page_size as u64)
    }
}

/// First-fit search for `count` consecutive free bits starting at a
/// multiple of `align`, resuming from `hint`.
fn find_aligned_run(bits: &BitVec, count: usize, align: usize, hint: usize) -> Option<usize> {
    if align <= 1 {
        return bits.find_free_run(count, hint);
    }
    let start_at = hint.div_ceil(align) * align;
    let mut i = start_at;
    while i + count <= bits.len() {
        if (i..i + count).all(|b| bits.get(b)) {
            return Some(i);
        }
        i += align;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::Log;
    use std::sync::Arc;

    fn new_cache() -> Cache {
        let dev = Arc::new(crate::device::InMemoryDevice::new());
        let log = Log::new_in_memory();
        Cache::new(dev, log, 256, 64, false, false)
    }

    #[test]
    fn allocates_and_reuses_freed_chunk() {
        let mut cache = new_cache();
        let mut fl = Freelist::new(None, 256);
        let a = fl.alloc_bytes(&mut cache, 32, false).unwrap();
        let b = fl.alloc_bytes(&mut cache, 32, false).unwrap();
        assert_ne!(a, b);
        fl.free_bytes(&mut cache, a, 32).unwrap();
        let c = fl.alloc_bytes(&mut cache, 32, false).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn whole_page_alloc_is_page_aligned() {
        let mut cache = new_cache();
        let mut fl = Freelist::new(None, 256);
        let _ = fl.alloc_bytes(&mut cache, 32, false).unwrap();
        let page = fl.alloc_page(&mut cache).unwrap();
        assert_eq!(page % 256, 0);
    }

    #[test]
    fn grows_region_when_exhausted() {
        let mut cache = new_cache();
        let mut fl = Freelist::new(None, 256);
        for _ in 0..200 {
            fl.alloc_bytes(&mut cache, 32, false).unwrap();
        }
        // Should have rolled over into at least one additional freelist page.
        let mut count = 0;
        let mut next = fl.root();
        while let Some(p) = next {
            count += 1;
            next = cache.fetch(p).unwrap().list_next_opt();
            cache.unpin(p);
        }
        assert!(count >= 2);
    }
}
