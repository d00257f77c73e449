//! Bounded page cache: the layer between the B+-tree and the device.
//!
//! LRU-ish aging, pin counting, and dirty-list bookkeeping, with pages
//! living in an owned arena keyed by offset rather than threaded through
//! raw pointers — callers address a page by id and every mutation goes
//! through `fetch`/`mark_dirty`/`unpin`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{Error, ErrorCode, Result};
use crate::page::{Page, PageKind, PAGE_HEADER_SIZE};
use crate::types::{Lsn, PageId};
use crate::wal::Log;

/// Threshold past which a page carries the "evict first" bias used for
/// bulk-load / thrash-resistant inserts.
const BULK_AGE_PENALTY: i64 = i64::MAX / 2;

pub struct Cache {
    device: Arc<dyn Device>,
    pub wal: Log,
    pages: HashMap<PageId, Page>,
    page_size: u32,
    write_through: bool,
    cache_unlimited: bool,
    max_pages: usize,
    timeslot: i64,
}

impl Cache {
    pub fn new(
        device: Arc<dyn Device>,
        wal: Log,
        page_size: u32,
        max_pages: usize,
        write_through: bool,
        cache_unlimited: bool,
    ) -> Self {
        Self {
            device,
            wal,
            pages: HashMap::new(),
            page_size,
            write_through,
            cache_unlimited,
            max_pages,
            timeslot: 0,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Returns the page if resident, reading it from the device otherwise.
    /// Bumps the cache's timeslot and stamps the page's age either way.
    pub fn fetch(&mut self, offset: PageId) -> Result<&mut Page> {
        self.timeslot += 1;
        if !self.pages.contains_key(&offset) {
            let mut buf = vec![0u8; self.page_size as usize];
            self.device.read(offset, &mut buf)?;
            let page = Page::from_disk(offset, buf)?;
            self.pages.insert(offset, page);
        }
        let ts = self.timeslot;
        let page = self.pages.get_mut(&offset).expect("just inserted");
        page.age = ts;
        page.pin_count += 1;
        Ok(page)
    }

    /// Binds a freshly allocated, zeroed page to `offset`, logs its
    /// before-image (all zeros, since it is new), and marks it dirty.
    /// `bulk` signals sequential/bulk-load traffic so the page is born
    /// evict-first rather than competing with hot pages.
    pub fn alloc_page(&mut self, offset: PageId, kind: PageKind, bulk: bool) -> Result<&mut Page> {
        self.timeslot += 1;
        let mut page = Page::new_zeroed(offset, kind, self.page_size as usize);
        let lsn = self.wal.log_page_before(offset, &vec![0u8; self.page_size as usize])?;
        page.mark_dirty(lsn);
        page.pin_count += 1;
        page.age = if bulk {
            self.timeslot - BULK_AGE_PENALTY
        } else {
            self.timeslot
        };
        self.pages.insert(offset, page);
        Ok(self.pages.get_mut(&offset).expect("just inserted"))
    }

    /// Marks a resident page dirty and logs its before-image if this is the
    /// first modification since it was last clean on disk.
    pub fn mark_dirty(&mut self, offset: PageId) -> Result<()> {
        let before = {
            let page = self
                .pages
                .get(&offset)
                .ok_or_else(|| Error::new(ErrorCode::InvParameter))?;
            if page.dirty {
                None
            } else {
                Some(page.bytes.clone())
            }
        };
        if let Some(before) = before {
            let lsn = self.wal.log_page_before(offset, &before)?;
            let page = self.pages.get_mut(&offset).unwrap();
            page.mark_dirty(lsn);
        }
        Ok(())
    }

    /// Structural change about to happen to `offset`: bumps its generation
    /// and drains+returns the cursor ids that were coupled to it, so the
    /// caller (the cursor manager) can uncouple them.
    pub fn begin_structural_change(&mut self, offset: PageId) -> Vec<u64> {
        if let Some(page) = self.pages.get_mut(&offset) {
            page.bump_generation();
            std::mem::take(&mut page.cursor_list)
        } else {
            Vec::new()
        }
    }

    pub fn couple_cursor(&mut self, offset: PageId, cursor_id: u64) {
        if let Some(page) = self.pages.get_mut(&offset) {
            page.cursor_list.push(cursor_id);
        }
    }

    pub fn generation(&self, offset: PageId) -> u64 {
        self.pages.get(&offset).map(|p| p.generation).unwrap_or(0)
    }

    pub fn unpin(&mut self, offset: PageId) {
        if let Some(page) = self.pages.get_mut(&offset) {
            page.pin_count = page.pin_count.saturating_sub(1);
        }
    }

    /// Evicts pages in ascending age until at most `target` remain resident
    /// (or no unpinned page is left). Dirty pages are flushed through the
    /// device first, after ensuring the WAL is durable to their modification
    /// LSN (the write-ahead discipline: never let a dirty page reach disk
    /// before the log entry covering it does).
    pub fn purge(&mut self, target: usize) -> Result<()> {
        if self.cache_unlimited {
            return Ok(());
        }
        loop {
            if self.pages.len() <= target {
                return Ok(());
            }
            let victim = self
                .pages
                .values()
                .filter(|p| p.pin_count == 0)
                .min_by_key(|p| p.age)
                .map(|p| p.offset);
            let Some(offset) = victim else {
                return Ok(());
            };
            self.flush_page(offset)?;
            self.pages.remove(&offset);
        }
    }

    fn flush_page(&mut self, offset: PageId) -> Result<()> {
        let (dirty, lsn, needs_header) = {
            let page = self.pages.get(&offset).expect("victim exists");
            (page.dirty, page.modified_lsn, true)
        };
        let _ = needs_header;
        if dirty {
            self.wal.ensure_durable(lsn)?;
            let page = self.pages.get_mut(&offset).unwrap();
            page.write_header();
            self.device.write(offset, &page.bytes)?;
            if self.write_through {
                self.device.flush()?;
            }
            page.dirty = false;
        }
        Ok(())
    }

    /// Flushes every dirty page then fsyncs the device.
    pub fn flush_all(&mut self) -> Result<()> {
        let offsets: Vec<PageId> = self
            .pages
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(&o, _)| o)
            .collect();
        for offset in offsets {
            self.flush_page(offset)?;
        }
        self.device.flush()?;
        self.wal.truncate_if_fully_flushed()?;
        Ok(())
    }

    pub fn file_size(&self) -> Result<u64> {
        self.device.file_size()
    }

    pub fn grow_file(&mut self) -> Result<PageId> {
        self.reserve_region(self.page_size as u64)
    }

    /// Extends the file by exactly `extra_bytes`, logging the size change
    /// first so recovery can roll a partial grow back. Returns the start
    /// offset of the new region.
    pub fn reserve_region(&mut self, extra_bytes: u64) -> Result<PageId> {
        let size = self.device.file_size()?;
        let new_size = size + extra_bytes;
        self.wal.log_file_size(new_size)?;
        self.device.truncate(new_size)?;
        Ok(size)
    }

    pub fn resident_count(&self) -> usize {
        self.pages.len()
    }

    /// All currently dirty, resident pages — used to log after-images once
    /// a transaction's ops have been replayed into the tree.
    pub fn dirty_offsets(&self) -> Vec<PageId> {
        self.pages
            .values()
            .filter(|p| p.dirty)
            .map(|p| p.offset)
            .collect()
    }

    pub fn log_after_image(&mut self, offset: PageId) -> Result<()> {
        let bytes = self
            .pages
            .get(&offset)
            .ok_or_else(|| Error::new(ErrorCode::InvParameter))?
            .bytes
            .clone();
        self.wal.log_page_after(offset, &bytes)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn is_resident(&self, offset: PageId) -> bool {
        self.pages.contains_key(&offset)
    }
}

/// Minimum bytes of payload a node's header leaves behind; exported so
/// callers can size slot arrays without reaching into `page` directly.
pub const fn usable_payload(page_size: u32) -> u32 {
    page_size - PAGE_HEADER_SIZE as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryDevice;
    use crate::wal::Log;

    fn new_cache() -> Cache {
        let dev = Arc::new(InMemoryDevice::new());
        let log = Log::new_in_memory();
        Cache::new(dev, log, 256, 4, false, false)
    }

    #[test]
    fn alloc_then_fetch_round_trips() {
        let mut cache = new_cache();
        cache.alloc_page(0, PageKind::Header, false).unwrap();
        cache.unpin(0);
        cache.flush_all().unwrap();
        let page = cache.fetch(0).unwrap();
        assert_eq!(page.kind, PageKind::Header);
    }

    #[test]
    fn purge_evicts_unpinned_pages_by_age() {
        let mut cache = new_cache();
        for i in 0..4u64 {
            cache.alloc_page(i * 256, PageKind::BtreeIndex, false).unwrap();
            cache.unpin(i * 256);
        }
        cache.flush_all().unwrap();
        assert_eq!(cache.resident_count(), 4);
        cache.purge(2).unwrap();
        assert_eq!(cache.resident_count(), 2);
    }

    #[test]
    fn pinned_pages_survive_purge() {
        let mut cache = new_cache();
        cache.alloc_page(0, PageKind::BtreeIndex, false).unwrap();
        // stays pinned
        cache.alloc_page(256, PageKind::BtreeIndex, false).unwrap();
        cache.unpin(256);
        cache.flush_all().unwrap();
        cache.purge(0).unwrap();
        assert!(cache.is_resident(0));
    }
}
