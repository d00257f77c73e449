//! Extended-key cache: keys too large to store inline in a slot spill their
//! tail into one or more blob pages; this is a small LRU in front of that
//! lookup so hot comparisons during a tree descent don't re-read the blob
//! chain on every probe.
//!
//! Follows the same aging-clock shape as the page cache, scaled down to a
//! flat `Vec`-backed LRU since the working set here is a handful of entries,
//! not a whole file's worth of pages.

use std::collections::HashMap;

use crate::cache::Cache;
use crate::encoding::read_u32;
use crate::error::Result;
use crate::types::BlobId;

const DEFAULT_CAPACITY: usize = 16;

struct Entry {
    key: Vec<u8>,
    touched: u64,
}

/// Caches the full, reassembled key bytes for a blob id.
pub struct ExtendedKeyCache {
    entries: HashMap<BlobId, Entry>,
    capacity: usize,
    clock: u64,
}

impl Default for ExtendedKeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ExtendedKeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            clock: 0,
        }
    }

    pub fn get(&mut self, blob_id: BlobId) -> Option<&[u8]> {
        self.clock += 1;
        let clock = self.clock;
        if let Some(e) = self.entries.get_mut(&blob_id) {
            e.touched = clock;
            Some(&e.key)
        } else {
            None
        }
    }

    pub fn insert(&mut self, blob_id: BlobId, key: Vec<u8>) {
        self.clock += 1;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&blob_id) {
            if let Some((&victim, _)) = self.entries.iter().min_by_key(|(_, e)| e.touched) {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(
            blob_id,
            Entry {
                key,
                touched: self.clock,
            },
        );
    }

    pub fn invalidate(&mut self, blob_id: BlobId) {
        self.entries.remove(&blob_id);
    }

    /// Reassembles the full key from its overflow chain, reading through
    /// `cache` on a miss and populating the cache for next time.
    pub fn read_full_key(&mut self, cache: &mut Cache, blob_id: BlobId) -> Result<Vec<u8>> {
        if let Some(hit) = self.get(blob_id) {
            return Ok(hit.to_vec());
        }
        let mut out = Vec::new();
        let mut next = Some(blob_id);
        while let Some(offset) = next {
            let page = cache.fetch(offset)?;
            let total_len = read_u32(page.payload(), 0)? as usize;
            let chunk = &page.payload()[4..];
            let remaining = total_len.saturating_sub(out.len());
            let take = remaining.min(chunk.len());
            out.extend_from_slice(&chunk[..take]);
            let chain_next = page.list_next_opt();
            cache.unpin(offset);
            next = if out.len() >= total_len {
                None
            } else {
                chain_next
            };
        }
        self.insert(blob_id, out.clone());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_touched() {
        let mut c = ExtendedKeyCache::new(2);
        c.insert(1, vec![1]);
        c.insert(2, vec![2]);
        c.get(1);
        c.insert(3, vec![3]);
        assert!(c.get(2).is_none());
        assert!(c.get(1).is_some());
        assert!(c.get(3).is_some());
    }

    #[test]
    fn invalidate_drops_entry() {
        let mut c = ExtendedKeyCache::new(4);
        c.insert(5, vec![9, 9]);
        c.invalidate(5);
        assert!(c.get(5).is_none());
    }
}
