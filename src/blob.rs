//! Record payloads living outside the B+-tree: the blob store and the
//! duplicate-table structure built on top of it.
//!
//! Grounded on the same chained-page scheme as [`crate::extkey`] (each blob
//! page carries a `u32` total length followed by its chunk of data, chained
//! through [`crate::page::Page::list_next`]), since a record large enough to
//! need out-of-line storage has exactly the same shape problem as an
//! over-long key. Records small enough to fit in a slot's 8-byte ptr field
//! bypass all of this — `RecordTag` is the shared vocabulary the btree slot
//! layer uses to decide which path a record took.

use crate::cache::Cache;
use crate::encoding::{read_u32, read_u64, read_u8_at, write_u32, write_u64};
use crate::error::{Error, ErrorCode, Result};
use crate::freelist::Freelist;
use crate::page::PageKind;
use crate::types::BlobId;

/// How a record's bytes are represented. `Tiny`/`Small`/`Empty` never touch
/// the blob store; the slot's 8-byte field holds the bytes (or nothing)
/// directly. `PARTIAL` writes are rejected for all three, since there is no
/// out-of-line storage to patch in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTag {
    Empty,
    Tiny(u8),
    Small,
    Blob,
}

/// Packs a record for inline storage if it fits in 8 bytes; `None` means it
/// must go through the blob store.
pub fn encode_inline(data: &[u8]) -> Option<(RecordTag, [u8; 8])> {
    if data.is_empty() {
        return Some((RecordTag::Empty, [0u8; 8]));
    }
    if data.len() == 8 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(data);
        return Some((RecordTag::Small, buf));
    }
    if data.len() <= 7 {
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        return Some((RecordTag::Tiny(data.len() as u8), buf));
    }
    None
}

pub fn decode_inline(tag: RecordTag, bytes: [u8; 8]) -> Vec<u8> {
    match tag {
        RecordTag::Empty => Vec::new(),
        RecordTag::Small => bytes.to_vec(),
        RecordTag::Tiny(n) => bytes[..n as usize].to_vec(),
        RecordTag::Blob => panic!("decode_inline called on a blob-tagged record"),
    }
}

const CHUNK_HEADER: usize = 4;

pub struct BlobStore;

impl BlobStore {
    /// Allocates pages for `record` and writes it, returning the blob id
    /// (the offset of the chain's first page).
    pub fn allocate(cache: &mut Cache, freelist: &mut Freelist, record: &[u8]) -> Result<BlobId> {
        let page_size = cache.page_size() as usize;
        let chunk_cap = crate::cache::usable_payload(page_size as u32) as usize - CHUNK_HEADER;
        let pages_needed = record.len().div_ceil(chunk_cap).max(1);

        let mut offsets = Vec::with_capacity(pages_needed);
        for _ in 0..pages_needed {
            offsets.push(freelist.alloc_page(cache)?);
        }

        let mut written = 0;
        for (i, &offset) in offsets.iter().enumerate() {
            let page = cache.alloc_page(offset, PageKind::BlobData, false)?;
            write_u32(page.payload_mut(), 0, record.len() as u32)?;
            let take = chunk_cap.min(record.len() - written);
            page.payload_mut()[CHUNK_HEADER..CHUNK_HEADER + take]
                .copy_from_slice(&record[written..written + take]);
            if let Some(&next) = offsets.get(i + 1) {
                page.set_list_next(next);
            }
            let offset_captured = page.offset;
            cache.mark_dirty(offset_captured)?;
            cache.unpin(offset_captured);
            written += take;
        }
        Ok(offsets[0])
    }

    /// Reads only `[range_offset, range_offset + range_len)` of the record,
    /// without materializing the rest. Simpler than chunk-walking the chain
    /// since a full `read` is already linear in the record size.
    pub fn read_partial(cache: &mut Cache, offset: BlobId, range_offset: usize, range_len: usize) -> Result<Vec<u8>> {
        let full = Self::read(cache, offset)?;
        let end = range_offset
            .checked_add(range_len)
            .ok_or_else(|| Error::new(ErrorCode::InvParameter))?;
        if end > full.len() {
            return Err(Error::with_context(
                ErrorCode::InvParameter,
                "partial read range exceeds record length",
            ));
        }
        Ok(full[range_offset..end].to_vec())
    }

    pub fn read(cache: &mut Cache, offset: BlobId) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut next = Some(offset);
        while let Some(off) = next {
            let page = cache.fetch(off)?;
            let total_len = read_u32(page.payload(), 0)? as usize;
            let chunk = &page.payload()[CHUNK_HEADER..];
            let take = total_len.saturating_sub(out.len()).min(chunk.len());
            out.extend_from_slice(&chunk[..take]);
            let chain_next = page.list_next_opt();
            cache.unpin(off);
            next = if out.len() >= total_len { None } else { chain_next };
        }
        Ok(out)
    }

    /// Frees the old chain and allocates a fresh one; blobs are not resized
    /// in place since a shorter record may free trailing pages and a longer
    /// one needs more.
    pub fn overwrite(
        cache: &mut Cache,
        freelist: &mut Freelist,
        offset: BlobId,
        record: &[u8],
    ) -> Result<BlobId> {
        Self::free(cache, freelist, offset)?;
        Self::allocate(cache, freelist, record)
    }

    /// Patches `data` into the existing chain at
    /// `[partial_offset, partial_offset + data.len())`, leaving the bytes
    /// outside that range untouched and the chain's total length unchanged.
    /// Rejected if the write would extend past the record's current length.
    pub fn overwrite_partial(cache: &mut Cache, offset: BlobId, data: &[u8], partial_offset: usize) -> Result<()> {
        let page_size = cache.page_size() as usize;
        let chunk_cap = crate::cache::usable_payload(page_size as u32) as usize - CHUNK_HEADER;
        let write_end = partial_offset + data.len();

        let mut next = Some(offset);
        let mut consumed = 0usize;
        let mut checked_len = false;
        while let Some(off) = next {
            let page = cache.fetch(off)?;
            let total_len = read_u32(page.payload(), 0)? as usize;
            if !checked_len {
                checked_len = true;
                if write_end > total_len {
                    cache.unpin(off);
                    return Err(Error::with_context(
                        ErrorCode::InvParameter,
                        "partial write would grow the record past its current length",
                    ));
                }
            }
            let chunk_start = consumed;
            let chunk_end = consumed + chunk_cap.min(total_len - consumed);
            let overlap_start = partial_offset.max(chunk_start);
            let overlap_end = write_end.min(chunk_end);
            let wrote = overlap_start < overlap_end;
            if wrote {
                let page_off = CHUNK_HEADER + (overlap_start - chunk_start);
                let data_off = overlap_start - partial_offset;
                let len = overlap_end - overlap_start;
                page.payload_mut()[page_off..page_off + len].copy_from_slice(&data[data_off..data_off + len]);
            }
            let chain_next = page.list_next_opt();
            if wrote {
                cache.mark_dirty(off)?;
            }
            cache.unpin(off);
            consumed = chunk_end;
            next = if consumed >= total_len { None } else { chain_next };
        }
        Ok(())
    }

    pub fn free(cache: &mut Cache, freelist: &mut Freelist, offset: BlobId) -> Result<()> {
        let mut next = Some(offset);
        while let Some(off) = next {
            let page = cache.fetch(off)?;
            let chain_next = page.list_next_opt();
            cache.unpin(off);
            freelist.free_page(cache, off)?;
            next = chain_next;
        }
        Ok(())
    }
}

/// One entry of a duplicate table: `flags` distinguishes how `rid` should be
/// interpreted (inline tag vs. blob offset), mirroring a slot's record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateEntry {
    pub tag: RecordTag,
    pub rid: u64,
}

const DUP_FLAG_EMPTY: u8 = 0;
const DUP_FLAG_SMALL: u8 = 1;
const DUP_FLAG_BLOB: u8 = 2;
const DUP_FLAG_TINY_BASE: u8 = 0x10; // low nibble carries the tiny length (0..=7)

impl DuplicateEntry {
    fn encode(self) -> (u8, u64) {
        match self.tag {
            RecordTag::Empty => (DUP_FLAG_EMPTY, self.rid),
            RecordTag::Small => (DUP_FLAG_SMALL, self.rid),
            RecordTag::Blob => (DUP_FLAG_BLOB, self.rid),
            RecordTag::Tiny(n) => (DUP_FLAG_TINY_BASE | n, self.rid),
        }
    }

    fn decode(flags: u8, rid: u64) -> Self {
        let tag = if flags & DUP_FLAG_TINY_BASE != 0 {
            RecordTag::Tiny(flags & 0x0F)
        } else {
            match flags {
                DUP_FLAG_SMALL => RecordTag::Small,
                DUP_FLAG_BLOB => RecordTag::Blob,
                _ => RecordTag::Empty,
            }
        };
        Self { tag, rid }
    }
}

const DUP_ENTRY_SIZE: usize = 9; // flags:u8 + rid:u64

/// Sentinel for "erase every duplicate", passed to `duplicate_erase`.
pub const ALL_DUPLICATES: u32 = u32::MAX;

fn serialize(entries: &[DuplicateEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * DUP_ENTRY_SIZE);
    for e in entries {
        let (flags, rid) = e.encode();
        buf.push(flags);
        buf.extend_from_slice(&rid.to_le_bytes());
    }
    buf
}

fn deserialize(bytes: &[u8]) -> Result<Vec<DuplicateEntry>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + DUP_ENTRY_SIZE <= bytes.len() {
        let flags = read_u8_at(bytes, i)?;
        let rid = read_u64(bytes, i + 1)?;
        out.push(DuplicateEntry::decode(flags, rid));
        i += DUP_ENTRY_SIZE;
    }
    Ok(out)
}

/// Reads, mutates and rewrites a key's duplicate table blob. `head` is
/// `None` the first time a second record is inserted for a key.
pub struct DuplicateTable;

impl DuplicateTable {
    pub fn insert(
        cache: &mut Cache,
        freelist: &mut Freelist,
        head: Option<BlobId>,
        entry: DuplicateEntry,
        pos: InsertPosition,
    ) -> Result<BlobId> {
        let mut entries = match head {
            Some(h) => deserialize(&BlobStore::read(cache, h)?)?,
            None => Vec::new(),
        };
        match pos {
            InsertPosition::First => entries.insert(0, entry),
            InsertPosition::Last => entries.push(entry),
            InsertPosition::Before(id) => {
                let idx = Self::index_of(&entries, id)?;
                entries.insert(idx, entry);
            }
            InsertPosition::After(id) => {
                let idx = Self::index_of(&entries, id)?;
                entries.insert(idx + 1, entry);
            }
        }
        let bytes = serialize(&entries);
        match head {
            Some(h) => BlobStore::overwrite(cache, freelist, h, &bytes),
            None => BlobStore::allocate(cache, freelist, &bytes),
        }
    }

    pub fn get(cache: &mut Cache, head: BlobId, dup_id: u32) -> Result<DuplicateEntry> {
        let entries = deserialize(&BlobStore::read(cache, head)?)?;
        entries
            .get(dup_id as usize)
            .copied()
            .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))
    }

    pub fn get_count(cache: &mut Cache, head: BlobId) -> Result<u32> {
        Ok(deserialize(&BlobStore::read(cache, head)?)?.len() as u32)
    }

    /// Erases one duplicate, or all of them with [`ALL_DUPLICATES`].
    /// Returns the table's new head, or `None` if it is now empty (the
    /// caller must then clear the slot's has-duplicates flag).
    pub fn erase(
        cache: &mut Cache,
        freelist: &mut Freelist,
        head: BlobId,
        dup_id: u32,
    ) -> Result<Option<BlobId>> {
        if dup_id == ALL_DUPLICATES {
            BlobStore::free(cache, freelist, head)?;
            return Ok(None);
        }
        let mut entries = deserialize(&BlobStore::read(cache, head)?)?;
        let idx = Self::index_of(&entries, dup_id)?;
        entries.remove(idx);
        if entries.is_empty() {
            BlobStore::free(cache, freelist, head)?;
            return Ok(None);
        }
        let bytes = serialize(&entries);
        Ok(Some(BlobStore::overwrite(cache, freelist, head, &bytes)?))
    }

    /// Replaces the entry at `dup_id` in place, leaving every other entry's
    /// position unchanged. Returns the table's (possibly new) head, since
    /// `BlobStore::overwrite` may relocate the table blob.
    pub fn set(cache: &mut Cache, freelist: &mut Freelist, head: BlobId, dup_id: u32, entry: DuplicateEntry) -> Result<BlobId> {
        let mut entries = deserialize(&BlobStore::read(cache, head)?)?;
        let idx = Self::index_of(&entries, dup_id)?;
        entries[idx] = entry;
        let bytes = serialize(&entries);
        BlobStore::overwrite(cache, freelist, head, &bytes)
    }

    fn index_of(entries: &[DuplicateEntry], dup_id: u32) -> Result<usize> {
        if (dup_id as usize) < entries.len() {
            Ok(dup_id as usize)
        } else {
            Err(Error::new(ErrorCode::KeyNotFound))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum InsertPosition {
    First,
    Last,
    Before(u32),
    After(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::Log;
    use std::sync::Arc;

    fn new_cache() -> (Cache, Freelist) {
        let dev = Arc::new(crate::device::InMemoryDevice::new());
        let log = Log::new_in_memory();
        (Cache::new(dev, log, 256, 64, false, false), Freelist::new(None, 256))
    }

    #[test]
    fn inline_encoding_round_trips() {
        let (tag, bytes) = encode_inline(b"hi").unwrap();
        assert_eq!(decode_inline(tag, bytes), b"hi");
        assert!(encode_inline(&[0u8; 9]).is_none());
    }

    #[test]
    fn blob_store_round_trips_large_record() {
        let (mut cache, mut fl) = new_cache();
        let record = vec![0x42u8; 700];
        let id = BlobStore::allocate(&mut cache, &mut fl, &record).unwrap();
        let read_back = BlobStore::read(&mut cache, id).unwrap();
        assert_eq!(read_back, record);
    }

    #[test]
    fn duplicate_ordering_matches_insert_positions() {
        let (mut cache, mut fl) = new_cache();
        let a = DuplicateEntry { tag: RecordTag::Tiny(1), rid: b'A' as u64 };
        let b = DuplicateEntry { tag: RecordTag::Tiny(1), rid: b'B' as u64 };
        let c = DuplicateEntry { tag: RecordTag::Tiny(1), rid: b'C' as u64 };
        let head = DuplicateTable::insert(&mut cache, &mut fl, None, a, InsertPosition::Last).unwrap();
        let head = DuplicateTable::insert(&mut cache, &mut fl, Some(head), b, InsertPosition::First).unwrap();
        let head = DuplicateTable::insert(&mut cache, &mut fl, Some(head), c, InsertPosition::Last).unwrap();
        assert_eq!(DuplicateTable::get_count(&mut cache, head).unwrap(), 3);
        let order: Vec<u64> = (0..3)
            .map(|i| DuplicateTable::get(&mut cache, head, i).unwrap().rid)
            .collect();
        assert_eq!(order, vec![b'B' as u64, b'A' as u64, b'C' as u64]);
    }

    #[test]
    fn erase_all_frees_the_table() {
        let (mut cache, mut fl) = new_cache();
        let a = DuplicateEntry { tag: RecordTag::Empty, rid: 0 };
        let head = DuplicateTable::insert(&mut cache, &mut fl, None, a, InsertPosition::Last).unwrap();
        let result = DuplicateTable::erase(&mut cache, &mut fl, head, ALL_DUPLICATES).unwrap();
        assert!(result.is_none());
    }
}
