//! The B+-tree core: search, insert/split, erase/merge, enumeration, and
//! the integrity checker.
//!
//! Insert descends then propagates a split pivot back up; erase descends
//! then propagates underflow back up. The Rust surface — owned `Vec<Slot>`
//! per node, `Result`-returning recursion, no raw pointers — follows the
//! style established in `cache.rs`/`freelist.rs`.

pub mod node;

use std::cmp::Ordering;

use crate::blob::{BlobStore, RecordTag};
use crate::cache::Cache;
use crate::error::{Error, ErrorCode, Result};
use crate::extkey::ExtendedKeyCache;
use crate::freelist::Freelist;
use crate::page::PageKind;
use crate::types::{Comparator, OpFlags, PageId};

use node::{max_keys, read_slot, write_slot, NodeHeader, Slot};

/// Default fractions governing split pivot and minimum occupancy; the
/// statistics hinter may override these per operation.
pub const DEFAULT_SPLIT_RATIO: f64 = 0.5;
pub const DEFAULT_MERGE_RATIO: f64 = 1.0 / 3.0;

pub struct BTree {
    pub inline_key_size: usize,
}

/// Bundles the collaborators every tree operation needs so call sites don't
/// carry five separate parameters through the recursion.
pub struct TreeCtx<'a> {
    pub cache: &'a mut Cache,
    pub freelist: &'a mut Freelist,
    pub extkeys: &'a mut ExtendedKeyCache,
    pub comparator: &'a dyn Comparator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumAction {
    Continue,
    Stop,
    DoNotDescend,
}

pub enum EnumEvent<'a> {
    Descend { from: PageId, to: PageId },
    PageStart { page: PageId, is_leaf: bool },
    Item { page: PageId, slot_index: usize, slot: &'a Slot, key: &'a [u8] },
    PageStop { page: PageId },
}

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

impl BTree {
    pub fn maxkeys(&self, page_size: u32) -> usize {
        max_keys(crate::cache::usable_payload(page_size) as usize, self.inline_key_size)
    }

    pub fn minkeys(&self, page_size: u32, merge_ratio: f64) -> usize {
        ((self.maxkeys(page_size) as f64) * merge_ratio).ceil() as usize
    }

    fn decode(&self, ctx: &mut TreeCtx, offset: PageId) -> Result<(NodeHeader, Vec<Slot>)> {
        let page = ctx.cache.fetch(offset)?;
        let payload = page.payload().to_vec();
        ctx.cache.unpin(offset);
        let header = NodeHeader::read(&payload)?;
        let mut slots = Vec::with_capacity(header.key_count as usize);
        for i in 0..header.key_count as usize {
            slots.push(read_slot(&payload, i, self.inline_key_size)?);
        }
        Ok((header, slots))
    }

    fn encode(&self, ctx: &mut TreeCtx, offset: PageId, header: &NodeHeader, slots: &[Slot]) -> Result<()> {
        ctx.cache.mark_dirty(offset)?;
        let page = ctx.cache.fetch(offset)?;
        let mut h = *header;
        h.key_count = slots.len() as u16;
        h.write(page.payload_mut())?;
        for (i, s) in slots.iter().enumerate() {
            write_slot(page.payload_mut(), i, self.inline_key_size, s)?;
        }
        ctx.cache.unpin(offset);
        Ok(())
    }

    /// Exposes `decode` to sibling modules (the cursor) that need to read a
    /// node's slots without duplicating the byte layout.
    pub fn decode_pub(&self, ctx: &mut TreeCtx, offset: PageId) -> Result<(NodeHeader, Vec<Slot>)> {
        self.decode(ctx, offset)
    }

    /// Exposes `encode` to sibling modules that patch a node's slots
    /// directly (duplicate-table promotion) instead of through insert/erase.
    pub fn encode_pub(&self, ctx: &mut TreeCtx, offset: PageId, header: &NodeHeader, slots: &[Slot]) -> Result<()> {
        self.encode(ctx, offset, header, slots)
    }

    /// Exposes `make_key_slot` to sibling modules that build a slot outside
    /// the normal insert/erase descent (the append fast path).
    pub fn make_key_slot_pub(&self, ctx: &mut TreeCtx, key: &[u8], record_tag: RecordTag, tail: [u8; node::RID_SIZE]) -> Result<Slot> {
        self.make_key_slot(ctx, key, record_tag, tail)
    }

    /// Bytes of `slot`'s key, fetching the extended-key blob if needed.
    pub fn full_key(&self, ctx: &mut TreeCtx, slot: &Slot) -> Result<Vec<u8>> {
        if slot.key_is_extended {
            ctx.extkeys.read_full_key(ctx.cache, slot.ext_blob_offset())
        } else {
            Ok(slot.inline_key[..slot.key_size as usize].to_vec())
        }
    }

    fn compare(&self, ctx: &mut TreeCtx, slot: &Slot, key: &[u8]) -> Result<Ordering> {
        let full = self.full_key(ctx, slot)?;
        Ok(ctx.comparator.compare(&full, key))
    }

    /// Writes a key's on-disk representation, allocating an extended-key
    /// blob when it doesn't fit inline.
    fn make_key_slot(
        &self,
        ctx: &mut TreeCtx,
        key: &[u8],
        record_tag: RecordTag,
        tail: [u8; node::RID_SIZE],
    ) -> Result<Slot> {
        let usable = self.inline_key_size - node::RID_SIZE;
        let blob_offset = if key.len() > usable {
            let offset = BlobStore::allocate(ctx.cache, ctx.freelist, key)?;
            Some(offset)
        } else {
            None
        };
        let (extended, area) = Slot::encode_key_area(key, self.inline_key_size, blob_offset);
        Ok(Slot {
            key_is_extended: extended,
            has_duplicates: false,
            record_tag,
            key_size: key.len() as u16,
            inline_key: area,
            tail,
        })
    }

    // ---- search -------------------------------------------------------

    /// Descends from `root` to the leaf that would contain `key`.
    pub fn traverse_tree(&self, ctx: &mut TreeCtx, root: PageId, key: &[u8]) -> Result<PageId> {
        let mut offset = root;
        loop {
            let (header, slots) = self.decode(ctx, offset)?;
            if header.is_leaf() {
                return Ok(offset);
            }
            let mut descend = header.ptr_left;
            for s in &slots {
                if self.compare(ctx, s, key)? != Ordering::Greater {
                    descend = s.tail_as_offset();
                } else {
                    break;
                }
            }
            offset = descend;
        }
    }

    /// Binary search within a leaf's ordered slots. Returns `Ok(i)` when
    /// `key` equals `slots[i]`'s key, `Err(i)` for the insertion point
    /// otherwise (the conventional `slice::binary_search` contract).
    fn locate_in_leaf(
        &self,
        ctx: &mut TreeCtx,
        slots: &[Slot],
        key: &[u8],
    ) -> Result<std::result::Result<usize, usize>> {
        let mut lo = 0usize;
        let mut hi = slots.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.compare(ctx, &slots[mid], key)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// `find`: exact or approximate match per `flags`. Returns the leaf
    /// offset, slot index, and the slot itself.
    pub fn find(
        &self,
        ctx: &mut TreeCtx,
        root: PageId,
        key: &[u8],
        flags: OpFlags,
    ) -> Result<(PageId, usize, Slot)> {
        let leaf = self.traverse_tree(ctx, root, key)?;
        let (_, slots) = self.decode(ctx, leaf)?;
        match self.locate_in_leaf(ctx, &slots, key)? {
            Ok(i) => {
                if !flags.wants_approx() || flags.intersects(OpFlags::FIND_EXACT_MATCH) {
                    return Ok((leaf, i, slots[i].clone()));
                }
                // A pure GT/LT request must skip past an exact hit to the
                // strict neighbor rather than return it.
                self.skip_exact_match(ctx, root, leaf, &slots, i, flags)
            }
            Err(i) => {
                if !flags.wants_approx() {
                    return Err(Error::new(ErrorCode::KeyNotFound));
                }
                self.approximate_match(ctx, root, leaf, &slots, i, flags)
            }
        }
    }

    fn skip_exact_match(
        &self,
        ctx: &mut TreeCtx,
        root: PageId,
        leaf: PageId,
        slots: &[Slot],
        idx: usize,
        flags: OpFlags,
    ) -> Result<(PageId, usize, Slot)> {
        if flags.intersects(OpFlags::FIND_GT_MATCH) {
            if idx + 1 < slots.len() {
                return Ok((leaf, idx + 1, slots[idx + 1].clone()));
            }
            return self.next_leaf_first(ctx, root, leaf);
        }
        if flags.intersects(OpFlags::FIND_LT_MATCH) {
            if idx > 0 {
                return Ok((leaf, idx - 1, slots[idx - 1].clone()));
            }
            return self.prev_leaf_last(ctx, root, leaf);
        }
        Err(Error::new(ErrorCode::KeyNotFound))
    }

    fn approximate_match(
        &self,
        ctx: &mut TreeCtx,
        root: PageId,
        leaf: PageId,
        slots: &[Slot],
        insertion_point: usize,
        flags: OpFlags,
    ) -> Result<(PageId, usize, Slot)> {
        let wants_gt = flags.intersects(OpFlags::FIND_GT_MATCH);
        let wants_lt = flags.intersects(OpFlags::FIND_LT_MATCH);
        if wants_gt {
            if insertion_point < slots.len() {
                return Ok((leaf, insertion_point, slots[insertion_point].clone()));
            }
            return self.next_leaf_first(ctx, root, leaf);
        }
        if wants_lt {
            if insertion_point > 0 {
                return Ok((leaf, insertion_point - 1, slots[insertion_point - 1].clone()));
            }
            return self.prev_leaf_last(ctx, root, leaf);
        }
        Err(Error::new(ErrorCode::KeyNotFound))
    }

    fn next_leaf_first(&self, ctx: &mut TreeCtx, _root: PageId, leaf: PageId) -> Result<(PageId, usize, Slot)> {
        let (header, _) = self.decode(ctx, leaf)?;
        if header.right_sibling == 0 {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        let (_, slots) = self.decode(ctx, header.right_sibling)?;
        slots
            .first()
            .cloned()
            .map(|s| (header.right_sibling, 0, s))
            .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))
    }

    fn prev_leaf_last(&self, ctx: &mut TreeCtx, _root: PageId, leaf: PageId) -> Result<(PageId, usize, Slot)> {
        let (header, _) = self.decode(ctx, leaf)?;
        if header.left_sibling == 0 {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        let (_, slots) = self.decode(ctx, header.left_sibling)?;
        let idx = slots.len().saturating_sub(1);
        slots
            .last()
            .cloned()
            .map(|s| (header.left_sibling, idx, s))
            .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))
    }

    // ---- insert ---------------------------------------------------------

    /// Inserts `key`/`record` into the tree rooted at `root`, returning the
    /// (possibly new, if the root split) root offset. `overwrite` permits
    /// replacing an existing key instead of failing `DUPLICATE_KEY`.
    pub fn insert(
        &self,
        ctx: &mut TreeCtx,
        root: PageId,
        key: &[u8],
        record_tag: RecordTag,
        tail: [u8; node::RID_SIZE],
        overwrite: bool,
    ) -> Result<PageId> {
        let new_slot = self.make_key_slot(ctx, key, record_tag, tail)?;
        match self.insert_recursive(ctx, root, key, new_slot, overwrite)? {
            InsertOutcome::Done => Ok(root),
            InsertOutcome::Split { pivot_key, pivot_slot, new_right } => {
                self.new_root(ctx, root, new_right, pivot_key, pivot_slot)
            }
        }
    }

    fn new_root(
        &self,
        ctx: &mut TreeCtx,
        old_root: PageId,
        new_right: PageId,
        pivot_key: Vec<u8>,
        mut pivot_slot: Slot,
    ) -> Result<PageId> {
        let new_root_offset = self.alloc_node_page(ctx)?;
        pivot_slot.tail = new_right.to_le_bytes();
        let header = NodeHeader {
            flags: 0,
            key_count: 1,
            left_sibling: 0,
            right_sibling: 0,
            ptr_left: old_root,
        };
        let _ = &pivot_key;
        self.encode(ctx, new_root_offset, &header, &[pivot_slot])?;
        Ok(new_root_offset)
    }

    fn alloc_node_page(&self, ctx: &mut TreeCtx) -> Result<PageId> {
        let offset = ctx.freelist.alloc_page(ctx.cache)?;
        ctx.cache.alloc_page(offset, PageKind::BtreeIndex, false)?;
        ctx.cache.unpin(offset);
        Ok(offset)
    }

    fn insert_recursive(
        &self,
        ctx: &mut TreeCtx,
        offset: PageId,
        key: &[u8],
        new_slot: Slot,
        overwrite: bool,
    ) -> Result<InsertOutcome> {
        let (mut header, mut slots) = self.decode(ctx, offset)?;

        if header.is_leaf() {
            match self.locate_in_leaf(ctx, &slots, key)? {
                Ok(i) => {
                    if !overwrite {
                        return Err(Error::new(ErrorCode::DuplicateKey));
                    }
                    slots[i] = new_slot;
                }
                Err(i) => slots.insert(i, new_slot),
            }
        } else {
            let mut descend_idx: Option<usize> = None;
            let mut descend = header.ptr_left;
            for (i, s) in slots.iter().enumerate() {
                if self.compare(ctx, s, key)? != Ordering::Greater {
                    descend = s.tail_as_offset();
                    descend_idx = Some(i);
                } else {
                    break;
                }
            }
            match self.insert_recursive(ctx, descend, key, new_slot, overwrite)? {
                InsertOutcome::Done => {}
                InsertOutcome::Split { pivot_key, mut pivot_slot, new_right } => {
                    pivot_slot.tail = new_right.to_le_bytes();
                    let at = match descend_idx {
                        Some(i) => i + 1,
                        None => 0,
                    };
                    let _ = &pivot_key;
                    slots.insert(at, pivot_slot);
                }
            }
        }

        let maxkeys = self.maxkeys(ctx.cache.page_size());
        if slots.len() > maxkeys {
            self.split(ctx, offset, &mut header, &mut slots)
        } else {
            self.encode(ctx, offset, &header, &slots)?;
            Ok(InsertOutcome::Done)
        }
    }

    fn split(
        &self,
        ctx: &mut TreeCtx,
        offset: PageId,
        header: &mut NodeHeader,
        slots: &mut Vec<Slot>,
    ) -> Result<InsertOutcome> {
        // The left half keeps this offset but loses slots to the new right
        // page; any cursor coupled here must re-locate by key afterward.
        ctx.cache.begin_structural_change(offset);

        let is_leaf = header.is_leaf();
        let c = slots.len();
        let pivot = (c as f64 * DEFAULT_SPLIT_RATIO).round() as usize;
        let pivot = pivot.clamp(2, c.saturating_sub(2).max(2));

        let right_offset = self.alloc_node_page(ctx)?;

        if is_leaf {
            let right_slots: Vec<Slot> = slots.split_off(pivot);
            let pivot_key = self.full_key(ctx, &right_slots[0])?;
            let pivot_slot = self.make_key_slot(ctx, &pivot_key, RecordTag::Empty, [0; node::RID_SIZE])?;

            let right_header = NodeHeader {
                flags: 0,
                key_count: right_slots.len() as u16,
                left_sibling: offset,
                right_sibling: header.right_sibling,
                ptr_left: 0,
            };
            let old_right_sibling = header.right_sibling;
            header.right_sibling = right_offset;
            self.encode(ctx, right_offset, &right_header, &right_slots)?;
            self.encode(ctx, offset, header, slots)?;
            if old_right_sibling != 0 {
                let (mut further_header, further_slots) = self.decode(ctx, old_right_sibling)?;
                further_header.left_sibling = right_offset;
                self.encode(ctx, old_right_sibling, &further_header, &further_slots)?;
            }

            Ok(InsertOutcome::Split { pivot_key, pivot_slot, new_right: right_offset })
        } else {
            // One extra key is consumed as the promoted separator.
            let promoted = slots.remove(pivot);
            let right_slots: Vec<Slot> = slots.split_off(pivot);
            let pivot_key = self.full_key(ctx, &promoted)?;

            let right_header = NodeHeader {
                flags: 0,
                key_count: right_slots.len() as u16,
                left_sibling: 0,
                right_sibling: 0,
                ptr_left: promoted.tail_as_offset(),
            };
            self.encode(ctx, right_offset, &right_header, &right_slots)?;
            self.encode(ctx, offset, header, slots)?;

            Ok(InsertOutcome::Split { pivot_key, pivot_slot: promoted, new_right: right_offset })
        }
    }

    // ---- erase ----------------------------------------------------------

    /// Erases `key`, returning the (possibly new, if the root collapsed)
    /// root offset.
    pub fn erase(&self, ctx: &mut TreeCtx, root: PageId, key: &[u8]) -> Result<PageId> {
        self.erase_recursive(ctx, root, key)?;
        let (header, slots) = self.decode(ctx, root)?;
        if !header.is_leaf() && slots.is_empty() {
            let only_child = header.ptr_left;
            ctx.freelist.free_page(ctx.cache, root)?;
            return Ok(only_child);
        }
        Ok(root)
    }

    fn erase_recursive(&self, ctx: &mut TreeCtx, offset: PageId, key: &[u8]) -> Result<bool> {
        let (mut header, mut slots) = self.decode(ctx, offset)?;
        let minkeys = self.minkeys(ctx.cache.page_size(), DEFAULT_MERGE_RATIO);

        if header.is_leaf() {
            let idx = match self.locate_in_leaf(ctx, &slots, key)? {
                Ok(i) => i,
                Err(_) => return Err(Error::new(ErrorCode::KeyNotFound)),
            };
            let removed = slots.remove(idx);
            if removed.has_duplicates {
                BlobStore::free(ctx.cache, ctx.freelist, removed.tail_as_offset())?;
            } else if matches!(removed.record_tag, RecordTag::Blob) {
                BlobStore::free(ctx.cache, ctx.freelist, removed.tail_as_offset())?;
            }
            if removed.key_is_extended {
                ctx.extkeys.invalidate(removed.ext_blob_offset());
                BlobStore::free(ctx.cache, ctx.freelist, removed.ext_blob_offset())?;
            }
            self.encode(ctx, offset, &header, &slots)?;
            return Ok(slots.len() < minkeys);
        }

        let mut descend_idx: Option<usize> = None;
        let mut descend = header.ptr_left;
        for (i, s) in slots.iter().enumerate() {
            if self.compare(ctx, s, key)? != Ordering::Greater {
                descend = s.tail_as_offset();
                descend_idx = Some(i);
            } else {
                break;
            }
        }

        let child_underflowed = self.erase_recursive(ctx, descend, key)?;
        if !child_underflowed {
            return Ok(false);
        }
        self.rebalance_child(ctx, offset, &mut header, &mut slots, descend_idx, descend)?;
        Ok(slots.len() < minkeys)
    }

    /// Frees a separator slot's extended-key blob, if it has one, before the
    /// slot is overwritten or removed during a rebalance. Separator and leaf
    /// copies of a key each own an independent blob, so this never touches
    /// the leaf's.
    fn free_separator_blob(&self, ctx: &mut TreeCtx, slot: &Slot) -> Result<()> {
        if slot.key_is_extended {
            ctx.extkeys.invalidate(slot.ext_blob_offset());
            BlobStore::free(ctx.cache, ctx.freelist, slot.ext_blob_offset())?;
        }
        Ok(())
    }

    /// Shifts a key from whichever sibling has more to spare, or merges with
    /// one when neither has more than `minkeys`. A tie between equally
    /// occupied siblings favors the right one.
    fn rebalance_child(
        &self,
        ctx: &mut TreeCtx,
        parent_offset: PageId,
        parent_header: &mut NodeHeader,
        parent_slots: &mut Vec<Slot>,
        child_slot_idx: Option<usize>,
        child_offset: PageId,
    ) -> Result<()> {
        let (child_header, mut child_slots) = self.decode(ctx, child_offset)?;
        let minkeys = self.minkeys(ctx.cache.page_size(), DEFAULT_MERGE_RATIO);

        let right_sibling_offset = match child_slot_idx {
            Some(i) if i + 1 < parent_slots.len() => Some(parent_slots[i + 1].tail_as_offset()),
            None if !parent_slots.is_empty() => Some(parent_slots[0].tail_as_offset()),
            _ => None,
        };
        let left_sibling_offset = match child_slot_idx {
            Some(0) | None => None,
            Some(i) => Some(parent_slots[i - 1].tail_as_offset()),
        };

        let right = match right_sibling_offset {
            Some(o) => Some((o, self.decode(ctx, o)?)),
            None => None,
        };
        let left = match left_sibling_offset {
            Some(o) => Some((o, self.decode(ctx, o)?)),
            None => None,
        };
        let right_len = right.as_ref().map(|(_, (_, s))| s.len());
        let left_len = left.as_ref().map(|(_, (_, s))| s.len());

        let shift_right = matches!(right_len, Some(r) if r > minkeys) && right_len.unwrap_or(0) >= left_len.unwrap_or(0);
        let shift_left = !shift_right && matches!(left_len, Some(l) if l > minkeys);

        if shift_right {
            let (right_offset, (right_header, mut right_slots)) = right.unwrap();
            ctx.cache.begin_structural_change(child_offset);
            ctx.cache.begin_structural_change(right_offset);
            ctx.cache.begin_structural_change(parent_offset);
            let moved = right_slots.remove(0);
            child_slots.push(moved);
            self.encode(ctx, child_offset, &child_header, &child_slots)?;
            self.encode(ctx, right_offset, &right_header, &right_slots)?;
            if let Some(i) = child_slot_idx {
                let new_anchor = self.full_key(ctx, &right_slots[0])?;
                self.free_separator_blob(ctx, &parent_slots[i + 1])?;
                parent_slots[i + 1] = self.make_key_slot(ctx, &new_anchor, RecordTag::Empty, right_offset.to_le_bytes())?;
            }
            self.encode(ctx, parent_offset, parent_header, parent_slots)?;
            return Ok(());
        }
        if shift_left {
            let (left_offset, (left_header, mut left_slots)) = left.unwrap();
            ctx.cache.begin_structural_change(child_offset);
            ctx.cache.begin_structural_change(left_offset);
            ctx.cache.begin_structural_change(parent_offset);
            let moved = left_slots.pop().unwrap();
            child_slots.insert(0, moved);
            self.encode(ctx, child_offset, &child_header, &child_slots)?;
            self.encode(ctx, left_offset, &left_header, &left_slots)?;
            if let Some(i) = child_slot_idx {
                let new_anchor = self.full_key(ctx, &child_slots[0])?;
                self.free_separator_blob(ctx, &parent_slots[i])?;
                parent_slots[i] = self.make_key_slot(ctx, &new_anchor, RecordTag::Empty, child_offset.to_le_bytes())?;
            }
            self.encode(ctx, parent_offset, parent_header, parent_slots)?;
            return Ok(());
        }

        // Neither sibling can spare a key: merge.
        if let Some((right_offset, (right_header, right_slots))) = right {
            ctx.cache.begin_structural_change(child_offset);
            ctx.cache.begin_structural_change(right_offset);
            ctx.cache.begin_structural_change(parent_offset);
            child_slots.extend(right_slots);
            let merged_right_sibling = right_header.right_sibling;
            let mut merged_header = child_header;
            merged_header.right_sibling = merged_right_sibling;
            self.encode(ctx, child_offset, &merged_header, &child_slots)?;
            ctx.freelist.free_page(ctx.cache, right_offset)?;
            if let Some(i) = child_slot_idx {
                self.free_separator_blob(ctx, &parent_slots[i + 1])?;
                parent_slots.remove(i + 1);
            } else if !parent_slots.is_empty() {
                self.free_separator_blob(ctx, &parent_slots[0])?;
                parent_slots.remove(0);
            }
            self.encode(ctx, parent_offset, parent_header, parent_slots)?;
            return Ok(());
        }
        if let Some((left_offset, (left_header, mut left_slots))) = left {
            ctx.cache.begin_structural_change(child_offset);
            ctx.cache.begin_structural_change(left_offset);
            ctx.cache.begin_structural_change(parent_offset);
            left_slots.extend(child_slots);
            let merged_right_sibling = child_header.right_sibling;
            let mut merged_header = left_header;
            merged_header.right_sibling = merged_right_sibling;
            self.encode(ctx, left_offset, &merged_header, &left_slots)?;
            ctx.freelist.free_page(ctx.cache, child_offset)?;
            if let Some(i) = child_slot_idx {
                self.free_separator_blob(ctx, &parent_slots[i])?;
                parent_slots.remove(i);
            }
            self.encode(ctx, parent_offset, parent_header, parent_slots)?;
            return Ok(());
        }
        // Root with a single child and no siblings: nothing to rebalance.
        self.encode(ctx, child_offset, &child_header, &child_slots)?;
        Ok(())
    }

    // ---- enumerate / integrity -------------------------------------------

    /// Visits every leaf key in order, level by level from the root.
    pub fn enumerate(
        &self,
        ctx: &mut TreeCtx,
        root: PageId,
        callback: &mut dyn FnMut(EnumEvent) -> Result<EnumAction>,
    ) -> Result<()> {
        let mut offset = root;
        loop {
            let (header, _) = self.decode(ctx, offset)?;
            if header.is_leaf() {
                break;
            }
            match callback(EnumEvent::Descend { from: offset, to: header.ptr_left })? {
                EnumAction::Stop => return Ok(()),
                _ => {}
            }
            offset = header.ptr_left;
        }

        let mut leaf = Some(offset);
        'leaves: while let Some(leaf_offset) = leaf {
            let (header, slots) = self.decode(ctx, leaf_offset)?;
            match callback(EnumEvent::PageStart { page: leaf_offset, is_leaf: true })? {
                EnumAction::Stop => break 'leaves,
                EnumAction::DoNotDescend => {
                    leaf = header.right_sibling_opt();
                    continue;
                }
                EnumAction::Continue => {}
            }
            for (i, s) in slots.iter().enumerate() {
                let key = self.full_key(ctx, s)?;
                match callback(EnumEvent::Item { page: leaf_offset, slot_index: i, slot: s, key: &key })? {
                    EnumAction::Stop => break 'leaves,
                    EnumAction::DoNotDescend => break,
                    EnumAction::Continue => {}
                }
            }
            let _ = callback(EnumEvent::PageStop { page: leaf_offset })?;
            leaf = header.right_sibling_opt();
        }
        Ok(())
    }

    /// Walks the whole tree verifying the structural invariants; returns a
    /// report rather than only pass/fail.
    pub fn check_integrity(&self, ctx: &mut TreeCtx, root: PageId) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        self.check_node(ctx, root, true, &mut report)?;
        Ok(report)
    }

    fn check_node(&self, ctx: &mut TreeCtx, offset: PageId, is_root: bool, report: &mut IntegrityReport) -> Result<()> {
        let (header, slots) = self.decode(ctx, offset)?;
        let minkeys = self.minkeys(ctx.cache.page_size(), DEFAULT_MERGE_RATIO);

        for w in slots.windows(2) {
            let next_key = self.full_key(ctx, &w[1])?;
            if self.compare(ctx, &w[0], &next_key)? != Ordering::Less {
                report.violations.push(format!("page {offset}: slots out of order"));
            }
        }
        for s in &slots {
            if s.key_is_extended && s.ext_blob_offset() == 0 {
                report.violations.push(format!("page {offset}: extended slot with zero blob offset"));
            }
        }
        if header.is_leaf() {
            if !is_root && slots.len() + 1 < minkeys {
                report.violations.push(format!("leaf {offset}: occupancy below minkeys"));
            } else if is_root && slots.is_empty() {
                report.warnings.push("root leaf is empty".to_string());
            }
        } else {
            self.check_node(ctx, header.ptr_left, false, report)?;
            for s in &slots {
                self.check_node(ctx, s.tail_as_offset(), false, report)?;
            }
        }
        Ok(())
    }
}

enum InsertOutcome {
    Done,
    Split { pivot_key: Vec<u8>, pivot_slot: Slot, new_right: PageId },
}

impl NodeHeader {
    fn right_sibling_opt(&self) -> Option<PageId> {
        if self.right_sibling == 0 {
            None
        } else {
            Some(self.right_sibling)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryDevice;
    use crate::types::LexicographicComparator;
    use crate::wal::Log;
    use std::sync::Arc;

    fn new_ctx_parts() -> (Cache, Freelist, ExtendedKeyCache, LexicographicComparator) {
        let dev = Arc::new(InMemoryDevice::new());
        let log = Log::new_in_memory();
        let cache = Cache::new(dev, log, 1024, 256, false, false);
        (cache, Freelist::new(None, 1024), ExtendedKeyCache::default(), LexicographicComparator)
    }

    fn make_root(cache: &mut Cache, freelist: &mut Freelist) -> PageId {
        let offset = freelist.alloc_page(cache).unwrap();
        cache.alloc_page(offset, PageKind::BtreeRoot, false).unwrap();
        cache.unpin(offset);
        offset
    }

    #[test]
    fn insert_then_find_round_trips() {
        let (mut cache, mut freelist, mut extkeys, cmp) = new_ctx_parts();
        let root = make_root(&mut cache, &mut freelist);
        let tree = BTree { inline_key_size: 16 };
        let mut ctx = TreeCtx { cache: &mut cache, freelist: &mut freelist, extkeys: &mut extkeys, comparator: &cmp };
        let (tag, tail) = crate::blob::encode_inline(b"v").unwrap();
        let root = tree.insert(&mut ctx, root, b"a", tag, tail, false).unwrap();
        let (_, _, slot) = tree.find(&mut ctx, root, b"a", OpFlags::empty()).unwrap();
        assert_eq!(crate::blob::decode_inline(slot.record_tag, slot.tail), b"v");
    }

    #[test]
    fn inserting_many_keys_splits_and_enumerates_in_order() {
        let (mut cache, mut freelist, mut extkeys, cmp) = new_ctx_parts();
        let mut root = make_root(&mut cache, &mut freelist);
        let tree = BTree { inline_key_size: 16 };
        for i in 1..=100u32 {
            let key = format!("k{:04}", i).into_bytes();
            let record = vec![0x41u8; 32];
            let mut ctx = TreeCtx { cache: &mut cache, freelist: &mut freelist, extkeys: &mut extkeys, comparator: &cmp };
            let blob = BlobStore::allocate(ctx.cache, ctx.freelist, &record).unwrap();
            root = tree.insert(&mut ctx, root, &key, RecordTag::Blob, blob.to_le_bytes(), false).unwrap();
        }
        let mut ctx = TreeCtx { cache: &mut cache, freelist: &mut freelist, extkeys: &mut extkeys, comparator: &cmp };
        let report = tree.check_integrity(&mut ctx, root).unwrap();
        assert!(report.is_clean(), "{:?}", report.violations);

        let mut seen = Vec::new();
        tree.enumerate(&mut ctx, root, &mut |ev| {
            if let EnumEvent::Item { key, .. } = ev {
                seen.push(String::from_utf8(key.to_vec()).unwrap());
            }
            Ok(EnumAction::Continue)
        }).unwrap();
        assert_eq!(seen.len(), 100);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn erase_removes_key() {
        let (mut cache, mut freelist, mut extkeys, cmp) = new_ctx_parts();
        let mut root = make_root(&mut cache, &mut freelist);
        let tree = BTree { inline_key_size: 16 };
        {
            let mut ctx = TreeCtx { cache: &mut cache, freelist: &mut freelist, extkeys: &mut extkeys, comparator: &cmp };
            let (tag, tail) = crate::blob::encode_inline(b"x").unwrap();
            root = tree.insert(&mut ctx, root, b"a", tag, tail, false).unwrap();
            root = tree.erase(&mut ctx, root, b"a").unwrap();
            let err = tree.find(&mut ctx, root, b"a", OpFlags::empty()).unwrap_err();
            assert_eq!(err.code(), ErrorCode::KeyNotFound);
        }
    }
}
