//! Cursor: a position bound to a database, coupled to a B+-tree slot, to a
//! transaction op, or uncoupled (holding an owned key so it survives page
//! movement).
//!
//! An arena-plus-generation scheme in place of cyclic page/cursor
//! pointers: a coupled cursor remembers `(page, generation, slot)` and is
//! treated as stale — falling back to uncoupled, then re-coupling by key —
//! the moment the page's generation has moved on.

use crate::blob::{BlobStore, DuplicateEntry, DuplicateTable, RecordTag};
use crate::btree::node::RID_SIZE;
use crate::btree::{node::Slot, BTree, EnumAction, EnumEvent, TreeCtx};
use crate::error::{Error, ErrorCode, Result};
use crate::types::{DupId, OpFlags, PageId, TxnId};

#[derive(Debug, Clone)]
enum Position {
    Nil,
    /// Coupled to a specific slot of a resident B+-tree leaf.
    CoupledBtree { page: PageId, generation: u64, slot: usize, dup_id: DupId },
    /// Coupled to a transaction op (found via the overlay, not yet flushed).
    CoupledTxn { key: Vec<u8> },
    /// Detached from any page; holds its own copy of the current key.
    Uncoupled { key: Vec<u8>, dup_id: DupId },
}

pub struct Cursor {
    pub txn: Option<TxnId>,
    position: Position,
}

impl Cursor {
    pub fn new(txn: Option<TxnId>) -> Self {
        Self { txn, position: Position::Nil }
    }

    pub fn clone_cursor(&self) -> Self {
        Self { txn: self.txn, position: self.position.clone() }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.position, Position::Nil)
    }

    pub fn close(&mut self) {
        self.position = Position::Nil;
    }

    /// Called by the cache/generation machinery before a structural change
    /// touches a page this cursor is coupled to.
    pub fn uncouple_if_on(&mut self, page: PageId, key: Vec<u8>) {
        if let Position::CoupledBtree { page: p, dup_id, .. } = &self.position {
            if *p == page {
                self.position = Position::Uncoupled { key, dup_id: *dup_id };
            }
        }
    }

    fn current_generation(ctx: &mut TreeCtx, page: PageId) -> u64 {
        ctx.cache.generation(page)
    }

    /// Re-validates a `CoupledBtree` position against the page's current
    /// generation, demoting to `Uncoupled` (by re-deriving the key) if the
    /// page changed shape since coupling.
    fn ensure_fresh(&mut self, ctx: &mut TreeCtx, tree: &BTree) -> Result<()> {
        if let Position::CoupledBtree { page, generation, slot, dup_id } = self.position.clone() {
            if Self::current_generation(ctx, page) != generation {
                let key = Self::slot_key_at(ctx, tree, page, slot)?;
                self.position = Position::Uncoupled { key, dup_id };
            }
        }
        Ok(())
    }

    fn slot_key_at(ctx: &mut TreeCtx, tree: &BTree, page: PageId, slot_idx: usize) -> Result<Vec<u8>> {
        let (_, slots) = tree.decode_for_cursor(ctx, page)?;
        let slot = slots
            .get(slot_idx)
            .ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;
        tree.full_key(ctx, slot)
    }

    fn couple(&mut self, ctx: &mut TreeCtx, page: PageId, slot: usize, dup_id: DupId) {
        let generation = ctx.cache.generation(page);
        ctx.cache.couple_cursor(page, self as *const _ as u64);
        self.position = Position::CoupledBtree { page, generation, slot, dup_id };
    }

    /// `find`: positions on the exact key, or (with approximate-match
    /// flags) its nearest neighbor. A bare `GEQ`-style request on a
    /// brand-new cursor with no exact hit and no approximate bit is an
    /// error per the stated invalid-parameter rule.
    pub fn find(&mut self, ctx: &mut TreeCtx, tree: &BTree, root: PageId, key: &[u8], flags: OpFlags) -> Result<()> {
        let (page, slot, _slot_data) = tree.find(ctx, root, key, flags)?;
        self.couple(ctx, page, slot, 0);
        Ok(())
    }

    pub fn current_key(&mut self, ctx: &mut TreeCtx, tree: &BTree) -> Result<Vec<u8>> {
        self.ensure_fresh(ctx, tree)?;
        match &self.position {
            Position::Nil => Err(Error::new(ErrorCode::CursorIsNil)),
            Position::CoupledBtree { page, slot, .. } => Self::slot_key_at(ctx, tree, *page, *slot),
            Position::CoupledTxn { key } | Position::Uncoupled { key, .. } => Ok(key.clone()),
        }
    }

    pub fn current_slot(&mut self, ctx: &mut TreeCtx, tree: &BTree, root: PageId) -> Result<Slot> {
        self.ensure_fresh(ctx, tree)?;
        match self.position.clone() {
            Position::Nil => Err(Error::new(ErrorCode::CursorIsNil)),
            Position::CoupledBtree { page, slot, .. } => {
                let (_, slots) = tree.decode_for_cursor(ctx, page)?;
                slots.get(slot).cloned().ok_or_else(|| Error::new(ErrorCode::CursorIsNil))
            }
            Position::Uncoupled { key, .. } | Position::CoupledTxn { key } => {
                let (page, slot, s) = tree.find(ctx, root, &key, OpFlags::empty())?;
                self.couple(ctx, page, slot, 0);
                Ok(s)
            }
        }
    }

    /// Advances to the next key (ignoring duplicates of the current key).
    pub fn move_next(&mut self, ctx: &mut TreeCtx, tree: &BTree, root: PageId) -> Result<()> {
        let (page, slot) = self.resolve_btree_position(ctx, tree, root)?;
        let (header, slots) = tree.decode_for_cursor(ctx, page)?;
        if slot + 1 < slots.len() {
            self.couple(ctx, page, slot + 1, 0);
            return Ok(());
        }
        if header.right_sibling != 0 {
            let (_, right_slots) = tree.decode_for_cursor(ctx, header.right_sibling)?;
            if !right_slots.is_empty() {
                self.couple(ctx, header.right_sibling, 0, 0);
                return Ok(());
            }
        }
        self.position = Position::Nil;
        Ok(())
    }

    pub fn move_prev(&mut self, ctx: &mut TreeCtx, tree: &BTree, root: PageId) -> Result<()> {
        let (page, slot) = self.resolve_btree_position(ctx, tree, root)?;
        let (header, _slots) = tree.decode_for_cursor(ctx, page)?;
        if slot > 0 {
            self.couple(ctx, page, slot - 1, 0);
            return Ok(());
        }
        if header.left_sibling != 0 {
            let (_, left_slots) = tree.decode_for_cursor(ctx, header.left_sibling)?;
            if !left_slots.is_empty() {
                self.couple(ctx, header.left_sibling, left_slots.len() - 1, 0);
                return Ok(());
            }
        }
        self.position = Position::Nil;
        Ok(())
    }

    fn resolve_btree_position(&mut self, ctx: &mut TreeCtx, tree: &BTree, root: PageId) -> Result<(PageId, usize)> {
        self.ensure_fresh(ctx, tree)?;
        match self.position.clone() {
            Position::CoupledBtree { page, slot, .. } => Ok((page, slot)),
            Position::Uncoupled { key, .. } | Position::CoupledTxn { key } => {
                let (page, slot, _) = tree.find(ctx, root, &key, OpFlags::empty())?;
                self.couple(ctx, page, slot, 0);
                Ok((page, slot))
            }
            Position::Nil => Err(Error::new(ErrorCode::CursorIsNil)),
        }
    }

    /// Positions on the leftmost key of the tree.
    pub fn first(&mut self, ctx: &mut TreeCtx, tree: &BTree, root: PageId) -> Result<()> {
        let mut page = root;
        loop {
            let (header, _) = tree.decode_for_cursor(ctx, page)?;
            if header.is_leaf() {
                break;
            }
            page = header.ptr_left;
        }
        let (_, slots) = tree.decode_for_cursor(ctx, page)?;
        if slots.is_empty() {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        self.couple(ctx, page, 0, 0);
        Ok(())
    }

    pub fn last(&mut self, ctx: &mut TreeCtx, tree: &BTree, root: PageId) -> Result<()> {
        let mut collected = Vec::new();
        tree.enumerate(ctx, root, &mut |ev| {
            if let EnumEvent::PageStart { page, is_leaf: true } = ev {
                collected.push(page);
            }
            Ok(EnumAction::Continue)
        })?;
        let last_leaf = *collected.last().ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
        let (_, slots) = tree.decode_for_cursor(ctx, last_leaf)?;
        if slots.is_empty() {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        self.couple(ctx, last_leaf, slots.len() - 1, 0);
        Ok(())
    }

    /// Duplicate-aware advance: moves within the current slot's duplicate
    /// table if one exists and `only_duplicates`/default semantics allow
    /// it; otherwise falls through to `move_next`.
    pub fn move_next_duplicate(
        &mut self,
        ctx: &mut TreeCtx,
        tree: &BTree,
        root: PageId,
        only_duplicates: bool,
        skip_duplicates: bool,
    ) -> Result<()> {
        let slot = self.current_slot(ctx, tree, root)?;
        if slot.has_duplicates && !skip_duplicates {
            let head = slot.tail_as_offset();
            let dup_id = self.dup_id();
            let count = DuplicateTable::get_count(ctx.cache, head)?;
            if dup_id + 1 < count {
                self.set_dup_id(dup_id + 1);
                return Ok(());
            }
            if only_duplicates {
                return Err(Error::new(ErrorCode::KeyNotFound));
            }
        }
        self.move_next(ctx, tree, root)
    }

    fn dup_id(&self) -> DupId {
        match &self.position {
            Position::CoupledBtree { dup_id, .. } | Position::Uncoupled { dup_id, .. } => *dup_id,
            _ => 0,
        }
    }

    fn set_dup_id(&mut self, dup_id: DupId) {
        match &mut self.position {
            Position::CoupledBtree { dup_id: d, .. } | Position::Uncoupled { dup_id: d, .. } => *d = dup_id,
            _ => {}
        }
    }

    pub fn current_duplicate(&mut self, ctx: &mut TreeCtx, tree: &BTree, root: PageId) -> Result<DuplicateEntry> {
        let slot = self.current_slot(ctx, tree, root)?;
        if !slot.has_duplicates {
            return Ok(DuplicateEntry { tag: slot.record_tag, rid: slot.tail_as_offset() });
        }
        DuplicateTable::get(ctx.cache, slot.tail_as_offset(), self.dup_id())
    }

    /// Erases the record the cursor currently points at. If the slot holds
    /// more than one duplicate and the cursor isn't on the last one, only
    /// that duplicate is removed (freeing its out-of-line blob, if any) and
    /// the cursor is left uncoupled at the same key; otherwise the whole key
    /// is erased from the tree and the cursor goes `Nil`. Returns the tree's
    /// possibly-updated root, same contract as `BTree::erase`.
    pub fn erase(&mut self, ctx: &mut TreeCtx, tree: &BTree, root: PageId) -> Result<PageId> {
        let (page, slot_idx) = self.resolve_btree_position(ctx, tree, root)?;
        let (header, mut slots) = tree.decode_for_cursor(ctx, page)?;
        let slot = slots.get(slot_idx).cloned().ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;

        if slot.has_duplicates {
            let head = slot.tail_as_offset();
            let dup_id = self.dup_id();
            let count = DuplicateTable::get_count(ctx.cache, head)?;
            if count > 1 {
                let removed = DuplicateTable::get(ctx.cache, head, dup_id)?;
                if matches!(removed.tag, RecordTag::Blob) {
                    BlobStore::free(ctx.cache, ctx.freelist, removed.rid)?;
                }
                let new_head = match DuplicateTable::erase(ctx.cache, ctx.freelist, head, dup_id)? {
                    Some(h) => h,
                    None => return Err(Error::new(ErrorCode::Corrupt)),
                };
                let mut updated = slot;
                updated.tail = Slot::offset_tail(new_head);
                slots[slot_idx] = updated;
                tree.encode_pub(ctx, page, &header, &slots)?;
                let key = Self::slot_key_at(ctx, tree, page, slot_idx)?;
                self.position = Position::Uncoupled { key, dup_id: 0 };
                return Ok(root);
            }
        }

        let key = self.current_key(ctx, tree)?;
        let new_root = tree.erase(ctx, root, &key)?;
        self.position = Position::Nil;
        Ok(new_root)
    }

    /// Replaces the record the cursor currently points at with
    /// `record_tag`/`record_tail`, without moving the cursor. Patches only
    /// the current duplicate if the slot has more than one; frees the old
    /// out-of-line blob first if the record being replaced was one.
    pub fn overwrite(
        &mut self,
        ctx: &mut TreeCtx,
        tree: &BTree,
        root: PageId,
        record_tag: RecordTag,
        record_tail: [u8; RID_SIZE],
    ) -> Result<()> {
        let (page, slot_idx) = self.resolve_btree_position(ctx, tree, root)?;
        let (header, mut slots) = tree.decode_for_cursor(ctx, page)?;
        let slot = slots.get(slot_idx).cloned().ok_or_else(|| Error::new(ErrorCode::CursorIsNil))?;

        if slot.has_duplicates {
            let head = slot.tail_as_offset();
            let dup_id = self.dup_id();
            let old = DuplicateTable::get(ctx.cache, head, dup_id)?;
            if matches!(old.tag, RecordTag::Blob) {
                BlobStore::free(ctx.cache, ctx.freelist, old.rid)?;
            }
            let new_entry = DuplicateEntry { tag: record_tag, rid: u64::from_le_bytes(record_tail) };
            let new_head = DuplicateTable::set(ctx.cache, ctx.freelist, head, dup_id, new_entry)?;
            let mut updated = slot;
            updated.tail = Slot::offset_tail(new_head);
            slots[slot_idx] = updated;
            tree.encode_pub(ctx, page, &header, &slots)?;
            return Ok(());
        }

        if matches!(slot.record_tag, RecordTag::Blob) {
            BlobStore::free(ctx.cache, ctx.freelist, slot.tail_as_offset())?;
        }
        let mut updated = slot;
        updated.record_tag = record_tag;
        updated.tail = record_tail;
        slots[slot_idx] = updated;
        tree.encode_pub(ctx, page, &header, &slots)?;
        Ok(())
    }
}

impl BTree {
    /// Thin public wrapper so the cursor (a sibling module, not a method
    /// on `BTree`) can decode a node without duplicating the byte layout.
    pub fn decode_for_cursor(&self, ctx: &mut TreeCtx, offset: PageId) -> Result<(crate::btree::node::NodeHeader, Vec<Slot>)> {
        self.decode_pub(ctx, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{encode_inline, RecordTag};
    use crate::device::InMemoryDevice;
    use crate::freelist::Freelist;
    use crate::extkey::ExtendedKeyCache;
    use crate::cache::Cache;
    use crate::page::PageKind;
    use crate::types::LexicographicComparator;
    use crate::wal::Log;
    use std::sync::Arc;

    fn setup() -> (Cache, Freelist, ExtendedKeyCache, LexicographicComparator, PageId, BTree) {
        let dev = Arc::new(InMemoryDevice::new());
        let mut cache = Cache::new(dev, Log::new_in_memory(), 1024, 256, false, false);
        let mut freelist = Freelist::new(None, 1024);
        let root = freelist.alloc_page(&mut cache).unwrap();
        cache.alloc_page(root, PageKind::BtreeRoot, false).unwrap();
        cache.unpin(root);
        (cache, freelist, ExtendedKeyCache::default(), LexicographicComparator, root, BTree { inline_key_size: 16 })
    }

    #[test]
    fn find_then_move_next_crosses_keys() {
        let (mut cache, mut freelist, mut extkeys, cmp, mut root, tree) = setup();
        for k in [b"a", b"b", b"c"] {
            let mut ctx = TreeCtx { cache: &mut cache, freelist: &mut freelist, extkeys: &mut extkeys, comparator: &cmp };
            let (tag, tail) = encode_inline(k).unwrap();
            root = tree.insert(&mut ctx, root, k, tag, tail, false).unwrap();
        }
        let mut ctx = TreeCtx { cache: &mut cache, freelist: &mut freelist, extkeys: &mut extkeys, comparator: &cmp };
        let mut cursor = Cursor::new(None);
        cursor.find(&mut ctx, &tree, root, b"a", OpFlags::empty()).unwrap();
        cursor.move_next(&mut ctx, &tree, root).unwrap();
        assert_eq!(cursor.current_key(&mut ctx, &tree).unwrap(), b"b");
    }

    #[test]
    fn uncoupling_survives_generation_bump() {
        let (mut cache, mut freelist, mut extkeys, cmp, mut root, tree) = setup();
        {
            let mut ctx = TreeCtx { cache: &mut cache, freelist: &mut freelist, extkeys: &mut extkeys, comparator: &cmp };
            let (tag, tail) = encode_inline(b"k").unwrap();
            root = tree.insert(&mut ctx, root, b"k", tag, tail, false).unwrap();
        }
        let mut ctx = TreeCtx { cache: &mut cache, freelist: &mut freelist, extkeys: &mut extkeys, comparator: &cmp };
        let mut cursor = Cursor::new(None);
        cursor.find(&mut ctx, &tree, root, b"k", OpFlags::empty()).unwrap();
        ctx.cache.begin_structural_change(root);
        assert_eq!(cursor.current_key(&mut ctx, &tree).unwrap(), b"k");
    }
}
