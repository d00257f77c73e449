//! A single database's handle: its B+-tree root, comparator, extended-key
//! cache, statistics, and (if the environment enabled them) its
//! transaction-visible overlay.
//!
//! One struct bundles the tree plus everything a caller-facing operation
//! needs: cache/freelist/extkey/txn collaborators, plus per-database
//! statistics.

use std::cmp::Ordering;

use log::trace;

use crate::blob::{encode_inline, BlobStore, DuplicateEntry, DuplicateTable, InsertPosition, RecordTag};
use crate::btree::node::RID_SIZE;
use crate::btree::{BTree, IntegrityReport, TreeCtx};
use crate::cache::Cache;
use crate::cursor::Cursor;
use crate::error::{Error, ErrorCode, Result};
use crate::extkey::ExtendedKeyCache;
use crate::freelist::Freelist;
use crate::stats::{FindOutcome, Hinter, Statistics};
use crate::txn::{OpKind, TransactionManager};
use crate::types::{
    key_to_record_number, record_number_to_key, Comparator, EnvFlags, LexicographicComparator, OpFlags, PageId, TxnId,
};

pub struct Database {
    name: u16,
    key_size: u16,
    root: PageId,
    record_number_mode: bool,
    last_recno: u64,
    tree: BTree,
    comparator: Box<dyn Comparator>,
    extkeys: ExtendedKeyCache,
    stats: Statistics,
    txns: TransactionManager,
    duplicates_enabled: bool,
}

/// Packs `value` for inline storage, falling back to a blob allocation when
/// it doesn't fit in a slot's 8-byte tail.
fn allocate_record(cache: &mut Cache, freelist: &mut Freelist, value: &[u8]) -> Result<(RecordTag, [u8; RID_SIZE])> {
    if let Some(inline) = encode_inline(value) {
        return Ok(inline);
    }
    let offset = BlobStore::allocate(cache, freelist, value)?;
    Ok((RecordTag::Blob, offset.to_le_bytes()))
}

fn read_record(cache: &mut Cache, tag: RecordTag, tail: [u8; RID_SIZE]) -> Result<Vec<u8>> {
    match tag {
        RecordTag::Blob => BlobStore::read(cache, u64::from_le_bytes(tail)),
        other => Ok(crate::blob::decode_inline(other, tail)),
    }
}

impl Database {
    pub fn new(name: u16, key_size: u16, root: PageId, env_flags: EnvFlags, record_number_mode: bool) -> Self {
        Self {
            name,
            key_size,
            root,
            record_number_mode,
            last_recno: 0,
            tree: BTree { inline_key_size: (key_size as usize).max(RID_SIZE) },
            comparator: Box::new(LexicographicComparator),
            extkeys: ExtendedKeyCache::default(),
            stats: Statistics::default(),
            txns: TransactionManager::new(64),
            duplicates_enabled: env_flags.contains(EnvFlags::ENABLE_DUPLICATES),
        }
    }

    pub fn name(&self) -> u16 {
        self.name
    }

    pub fn key_size(&self) -> u16 {
        self.key_size
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn last_recno(&self) -> u64 {
        self.last_recno
    }

    /// Resolves a caller-supplied key, auto-assigning the next record number
    /// when the database is in `RECORD_NUMBER` mode and no key was given.
    fn resolve_key(&mut self, key: &[u8]) -> Vec<u8> {
        if self.record_number_mode && key.is_empty() {
            self.last_recno += 1;
            record_number_to_key(self.last_recno).to_vec()
        } else {
            if self.record_number_mode {
                if let Some(n) = key_to_record_number(key) {
                    self.last_recno = self.last_recno.max(n);
                }
            }
            key.to_vec()
        }
    }

    /// Rejects a write/read whose flags ask for something an inline record
    /// or a duplicate cannot support: `PARTIAL` needs an out-of-line blob to
    /// patch or read in place. `has_duplicates`/`tag` describe the record
    /// actually found, since only a plain `Blob` slot has anything to patch.
    fn reject_partial(flags: OpFlags, has_duplicates: bool, tag: RecordTag) -> Result<()> {
        if flags.contains(OpFlags::PARTIAL) && (has_duplicates || tag != RecordTag::Blob) {
            return Err(Error::with_context(
                ErrorCode::InvParameter,
                "PARTIAL is rejected for inline records and duplicates",
            ));
        }
        Ok(())
    }

    /// Tries to append directly into the last leaf an insert landed on,
    /// skipping a full tree descent. Only taken when that leaf is still the
    /// tree's rightmost leaf, `key` sorts past its last entry, and it has
    /// room for one more slot; any other condition falls back to the normal
    /// path, so this can never change the outcome, only how fast it is
    /// reached.
    fn try_fast_append(
        tree: &BTree,
        stats: &mut Statistics,
        comparator: &dyn Comparator,
        ctx: &mut TreeCtx,
        key: &[u8],
        tag: RecordTag,
        tail: [u8; RID_SIZE],
    ) -> Result<bool> {
        let hint_append = stats
            .known_max
            .as_deref()
            .is_some_and(|m| comparator.compare(key, m) == Ordering::Greater);
        let hints = Hinter::try_fast_track(stats, hint_append);
        if !hints.try_append {
            return Ok(false);
        }
        let Some(leaf) = hints.fast_track_leaf else {
            return Ok(false);
        };
        let (header, mut slots) = tree.decode_for_cursor(ctx, leaf)?;
        if !header.is_leaf() || header.right_sibling != 0 {
            return Ok(false);
        }
        if let Some(last) = slots.last() {
            let last_key = tree.full_key(ctx, last)?;
            if comparator.compare(key, &last_key) != Ordering::Greater {
                return Ok(false);
            }
        }
        if slots.len() + 1 > tree.maxkeys(ctx.cache.page_size()) {
            return Ok(false);
        }
        let new_slot = tree.make_key_slot_pub(ctx, key, tag, tail)?;
        let slot_idx = slots.len();
        slots.push(new_slot);
        tree.encode_pub(ctx, leaf, &header, &slots)?;
        stats.record_insert(0.0, leaf, slot_idx as u16);
        Ok(true)
    }

    /// Inserts `key`/`value`. Within a transaction (`txn.is_some()`) the
    /// write lands in the overlay and is not visible to other transactions
    /// until commit; outside one, it is applied straight to the tree.
    pub fn insert(
        &mut self,
        cache: &mut Cache,
        freelist: &mut Freelist,
        key: &[u8],
        value: &[u8],
        overwrite: bool,
        txn: Option<TxnId>,
    ) -> Result<()> {
        let key = self.resolve_key(key);
        let (tag, tail) = allocate_record(cache, freelist, value)?;
        let cmp = self.comparator.as_ref();
        self.stats.widen_bounds(&key, |a, b| cmp.compare(a, b));

        if let Some(txn_id) = txn {
            let exists = {
                let mut ctx = TreeCtx {
                    cache,
                    freelist,
                    extkeys: &mut self.extkeys,
                    comparator: self.comparator.as_ref(),
                };
                self.tree.find(&mut ctx, self.root, &key, OpFlags::empty()).is_ok()
            };
            trace!("txn {txn_id} insert key_len={} exists={exists}", key.len());
            return self.txns.insert(txn_id, &key, tag, tail, overwrite, false, exists, InsertPosition::Last);
        }

        let mut ctx = TreeCtx {
            cache,
            freelist,
            extkeys: &mut self.extkeys,
            comparator: self.comparator.as_ref(),
        };
        if !overwrite
            && Self::try_fast_append(&self.tree, &mut self.stats, self.comparator.as_ref(), &mut ctx, &key, tag, tail)?
        {
            return Ok(());
        }
        self.root = self.tree.insert(&mut ctx, self.root, &key, tag, tail, overwrite)?;
        let (leaf, slot_idx, _) = self.tree.find(&mut ctx, self.root, &key, OpFlags::empty())?;
        self.stats.record_insert(0.0, leaf, slot_idx as u16);
        Ok(())
    }

    /// Inserts a second (or later) value for `key`, ordered by `pos`. Within
    /// a transaction the write lands in the overlay, same as `insert`; the
    /// overlay replays it through `insert_duplicate_into_tree` at commit so
    /// prior duplicates for the key aren't clobbered.
    pub fn insert_duplicate(
        &mut self,
        cache: &mut Cache,
        freelist: &mut Freelist,
        key: &[u8],
        value: &[u8],
        pos: InsertPosition,
        txn: Option<TxnId>,
    ) -> Result<()> {
        if !self.duplicates_enabled {
            return Err(Error::new(ErrorCode::InvParameter));
        }
        let (tag, tail) = allocate_record(cache, freelist, value)?;

        if let Some(txn_id) = txn {
            let exists = {
                let mut ctx = TreeCtx {
                    cache,
                    freelist,
                    extkeys: &mut self.extkeys,
                    comparator: self.comparator.as_ref(),
                };
                self.tree.find(&mut ctx, self.root, key, OpFlags::empty()).is_ok()
            };
            trace!("txn {txn_id} insert_duplicate key_len={} exists={exists}", key.len());
            return self.txns.insert(txn_id, key, tag, tail, false, true, exists, pos);
        }

        let mut ctx = TreeCtx {
            cache,
            freelist,
            extkeys: &mut self.extkeys,
            comparator: self.comparator.as_ref(),
        };
        Self::insert_duplicate_into_tree(&self.tree, &mut ctx, self.root, key, tag, tail, pos)
    }

    /// Tree-level half of `insert_duplicate`: locates `key`'s leaf slot and
    /// appends `tag`/`tail` to its duplicate table at `pos`, converting a
    /// plain slot into a duplicate-table head the first time. Shared by the
    /// direct path above and by transaction replay (`txn.rs`), since both
    /// need to append rather than overwrite.
    pub(crate) fn insert_duplicate_into_tree(
        tree: &BTree,
        ctx: &mut TreeCtx,
        root: PageId,
        key: &[u8],
        tag: RecordTag,
        tail: [u8; RID_SIZE],
        pos: InsertPosition,
    ) -> Result<()> {
        let (leaf, slot_idx, slot) = tree.find(ctx, root, key, OpFlags::empty())?;
        let (header, mut slots) = tree.decode_for_cursor(ctx, leaf)?;

        let new_entry = DuplicateEntry { tag, rid: u64::from_le_bytes(tail) };
        let new_head = if slot.has_duplicates {
            DuplicateTable::insert(ctx.cache, ctx.freelist, Some(slot.tail_as_offset()), new_entry, pos)?
        } else {
            let existing = DuplicateEntry { tag: slot.record_tag, rid: slot.tail_as_offset() };
            let h = DuplicateTable::insert(ctx.cache, ctx.freelist, None, existing, InsertPosition::Last)?;
            DuplicateTable::insert(ctx.cache, ctx.freelist, Some(h), new_entry, pos)?
        };

        let mut updated = slot;
        updated.has_duplicates = true;
        updated.record_tag = RecordTag::Empty;
        updated.tail = crate::btree::node::Slot::offset_tail(new_head);
        slots[slot_idx] = updated;
        tree.encode_pub(ctx, leaf, &header, &slots)?;
        Ok(())
    }

    /// Patches `data` into an existing out-of-line blob record at
    /// `partial_offset`, without reallocating the record or touching bytes
    /// outside that range. Rejected for inline records, duplicates, and
    /// writes that would grow the record past its current length. Not
    /// transaction-aware: a partial write patches committed pages directly,
    /// which the overlay's deferred-replay model has no room for.
    pub fn insert_partial(
        &mut self,
        cache: &mut Cache,
        freelist: &mut Freelist,
        key: &[u8],
        data: &[u8],
        partial_offset: usize,
        txn: Option<TxnId>,
    ) -> Result<()> {
        if txn.is_some() {
            return Err(Error::new(ErrorCode::InvParameter));
        }
        let mut ctx = TreeCtx {
            cache,
            freelist,
            extkeys: &mut self.extkeys,
            comparator: self.comparator.as_ref(),
        };
        let (_, _, slot) = self.tree.find(&mut ctx, self.root, key, OpFlags::empty())?;
        Self::reject_partial(OpFlags::PARTIAL, slot.has_duplicates, slot.record_tag)?;
        BlobStore::overwrite_partial(ctx.cache, u64::from_le_bytes(slot.tail), data, partial_offset)
    }

    /// Reads `key`'s value. Within a transaction, the overlay (this
    /// transaction's own writes plus any already-committed ones) takes
    /// precedence over the tree.
    pub fn find(
        &mut self,
        cache: &mut Cache,
        freelist: &mut Freelist,
        key: &[u8],
        flags: OpFlags,
        txn: Option<TxnId>,
    ) -> Result<Vec<u8>> {
        self.find_impl(cache, freelist, key, flags, None, txn)
    }

    /// Reads only `[partial_offset, partial_offset + partial_len)` of a
    /// record, without materializing the rest. Only an out-of-line blob
    /// record (not inline, not a duplicate) has anything to slice.
    pub fn find_partial(
        &mut self,
        cache: &mut Cache,
        freelist: &mut Freelist,
        key: &[u8],
        partial_offset: usize,
        partial_len: usize,
        txn: Option<TxnId>,
    ) -> Result<Vec<u8>> {
        self.find_impl(cache, freelist, key, OpFlags::PARTIAL, Some((partial_offset, partial_len)), txn)
    }

    /// Lazily seeds `known_min`/`known_max` from the tree's actual current
    /// extremes the first time either is needed, so the bound is a valid
    /// superset of the tree's real range even right after a reopen (when a
    /// fresh `Statistics` starts with both unset). Leaves them unset if the
    /// tree is empty; the next insert establishes them via `widen_bounds`.
    fn ensure_known_bounds(tree: &BTree, stats: &mut Statistics, ctx: &mut TreeCtx, root: PageId) -> Result<()> {
        if stats.known_min.is_some() && stats.known_max.is_some() {
            return Ok(());
        }
        let mut low = Cursor::new(None);
        if low.first(ctx, tree, root).is_ok() {
            stats.known_min = low.current_key(ctx, tree).ok();
        }
        let mut high = Cursor::new(None);
        if high.last(ctx, tree, root).is_ok() {
            stats.known_max = high.current_key(ctx, tree).ok();
        }
        Ok(())
    }

    fn find_impl(
        &mut self,
        cache: &mut Cache,
        freelist: &mut Freelist,
        key: &[u8],
        flags: OpFlags,
        partial: Option<(usize, usize)>,
        txn: Option<TxnId>,
    ) -> Result<Vec<u8>> {
        if let Some(txn_id) = txn {
            if let Some(op) = self.txns.overlay_lookup(txn_id, key) {
                return match op.kind {
                    OpKind::Erase => Err(Error::new(ErrorCode::KeyErasedInTxn)),
                    OpKind::Nop => Err(Error::new(ErrorCode::KeyNotFound)),
                    _ => {
                        Self::reject_partial(flags, false, op.record_tag)?;
                        match (partial, op.record_tag) {
                            (Some((off, len)), RecordTag::Blob) => {
                                BlobStore::read_partial(cache, u64::from_le_bytes(op.record_tail), off, len)
                            }
                            _ => read_record(cache, op.record_tag, op.record_tail),
                        }
                    }
                };
            }
        }

        let mut ctx = TreeCtx {
            cache,
            freelist,
            extkeys: &mut self.extkeys,
            comparator: self.comparator.as_ref(),
        };
        Self::ensure_known_bounds(&self.tree, &mut self.stats, &mut ctx, self.root)?;
        let cmp = self.comparator.as_ref();
        if Hinter::key_is_out_of_bounds(self.stats.known_min.as_deref(), self.stats.known_max.as_deref(), key, |a, b| {
            cmp.compare(a, b)
        }) {
            self.stats.record_find(0.0, FindOutcome::OutOfBounds);
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        match self.tree.find(&mut ctx, self.root, key, flags) {
            Ok((_, _, slot)) => {
                self.stats.record_find(0.0, FindOutcome::Success);
                Self::reject_partial(flags, slot.has_duplicates, slot.record_tag)?;
                if slot.has_duplicates {
                    let entry = DuplicateTable::get(ctx.cache, slot.tail_as_offset(), 0)?;
                    read_record(ctx.cache, entry.tag, entry.rid.to_le_bytes())
                } else {
                    match (partial, slot.record_tag) {
                        (Some((off, len)), RecordTag::Blob) => {
                            BlobStore::read_partial(ctx.cache, u64::from_le_bytes(slot.tail), off, len)
                        }
                        _ => read_record(ctx.cache, slot.record_tag, slot.tail),
                    }
                }
            }
            Err(e) if e.code() == ErrorCode::KeyNotFound => {
                self.stats.record_find(0.0, FindOutcome::NotFound);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn erase(&mut self, cache: &mut Cache, freelist: &mut Freelist, key: &[u8], txn: Option<TxnId>) -> Result<()> {
        if let Some(txn_id) = txn {
            return self.txns.erase(txn_id, key);
        }
        let mut ctx = TreeCtx {
            cache,
            freelist,
            extkeys: &mut self.extkeys,
            comparator: self.comparator.as_ref(),
        };
        Self::ensure_known_bounds(&self.tree, &mut self.stats, &mut ctx, self.root)?;
        let cmp = self.comparator.as_ref();
        if Hinter::key_is_out_of_bounds(self.stats.known_min.as_deref(), self.stats.known_max.as_deref(), key, |a, b| {
            cmp.compare(a, b)
        }) {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        self.root = self.tree.erase(&mut ctx, self.root, key)?;
        self.stats.record_erase(0.0);
        Ok(())
    }

    pub fn begin(&mut self, read_only: bool) -> Result<TxnId> {
        self.txns.begin(read_only)
    }

    pub fn commit(&mut self, cache: &mut Cache, freelist: &mut Freelist, txn: TxnId) -> Result<()> {
        self.root = self.txns.commit(
            txn,
            &self.tree,
            cache,
            freelist,
            &mut self.extkeys,
            self.comparator.as_ref(),
            self.root,
        )?;
        Ok(())
    }

    pub fn abort(&mut self, cache: &mut Cache, freelist: &mut Freelist, txn: TxnId) -> Result<()> {
        self.txns.abort(txn, cache, freelist)
    }

    pub fn cursor_create(&mut self, txn: Option<TxnId>) -> Result<Cursor> {
        if let Some(txn_id) = txn {
            self.txns.attach_cursor(txn_id)?;
        }
        Ok(Cursor::new(txn))
    }

    pub fn cursor_close(&mut self, cursor: &mut Cursor) -> Result<()> {
        if let Some(txn_id) = cursor.txn {
            self.txns.detach_cursor(txn_id)?;
        }
        cursor.close();
        Ok(())
    }

    pub fn check_integrity(&mut self, cache: &mut Cache, freelist: &mut Freelist) -> Result<IntegrityReport> {
        let mut ctx = TreeCtx {
            cache,
            freelist,
            extkeys: &mut self.extkeys,
            comparator: self.comparator.as_ref(),
        };
        self.tree.check_integrity(&mut ctx, self.root)
    }

    /// Positions `cursor` at `key`, descending through the tree.
    pub fn cursor_find(
        &mut self,
        cache: &mut Cache,
        freelist: &mut Freelist,
        cursor: &mut Cursor,
        key: &[u8],
        flags: OpFlags,
    ) -> Result<()> {
        let mut ctx = TreeCtx {
            cache,
            freelist,
            extkeys: &mut self.extkeys,
            comparator: self.comparator.as_ref(),
        };
        cursor.find(&mut ctx, &self.tree, self.root, key, flags)
    }

    pub fn cursor_move_next(&mut self, cache: &mut Cache, freelist: &mut Freelist, cursor: &mut Cursor) -> Result<()> {
        let mut ctx = TreeCtx {
            cache,
            freelist,
            extkeys: &mut self.extkeys,
            comparator: self.comparator.as_ref(),
        };
        cursor.move_next(&mut ctx, &self.tree, self.root)
    }

    pub fn cursor_move_prev(&mut self, cache: &mut Cache, freelist: &mut Freelist, cursor: &mut Cursor) -> Result<()> {
        let mut ctx = TreeCtx {
            cache,
            freelist,
            extkeys: &mut self.extkeys,
            comparator: self.comparator.as_ref(),
        };
        cursor.move_prev(&mut ctx, &self.tree, self.root)
    }

    pub fn cursor_current_key(&mut self, cache: &mut Cache, freelist: &mut Freelist, cursor: &mut Cursor) -> Result<Vec<u8>> {
        let mut ctx = TreeCtx {
            cache,
            freelist,
            extkeys: &mut self.extkeys,
            comparator: self.comparator.as_ref(),
        };
        cursor.current_key(&mut ctx, &self.tree)
    }

    /// Erases the record `cursor` currently points at. See
    /// `Cursor::erase` for the single-duplicate-vs-whole-key distinction.
    pub fn cursor_erase(&mut self, cache: &mut Cache, freelist: &mut Freelist, cursor: &mut Cursor) -> Result<()> {
        let mut ctx = TreeCtx {
            cache,
            freelist,
            extkeys: &mut self.extkeys,
            comparator: self.comparator.as_ref(),
        };
        self.root = cursor.erase(&mut ctx, &self.tree, self.root)?;
        self.stats.record_erase(0.0);
        Ok(())
    }

    /// Replaces the record `cursor` currently points at with `value`,
    /// without moving the cursor.
    pub fn cursor_overwrite(
        &mut self,
        cache: &mut Cache,
        freelist: &mut Freelist,
        cursor: &mut Cursor,
        value: &[u8],
    ) -> Result<()> {
        let (tag, tail) = allocate_record(cache, freelist, value)?;
        let mut ctx = TreeCtx {
            cache,
            freelist,
            extkeys: &mut self.extkeys,
            comparator: self.comparator.as_ref(),
        };
        cursor.overwrite(&mut ctx, &self.tree, self.root, tag, tail)
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InMemoryDevice;
    use crate::page::PageKind;
    use crate::wal::Log;
    use std::sync::Arc;

    fn new_db() -> (Cache, Freelist, Database) {
        let dev = Arc::new(InMemoryDevice::new());
        let mut cache = Cache::new(dev, Log::new_in_memory(), 1024, 256, false, false);
        let mut freelist = Freelist::new(None, 1024);
        let root = freelist.alloc_page(&mut cache).unwrap();
        cache.alloc_page(root, PageKind::BtreeRoot, false).unwrap();
        cache.unpin(root);
        let db = Database::new(1, 16, root, EnvFlags::ENABLE_DUPLICATES, false);
        (cache, freelist, db)
    }

    #[test]
    fn insert_then_find_round_trips_tiny_record() {
        let (mut cache, mut freelist, mut db) = new_db();
        db.insert(&mut cache, &mut freelist, b"a", &0x1234u64.to_le_bytes(), false, None).unwrap();
        let value = db.find(&mut cache, &mut freelist, b"a", OpFlags::empty(), None).unwrap();
        assert_eq!(value, 0x1234u64.to_le_bytes());
    }

    #[test]
    fn erase_then_find_reports_not_found() {
        let (mut cache, mut freelist, mut db) = new_db();
        db.insert(&mut cache, &mut freelist, b"a", b"v", false, None).unwrap();
        db.erase(&mut cache, &mut freelist, b"a", None).unwrap();
        let err = db.find(&mut cache, &mut freelist, b"a", OpFlags::empty(), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyNotFound);
    }

    #[test]
    fn transaction_conflict_then_commit_and_overwrite() {
        let (mut cache, mut freelist, mut db) = new_db();
        let t1 = db.begin(false).unwrap();
        let t2 = db.begin(false).unwrap();
        db.insert(&mut cache, &mut freelist, b"x", b"v1", false, Some(t1)).unwrap();
        let err = db.insert(&mut cache, &mut freelist, b"x", b"v2", false, Some(t2)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TxnConflict);

        db.commit(&mut cache, &mut freelist, t1).unwrap();
        db.insert(&mut cache, &mut freelist, b"x", b"v3", true, Some(t2)).unwrap();
        db.commit(&mut cache, &mut freelist, t2).unwrap();
        let value = db.find(&mut cache, &mut freelist, b"x", OpFlags::empty(), None).unwrap();
        assert_eq!(value, b"v3");
    }

    #[test]
    fn duplicate_ordering_matches_insert_positions() {
        let (mut cache, mut freelist, mut db) = new_db();
        db.insert(&mut cache, &mut freelist, b"d", b"A", false, None).unwrap();
        db.insert_duplicate(&mut cache, &mut freelist, b"d", b"B", InsertPosition::First, None).unwrap();
        db.insert_duplicate(&mut cache, &mut freelist, b"d", b"C", InsertPosition::Last, None).unwrap();

        let slot = {
            let mut ctx = TreeCtx {
                cache: &mut cache,
                freelist: &mut freelist,
                extkeys: &mut db.extkeys,
                comparator: db.comparator.as_ref(),
            };
            db.tree.find(&mut ctx, db.root, b"d", OpFlags::empty()).unwrap().2
        };
        assert!(slot.has_duplicates);
        let count = DuplicateTable::get_count(&mut cache, slot.tail_as_offset()).unwrap();
        assert_eq!(count, 3);
        let order: Vec<u8> = (0..3)
            .map(|i| DuplicateTable::get(&mut cache, slot.tail_as_offset(), i).unwrap())
            .map(|e| crate::blob::decode_inline(e.tag, e.rid.to_le_bytes())[0])
            .collect();
        assert_eq!(order, vec![b'B', b'A', b'C']);
    }

    #[test]
    fn partial_flag_is_rejected() {
        let (mut cache, mut freelist, mut db) = new_db();
        db.insert(&mut cache, &mut freelist, b"a", b"v", false, None).unwrap();
        let err = db.find(&mut cache, &mut freelist, b"a", OpFlags::PARTIAL, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvParameter);
    }

    #[test]
    fn insert_partial_patches_a_blob_record_in_place() {
        let (mut cache, mut freelist, mut db) = new_db();
        let original = b"0123456789abcdef";
        db.insert(&mut cache, &mut freelist, b"a", original, false, None).unwrap();

        db.insert_partial(&mut cache, &mut freelist, b"a", b"XYZ", 4, None).unwrap();

        let value = db.find(&mut cache, &mut freelist, b"a", OpFlags::empty(), None).unwrap();
        assert_eq!(value, b"0123XYZ89abcdef");
        let slice = db.find_partial(&mut cache, &mut freelist, b"a", 4, 3, None).unwrap();
        assert_eq!(slice, b"XYZ");
    }

    #[test]
    fn cursor_erase_removes_the_whole_key() {
        let (mut cache, mut freelist, mut db) = new_db();
        db.insert(&mut cache, &mut freelist, b"a", b"v", false, None).unwrap();
        let mut cursor = db.cursor_create(None).unwrap();
        db.cursor_find(&mut cache, &mut freelist, &mut cursor, b"a", OpFlags::empty()).unwrap();
        db.cursor_erase(&mut cache, &mut freelist, &mut cursor).unwrap();

        let err = db.find(&mut cache, &mut freelist, b"a", OpFlags::empty(), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyNotFound);
        let err = db.cursor_current_key(&mut cache, &mut freelist, &mut cursor).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CursorIsNil);
    }

    #[test]
    fn cursor_overwrite_replaces_value_without_moving() {
        let (mut cache, mut freelist, mut db) = new_db();
        db.insert(&mut cache, &mut freelist, b"a", b"v1", false, None).unwrap();
        let mut cursor = db.cursor_create(None).unwrap();
        db.cursor_find(&mut cache, &mut freelist, &mut cursor, b"a", OpFlags::empty()).unwrap();
        db.cursor_overwrite(&mut cache, &mut freelist, &mut cursor, b"v2-longer").unwrap();

        assert_eq!(db.cursor_current_key(&mut cache, &mut freelist, &mut cursor).unwrap(), b"a");
        let value = db.find(&mut cache, &mut freelist, b"a", OpFlags::empty(), None).unwrap();
        assert_eq!(value, b"v2-longer");
    }

    #[test]
    fn cursor_erase_on_one_duplicate_leaves_the_others() {
        let (mut cache, mut freelist, mut db) = new_db();
        db.insert(&mut cache, &mut freelist, b"d", b"A", false, None).unwrap();
        db.insert_duplicate(&mut cache, &mut freelist, b"d", b"B", InsertPosition::Last, None).unwrap();
        db.insert_duplicate(&mut cache, &mut freelist, b"d", b"C", InsertPosition::Last, None).unwrap();

        let mut cursor = db.cursor_create(None).unwrap();
        db.cursor_find(&mut cache, &mut freelist, &mut cursor, b"d", OpFlags::empty()).unwrap();
        {
            let mut ctx = TreeCtx {
                cache: &mut cache,
                freelist: &mut freelist,
                extkeys: &mut db.extkeys,
                comparator: db.comparator.as_ref(),
            };
            cursor.move_next_duplicate(&mut ctx, &db.tree, db.root, true, false).unwrap();
        }
        db.cursor_erase(&mut cache, &mut freelist, &mut cursor).unwrap();

        let slot = {
            let mut ctx = TreeCtx {
                cache: &mut cache,
                freelist: &mut freelist,
                extkeys: &mut db.extkeys,
                comparator: db.comparator.as_ref(),
            };
            db.tree.find(&mut ctx, db.root, b"d", OpFlags::empty()).unwrap().2
        };
        assert!(slot.has_duplicates);
        let count = DuplicateTable::get_count(&mut cache, slot.tail_as_offset()).unwrap();
        assert_eq!(count, 2);
        let order: Vec<u8> = (0..2)
            .map(|i| DuplicateTable::get(&mut cache, slot.tail_as_offset(), i).unwrap())
            .map(|e| crate::blob::decode_inline(e.tag, e.rid.to_le_bytes())[0])
            .collect();
        assert_eq!(order, vec![b'A', b'C']);
    }
}
