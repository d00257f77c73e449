//! Transaction manager: per-transaction op lists, the per-key overlay tree,
//! first-committer-wins conflict detection, and commit/abort.
//!
//! A commit seals with a log entry and then becomes visible. The overlay
//! itself is an in-memory ordered map from key to a newest-first op chain
//! (per-database `BTreeMap<Vec<u8>, Vec<Op>>`, walked newest-to-oldest for
//! conflict checks).

use std::collections::BTreeMap;

use crate::blob::{BlobStore, InsertPosition, RecordTag};
use crate::btree::{BTree, TreeCtx};
use crate::cache::Cache;
use crate::database::Database;
use crate::error::{Error, ErrorCode, Result};
use crate::extkey::ExtendedKeyCache;
use crate::freelist::Freelist;
use crate::types::{Comparator, Lsn, PageId, TxnId};
use crate::wal::Log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    InsertOverwrite,
    InsertDuplicate,
    Erase,
    Nop,
}

#[derive(Debug, Clone)]
pub struct Op {
    pub txn: TxnId,
    pub kind: OpKind,
    pub lsn: Lsn,
    /// For insert ops: the already-allocated record tag/tail (large records
    /// are blob-allocated eagerly so the overlay only ever holds a rid).
    pub record_tag: RecordTag,
    pub record_tail: [u8; crate::btree::node::RID_SIZE],
    /// Meaningful only for `InsertDuplicate`: the position requested at the
    /// original `insert_duplicate` call, replayed unchanged at commit.
    pub dup_pos: InsertPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

pub struct Transaction {
    pub id: TxnId,
    pub state: TxnState,
    pub read_only: bool,
    pub cursors_attached: u32,
}

impl Transaction {
    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }
}

/// Per-database overlay: ordered by key (same comparator as the tree), each
/// entry holding its ops newest-first.
#[derive(Default)]
pub struct Overlay {
    entries: BTreeMap<Vec<u8>, Vec<Op>>,
}

impl Overlay {
    fn chain_mut(&mut self, key: &[u8]) -> &mut Vec<Op> {
        self.entries.entry(key.to_vec()).or_default()
    }

    fn chain(&self, key: &[u8]) -> Option<&Vec<Op>> {
        self.entries.get(key)
    }

    fn push_front(&mut self, key: &[u8], op: Op) {
        self.chain_mut(key).insert(0, op);
    }

    /// Drops every op belonging to `txn` — used by abort.
    fn discard_txn(&mut self, txn: TxnId) {
        self.entries.retain(|_, ops| {
            ops.retain(|o| o.txn != txn);
            !ops.is_empty()
        });
    }
}

pub struct TransactionManager {
    next_id: TxnId,
    next_lsn: Lsn,
    /// Process-wide list of live transactions, oldest first (the order
    /// `commit` needs to decide whether this txn is the oldest).
    txns: Vec<Transaction>,
    overlay: Overlay,
    max_active: usize,
}

impl TransactionManager {
    pub fn new(max_active: usize) -> Self {
        Self {
            next_id: 1,
            next_lsn: 1,
            txns: Vec::new(),
            overlay: Overlay::default(),
            max_active,
        }
    }

    pub fn begin(&mut self, read_only: bool) -> Result<TxnId> {
        if self.txns.iter().filter(|t| t.is_active()).count() >= self.max_active {
            return Err(Error::new(ErrorCode::LimitsReached));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.txns.push(Transaction {
            id,
            state: TxnState::Active,
            read_only,
            cursors_attached: 0,
        });
        Ok(id)
    }

    fn find_txn_mut(&mut self, id: TxnId) -> Result<&mut Transaction> {
        self.txns
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::new(ErrorCode::InvParameter))
    }

    fn next_lsn(&mut self) -> Lsn {
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        lsn
    }

    /// Conflict check + op recording for an insert. `overwrite`/`as_duplicate`
    /// select which op kind is recorded once the conflict walk clears.
    pub fn insert(
        &mut self,
        txn: TxnId,
        key: &[u8],
        record_tag: RecordTag,
        record_tail: [u8; crate::btree::node::RID_SIZE],
        overwrite: bool,
        as_duplicate: bool,
        key_exists_in_tree: bool,
        dup_pos: InsertPosition,
    ) -> Result<()> {
        self.check_conflict(txn, key)?;
        if key_exists_in_tree && !overwrite && !as_duplicate && !self.has_own_insert(txn, key) {
            return Err(Error::new(ErrorCode::DuplicateKey));
        }
        let lsn = self.next_lsn();
        let kind = if as_duplicate {
            OpKind::InsertDuplicate
        } else if overwrite {
            OpKind::InsertOverwrite
        } else {
            OpKind::Insert
        };
        self.overlay.push_front(key, Op { txn, kind, lsn, record_tag, record_tail, dup_pos });
        Ok(())
    }

    pub fn erase(&mut self, txn: TxnId, key: &[u8]) -> Result<()> {
        self.check_conflict(txn, key)?;
        let lsn = self.next_lsn();
        self.overlay.push_front(
            key,
            Op {
                txn,
                kind: OpKind::Erase,
                lsn,
                record_tag: RecordTag::Empty,
                record_tail: [0; 8],
                dup_pos: InsertPosition::Last,
            },
        );
        Ok(())
    }

    fn has_own_insert(&self, txn: TxnId, key: &[u8]) -> bool {
        self.overlay
            .chain(key)
            .map(|ops| {
                ops.iter()
                    .any(|o| o.txn == txn && matches!(o.kind, OpKind::Insert | OpKind::InsertOverwrite))
            })
            .unwrap_or(false)
    }

    /// First-committer-wins: walk newest-to-oldest, skipping ops of aborted
    /// txns; the first op belonging to a different *uncommitted* txn is a
    /// conflict.
    fn check_conflict(&self, txn: TxnId, key: &[u8]) -> Result<()> {
        let Some(ops) = self.overlay.chain(key) else {
            return Ok(());
        };
        for op in ops {
            if op.txn == txn {
                continue;
            }
            let other = self.txns.iter().find(|t| t.id == op.txn);
            match other.map(|t| t.state) {
                Some(TxnState::Aborted) | None => continue,
                Some(TxnState::Committed) => continue,
                Some(TxnState::Active) => return Err(Error::new(ErrorCode::TxnConflict)),
            }
        }
        Ok(())
    }

    /// Overlay-aware lookup: returns the most recent visible op for `key`
    /// as seen by `txn` (its own uncommitted ops plus all committed ones),
    /// or `None` if the overlay has nothing to say (fall through to the
    /// B+-tree).
    pub fn overlay_lookup(&self, txn: TxnId, key: &[u8]) -> Option<&Op> {
        let ops = self.overlay.chain(key)?;
        ops.iter().find(|o| {
            o.txn == txn
                || self
                    .txns
                    .iter()
                    .any(|t| t.id == o.txn && t.state == TxnState::Committed)
        })
    }

    /// Aborts `txn`. Per the resolved open question on blob reclamation,
    /// any blob this transaction allocated for an out-of-line record is
    /// freed rather than leaked.
    pub fn abort(&mut self, txn: TxnId, cache: &mut Cache, freelist: &mut Freelist) -> Result<()> {
        let t = self.find_txn_mut(txn)?;
        if t.cursors_attached > 0 {
            return Err(Error::new(ErrorCode::CursorStillOpen));
        }
        t.state = TxnState::Aborted;
        for ops in self.overlay.entries.values() {
            for op in ops.iter().filter(|o| o.txn == txn) {
                reclaim_aborted_insert(cache, freelist, op)?;
            }
        }
        self.overlay.discard_txn(txn);
        Ok(())
    }

    /// Commits `txn` and, if it is now the oldest active-or-committed txn,
    /// replays its (and any subsequent contiguous committed txns') ops into
    /// the tree, returning the possibly-updated root.
    /// `cache` owns the WAL (`cache.wal`); there is no separate log handle to
    /// thread through, since every durability point a commit needs to touch
    /// (the commit marker, after-images) lives on the same cache the tree
    /// replay below also mutates.
    #[allow(clippy::too_many_arguments)]
    pub fn commit(
        &mut self,
        txn: TxnId,
        tree: &BTree,
        cache: &mut Cache,
        freelist: &mut Freelist,
        extkeys: &mut ExtendedKeyCache,
        comparator: &dyn Comparator,
        root: PageId,
    ) -> Result<PageId> {
        {
            let t = self.find_txn_mut(txn)?;
            if t.cursors_attached > 0 {
                return Err(Error::new(ErrorCode::CursorStillOpen));
            }
        }
        cache.wal.log_commit(txn)?;
        {
            let t = self.find_txn_mut(txn)?;
            t.state = TxnState::Committed;
        }
        self.flush_committed_txns(tree, cache, freelist, extkeys, comparator, root)
    }

    /// Replays every committed txn's ops into the B+-tree and retires them
    /// from the overlay, oldest-commit-first. Exposed separately from
    /// `commit` so recovery and an explicit `Environment::flush` can invoke
    /// replay without going through a fresh commit.
    #[allow(clippy::too_many_arguments)]
    pub fn flush_committed_txns(
        &mut self,
        tree: &BTree,
        cache: &mut Cache,
        freelist: &mut Freelist,
        extkeys: &mut ExtendedKeyCache,
        comparator: &dyn Comparator,
        mut root: PageId,
    ) -> Result<PageId> {
        let mut replay: Vec<(Vec<u8>, Op)> = Vec::new();
        for (key, ops) in self.overlay.entries.iter() {
            for op in ops.iter().rev() {
                if self.txns.iter().any(|t| t.id == op.txn && t.state == TxnState::Committed) {
                    replay.push((key.clone(), op.clone()));
                }
            }
        }
        replay.sort_by_key(|(_, op)| op.lsn);

        for (key, op) in &replay {
            let mut ctx = TreeCtx {
                cache: &mut *cache,
                freelist: &mut *freelist,
                extkeys: &mut *extkeys,
                comparator,
            };
            root = match op.kind {
                OpKind::Insert => tree.insert(&mut ctx, root, key, op.record_tag, op.record_tail, false)?,
                OpKind::InsertOverwrite => tree.insert(&mut ctx, root, key, op.record_tag, op.record_tail, true)?,
                OpKind::InsertDuplicate => {
                    Database::insert_duplicate_into_tree(tree, &mut ctx, root, key, op.record_tag, op.record_tail, op.dup_pos)?;
                    root
                }
                OpKind::Erase => match tree.erase(&mut ctx, root, key) {
                    Ok(r) => r,
                    Err(e) if e.code() == ErrorCode::KeyNotFound => root,
                    Err(e) => return Err(e),
                },
                OpKind::Nop => root,
            };
        }

        if !replay.is_empty() {
            for offset in cache.dirty_offsets() {
                cache.log_after_image(offset)?;
            }
        }

        let committed_ids: Vec<TxnId> = self
            .txns
            .iter()
            .filter(|t| t.state == TxnState::Committed)
            .map(|t| t.id)
            .collect();
        for id in &committed_ids {
            self.overlay.discard_txn(*id);
        }
        self.txns.retain(|t| t.state == TxnState::Active);
        Ok(root)
    }

    pub fn attach_cursor(&mut self, txn: TxnId) -> Result<()> {
        self.find_txn_mut(txn)?.cursors_attached += 1;
        Ok(())
    }

    pub fn detach_cursor(&mut self, txn: TxnId) -> Result<()> {
        let t = self.find_txn_mut(txn)?;
        t.cursors_attached = t.cursors_attached.saturating_sub(1);
        Ok(())
    }

    pub fn state(&self, txn: TxnId) -> Option<TxnState> {
        self.txns.iter().find(|t| t.id == txn).map(|t| t.state)
    }
}

/// Frees the blob backing a large insert's record if the enclosing
/// transaction aborts, so an aborted transaction leaves no trace on disk.
pub fn reclaim_aborted_insert(cache: &mut Cache, freelist: &mut Freelist, op: &Op) -> Result<()> {
    if matches!(op.record_tag, RecordTag::Blob) {
        let offset = u64::from_le_bytes(op.record_tail);
        BlobStore::free(cache, freelist, offset)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_writer_conflicts_until_first_commits() {
        let mut mgr = TransactionManager::new(16);
        let t1 = mgr.begin(false).unwrap();
        let t2 = mgr.begin(false).unwrap();
        mgr.insert(t1, b"x", RecordTag::Small, [0; 8], false, false, false, InsertPosition::Last).unwrap();
        let err = mgr.insert(t2, b"x", RecordTag::Small, [0; 8], false, false, false, InsertPosition::Last).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TxnConflict);

        mgr.find_txn_mut(t1).unwrap().state = TxnState::Committed;
        mgr.insert(t2, b"x", RecordTag::Small, [1; 8], true, false, true, InsertPosition::Last).unwrap();
    }

    #[test]
    fn abort_discards_ops_without_conflict() {
        let dev = std::sync::Arc::new(crate::device::InMemoryDevice::new());
        let mut cache = Cache::new(dev, Log::new_in_memory(), 256, 16, false, false);
        let mut freelist = Freelist::new(None, 256);
        let mut mgr = TransactionManager::new(16);
        let t1 = mgr.begin(false).unwrap();
        mgr.insert(t1, b"x", RecordTag::Small, [0; 8], false, false, false, InsertPosition::Last).unwrap();
        mgr.abort(t1, &mut cache, &mut freelist).unwrap();
        let t2 = mgr.begin(false).unwrap();
        mgr.insert(t2, b"x", RecordTag::Small, [1; 8], false, false, false, InsertPosition::Last).unwrap();
    }
}
