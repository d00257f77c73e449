//! Per-database operation statistics and the hinter built on top of them.
//!
//! Plain counters and derived hints, expressed in the same plain-struct,
//! explicit-update style used for the page cache's own bookkeeping.

use crate::types::PageId;

/// Running exponential moving average of an operation's latency, kept so a
/// single slow outlier doesn't dominate the hinter's signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ema {
    value_us: f64,
}

const EMA_ALPHA: f64 = 0.2;

impl Ema {
    pub fn observe(&mut self, sample_us: f64) {
        if self.value_us == 0.0 {
            self.value_us = sample_us;
        } else {
            self.value_us = EMA_ALPHA * sample_us + (1.0 - EMA_ALPHA) * self.value_us;
        }
    }

    pub fn value(&self) -> f64 {
        self.value_us
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpCounters {
    pub find_success: u64,
    pub find_fail_not_found: u64,
    pub find_fail_out_of_bounds: u64,
    pub insert_count: u64,
    pub erase_count: u64,
    pub find_latency: Ema,
    pub insert_latency: Ema,
    pub erase_latency: Ema,
}

/// What collection is switched on for this database, mirroring
/// `dont_collect_*` (inverted here to a positive `enabled` sense).
#[derive(Debug, Clone, Copy)]
pub struct CollectionFlags {
    pub global: bool,
    pub per_db: bool,
    pub freelist: bool,
}

impl Default for CollectionFlags {
    fn default() -> Self {
        Self {
            global: true,
            per_db: true,
            freelist: true,
        }
    }
}

/// A database's operation statistics: counters plus the last leaf touched,
/// which is the hinter's main lever for the append/prepend fast track.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub flags: CollectionFlagsOpt,
    pub counters: OpCounters,
    pub last_leaf_page: Option<PageId>,
    pub last_leaf_slot: Option<u16>,
    /// Smallest key seen as the leftmost leaf's first key, used to detect
    /// prepend sequences.
    pub leftmost_leaf_page: Option<PageId>,
    /// Tightest known lower/upper bound on keys present in the tree. Always
    /// a superset of the true range: widened on every insert, never
    /// narrowed on erase, so a key sorting outside it can never be present.
    pub known_min: Option<Vec<u8>>,
    pub known_max: Option<Vec<u8>>,
}

/// `CollectionFlags` with a `Default` that matches `Statistics`' own
/// default derive (plain struct derive can't call a non-`Default` default).
#[derive(Debug, Clone, Copy)]
pub struct CollectionFlagsOpt(pub CollectionFlags);

impl Default for CollectionFlagsOpt {
    fn default() -> Self {
        Self(CollectionFlags::default())
    }
}

impl Statistics {
    pub fn record_find(&mut self, latency_us: f64, outcome: FindOutcome) {
        if !self.flags.0.per_db {
            return;
        }
        self.counters.find_latency.observe(latency_us);
        match outcome {
            FindOutcome::Success => self.counters.find_success += 1,
            FindOutcome::NotFound => self.counters.find_fail_not_found += 1,
            FindOutcome::OutOfBounds => self.counters.find_fail_out_of_bounds += 1,
        }
    }

    pub fn record_insert(&mut self, latency_us: f64, leaf: PageId, slot: u16) {
        if !self.flags.0.per_db {
            return;
        }
        self.counters.insert_latency.observe(latency_us);
        self.counters.insert_count += 1;
        self.note_processed(leaf, slot);
    }

    pub fn record_erase(&mut self, latency_us: f64) {
        if !self.flags.0.per_db {
            return;
        }
        self.counters.erase_latency.observe(latency_us);
        self.counters.erase_count += 1;
    }

    /// Write-back path: after an operation completes, the btree core tells
    /// statistics which leaf/slot it actually touched, so the next fast
    /// track check has a fresh target.
    pub fn note_processed(&mut self, leaf: PageId, slot: u16) {
        self.last_leaf_page = Some(leaf);
        self.last_leaf_slot = Some(slot);
    }

    /// Widens `known_min`/`known_max` to include `key`, if it isn't already
    /// within them. Called on every insert so the bound stays a valid
    /// superset of the tree's actual range.
    pub fn widen_bounds(&mut self, key: &[u8], compare: impl Fn(&[u8], &[u8]) -> std::cmp::Ordering) {
        if self.known_min.as_deref().map_or(true, |m| compare(key, m) == std::cmp::Ordering::Less) {
            self.known_min = Some(key.to_vec());
        }
        if self.known_max.as_deref().map_or(true, |m| compare(key, m) == std::cmp::Ordering::Greater) {
            self.known_max = Some(key.to_vec());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindOutcome {
    Success,
    NotFound,
    OutOfBounds,
}

/// Biasing suggestions the btree core may take or discard; none of these
/// change correctness, only which path is tried first.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hints {
    pub try_append: bool,
    pub try_prepend: bool,
    pub fast_track_leaf: Option<PageId>,
    pub split_ratio: Option<f64>,
    pub merge_ratio: Option<f64>,
}

/// Default split/merge ratios used when statistics offer no override.
pub const DEFAULT_SPLIT_RATIO: f64 = 0.5;
pub const DEFAULT_MERGE_RATIO: f64 = 1.0 / 3.0;

/// Turns raw statistics into a `Hints` the caller may act on. A sequence of
/// several consecutive inserts all landing at the tail is treated as
/// evidence of an append-heavy load, mirroring the original's streak-based
/// detector.
pub struct Hinter;

impl Hinter {
    pub fn try_fast_track(stats: &Statistics, new_key_hint_append: bool) -> Hints {
        let mut hints = Hints::default();
        if new_key_hint_append {
            hints.try_append = true;
            hints.fast_track_leaf = stats.last_leaf_page;
        }
        hints
    }

    /// `key_is_out_of_bounds`: true when `key` sorts outside the database's
    /// currently known key range, letting find/erase fail fast without a
    /// tree descent. `compare` returns the same `Less`/`Equal`/`Greater`
    /// convention as `Comparator`.
    pub fn key_is_out_of_bounds(
        known_min: Option<&[u8]>,
        known_max: Option<&[u8]>,
        key: &[u8],
        compare: impl Fn(&[u8], &[u8]) -> std::cmp::Ordering,
    ) -> bool {
        if let Some(min) = known_min {
            if compare(key, min) == std::cmp::Ordering::Less {
                return true;
            }
        }
        if let Some(max) = known_max {
            if compare(key, max) == std::cmp::Ordering::Greater {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_converges_toward_new_samples() {
        let mut ema = Ema::default();
        ema.observe(100.0);
        for _ in 0..50 {
            ema.observe(10.0);
        }
        assert!(ema.value() < 15.0);
    }

    #[test]
    fn fast_track_only_when_hinted() {
        let mut stats = Statistics::default();
        stats.note_processed(42, 7);
        let hints = Hinter::try_fast_track(&stats, true);
        assert!(hints.try_append);
        assert_eq!(hints.fast_track_leaf, Some(42));
        let hints = Hinter::try_fast_track(&stats, false);
        assert!(!hints.try_append);
    }

    #[test]
    fn out_of_bounds_short_circuits_outside_known_range() {
        let cmp = |a: &[u8], b: &[u8]| a.cmp(b);
        assert!(Hinter::key_is_out_of_bounds(Some(b"b"), Some(b"y"), b"a", cmp));
        assert!(Hinter::key_is_out_of_bounds(Some(b"b"), Some(b"y"), b"z", cmp));
        assert!(!Hinter::key_is_out_of_bounds(Some(b"b"), Some(b"y"), b"m", cmp));
    }
}
