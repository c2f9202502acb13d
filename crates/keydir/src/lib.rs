//! # KeyDir - in-memory key index
//!
//! Maps every key to the [`Location`] of its most recent record. The engine
//! itself only deals in locations; this crate is the reference index a caller
//! builds from recovery output and keeps current from `put`/`delete` results.
//!
//! The compactor consumes it through the [`LiveIndex`] trait: it asks whether
//! a footer entry is still the one the index points at, and hands back the
//! relocations for records it rewrote.
//!
//! A record the caller has not applied yet looks dead to the compactor. The
//! index therefore also tracks an applied watermark: the highest sequence
//! number up to which every write has been applied. Segments holding a
//! record above it are left alone.

use parking_lot::{Mutex, RwLock};
use record::is_tombstone;
use segment::Location;
use std::collections::{BTreeSet, HashMap};

/// What the compactor needs from an authoritative key index.
pub trait LiveIndex: Send + Sync {
    /// Returns `true` if `key` currently resolves to exactly `location`.
    fn is_live(&self, key: &[u8], location: Location) -> bool;

    /// Highest `s` such that every write with a sequence number `<= s` has
    /// been applied. Only segments whose records all fall at or below it are
    /// compacted.
    fn applied_seq(&self) -> u64;

    /// Repoints keys at their rewritten records.
    ///
    /// Each relocation applies only if the key still points at `from`; a key
    /// overwritten since the compactor read it keeps its newer location. All
    /// relocations become visible together with respect to concurrent
    /// readers. Returns how many were applied.
    fn apply_relocations(&self, relocations: &[Relocation]) -> usize;
}

/// A record the compactor copied from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub key: Vec<u8>,
    pub from: Location,
    pub to: Location,
}

/// The index value for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEntry {
    pub location: Location,
    pub seq: u64,
    pub flags: u16,
}

impl KeyEntry {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        is_tombstone(self.flags)
    }
}

/// Thread-safe key → [`KeyEntry`] map where the highest sequence number wins.
///
/// Tombstones are kept as entries so that an older put replayed later cannot
/// resurrect a deleted key.
#[derive(Debug, Default)]
pub struct KeyDir {
    map: RwLock<HashMap<Vec<u8>, KeyEntry>>,
    watermark: Mutex<Watermark>,
}

/// Contiguous prefix of applied sequence numbers, plus the ones seen past a
/// gap.
#[derive(Debug, Default)]
struct Watermark {
    through: u64,
    pending: BTreeSet<u64>,
}

impl Watermark {
    fn acknowledge(&mut self, seq: u64) {
        if seq <= self.through {
            return;
        }
        if seq > self.through.saturating_add(1) {
            self.pending.insert(seq);
            return;
        }
        self.through = seq;
        while self.pending.remove(&self.through.saturating_add(1)) {
            self.through += 1;
        }
    }

    fn advance_to(&mut self, seq: u64) {
        if seq <= self.through {
            return;
        }
        self.through = seq;
        self.pending = self.pending.split_off(&seq.saturating_add(1));
        while self.pending.remove(&self.through.saturating_add(1)) {
            self.through += 1;
        }
    }
}

impl KeyDir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index from `(key, location, flags, seq)` tuples in any order.
    ///
    /// The entries are taken as the complete log up to their highest
    /// sequence number, which becomes the applied watermark.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Vec<u8>, Location, u16, u64)>,
    {
        let dir = Self::new();
        let mut max_seq = 0;
        {
            let mut map = dir.map.write();
            for (key, location, flags, seq) in entries {
                max_seq = max_seq.max(seq);
                Self::apply_locked(&mut map, key, KeyEntry { location, seq, flags });
            }
        }
        dir.watermark.lock().advance_to(max_seq);
        dir
    }

    /// Records a write. Ignored if the key already has an entry with an equal
    /// or higher sequence number. Returns whether the entry was taken.
    ///
    /// Either way `seq` counts as applied for the watermark.
    pub fn apply(&self, key: Vec<u8>, location: Location, seq: u64, flags: u16) -> bool {
        let taken = {
            let mut map = self.map.write();
            Self::apply_locked(&mut map, key, KeyEntry { location, seq, flags })
        };
        self.watermark.lock().acknowledge(seq);
        taken
    }

    /// Declares every write up to `seq` applied, for callers that fill the
    /// index from a source with gaps in its sequence numbers.
    pub fn acknowledge_through(&self, seq: u64) {
        self.watermark.lock().advance_to(seq);
    }

    fn apply_locked(map: &mut HashMap<Vec<u8>, KeyEntry>, key: Vec<u8>, entry: KeyEntry) -> bool {
        match map.get(&key) {
            Some(old) if old.seq >= entry.seq => false,
            _ => {
                map.insert(key, entry);
                true
            }
        }
    }

    /// The latest entry for `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Option<KeyEntry> {
        self.map.read().get(key).copied()
    }

    /// Where the current value of `key` lives, or `None` if the key is
    /// unknown or deleted.
    pub fn live_location(&self, key: &[u8]) -> Option<Location> {
        self.get(key)
            .filter(|e| !e.is_tombstone())
            .map(|e| e.location)
    }

    /// Number of keys, tombstones included.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Snapshot of all `(key, entry)` pairs. Order is unspecified.
    pub fn snapshot(&self) -> Vec<(Vec<u8>, KeyEntry)> {
        self.map
            .read()
            .iter()
            .map(|(k, e)| (k.clone(), *e))
            .collect()
    }
}

impl LiveIndex for KeyDir {
    fn is_live(&self, key: &[u8], location: Location) -> bool {
        self.map
            .read()
            .get(key)
            .is_some_and(|e| e.location == location)
    }

    fn applied_seq(&self) -> u64 {
        self.watermark.lock().through
    }

    fn apply_relocations(&self, relocations: &[Relocation]) -> usize {
        let mut map = self.map.write();
        let mut applied = 0;
        for r in relocations {
            if let Some(entry) = map.get_mut(r.key.as_slice()) {
                if entry.location == r.from {
                    entry.location = r.to;
                    applied += 1;
                }
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use record::FLAG_TOMBSTONE;

    fn loc(segment_id: u64, offset: u32) -> Location {
        Location::new(segment_id, offset)
    }

    #[test]
    fn highest_seq_wins() {
        let kd = KeyDir::new();
        assert!(kd.apply(b"k".to_vec(), loc(0, 0), 1, 0));
        assert!(kd.apply(b"k".to_vec(), loc(0, 30), 5, 0));

        // older and equal seq ignored
        assert!(!kd.apply(b"k".to_vec(), loc(1, 0), 3, 0));
        assert!(!kd.apply(b"k".to_vec(), loc(1, 0), 5, 0));

        assert_eq!(kd.live_location(b"k"), Some(loc(0, 30)));
        assert_eq!(kd.len(), 1);
    }

    #[test]
    fn tombstone_hides_key_but_is_retained() {
        let kd = KeyDir::new();
        kd.apply(b"k".to_vec(), loc(0, 0), 1, 0);
        kd.apply(b"k".to_vec(), loc(0, 22), 2, FLAG_TOMBSTONE);

        assert_eq!(kd.live_location(b"k"), None);
        let e = kd.get(b"k").unwrap();
        assert!(e.is_tombstone());
        assert_eq!(kd.len(), 1);

        // a replayed older put cannot resurrect it
        kd.apply(b"k".to_vec(), loc(0, 0), 1, 0);
        assert_eq!(kd.live_location(b"k"), None);
    }

    #[test]
    fn from_entries_is_order_independent() {
        let forward: Vec<(Vec<u8>, Location, u16, u64)> = vec![
            (b"a".to_vec(), loc(0, 0), 0, 1),
            (b"a".to_vec(), loc(1, 0), 0, 4),
            (b"b".to_vec(), loc(0, 22), 0, 2),
            (b"b".to_vec(), loc(1, 22), FLAG_TOMBSTONE, 5),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        for entries in [forward, backward] {
            let kd = KeyDir::from_entries(entries);
            assert_eq!(kd.live_location(b"a"), Some(loc(1, 0)));
            assert_eq!(kd.live_location(b"b"), None);
        }
    }

    #[test]
    fn is_live_compares_exact_location() {
        let kd = KeyDir::new();
        kd.apply(b"k".to_vec(), loc(2, 44), 1, 0);

        assert!(kd.is_live(b"k", loc(2, 44)));
        assert!(!kd.is_live(b"k", loc(2, 0)));
        assert!(!kd.is_live(b"missing", loc(2, 44)));
    }

    #[test]
    fn relocations_only_apply_to_unchanged_keys() {
        let kd = KeyDir::new();
        kd.apply(b"a".to_vec(), loc(0, 0), 1, 0);
        kd.apply(b"b".to_vec(), loc(0, 22), 2, 0);
        // b overwritten after the compactor read it
        kd.apply(b"b".to_vec(), loc(5, 0), 9, 0);

        let applied = kd.apply_relocations(&[
            Relocation {
                key: b"a".to_vec(),
                from: loc(0, 0),
                to: loc(7, 0),
            },
            Relocation {
                key: b"b".to_vec(),
                from: loc(0, 22),
                to: loc(7, 22),
            },
        ]);

        assert_eq!(applied, 1);
        assert_eq!(kd.live_location(b"a"), Some(loc(7, 0)));
        assert_eq!(kd.live_location(b"b"), Some(loc(5, 0)));
        // seq is untouched by relocation
        assert_eq!(kd.get(b"a").unwrap().seq, 1);
    }

    #[test]
    fn watermark_stops_at_first_gap() {
        let kd = KeyDir::new();
        kd.apply(b"a".to_vec(), loc(0, 0), 1, 0);
        kd.apply(b"c".to_vec(), loc(0, 44), 3, 0);
        kd.apply(b"d".to_vec(), loc(0, 66), 4, 0);
        assert_eq!(kd.applied_seq(), 1);

        // filling the gap releases everything queued behind it
        kd.apply(b"b".to_vec(), loc(0, 22), 2, 0);
        assert_eq!(kd.applied_seq(), 4);
    }

    #[test]
    fn rejected_apply_still_advances_watermark() {
        let kd = KeyDir::new();
        kd.apply(b"k".to_vec(), loc(0, 22), 2, 0);
        assert!(!kd.apply(b"k".to_vec(), loc(0, 0), 1, 0));
        assert_eq!(kd.applied_seq(), 2);
    }

    #[test]
    fn from_entries_covers_gaps_left_by_compaction() {
        let kd = KeyDir::from_entries(vec![
            (b"a".to_vec(), loc(3, 0), 0, 2),
            (b"b".to_vec(), loc(3, 22), 0, 7),
        ]);
        assert_eq!(kd.applied_seq(), 7);

        kd.apply(b"c".to_vec(), loc(4, 0), 8, 0);
        assert_eq!(kd.applied_seq(), 8);
    }

    #[test]
    fn acknowledge_through_skips_the_gap() {
        let kd = KeyDir::new();
        kd.apply(b"a".to_vec(), loc(0, 0), 5, 0);
        kd.apply(b"b".to_vec(), loc(0, 22), 7, 0);
        assert_eq!(kd.applied_seq(), 0);

        kd.acknowledge_through(5);
        assert_eq!(kd.applied_seq(), 5);
        kd.apply(b"c".to_vec(), loc(0, 44), 6, 0);
        assert_eq!(kd.applied_seq(), 7);
    }
}
