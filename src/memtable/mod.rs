//! In-memory sorted table backed by a concurrent skip list.
//!
//! The memtable is the first stop for every write and read. A
//! `crossbeam-skiplist` `SkipMap` gives lock-free concurrent readers,
//! ordered traversal for flushing, and O(log n) point lookups without any
//! external locking around individual operations.
//!
//! Lifecycle: a memtable is created empty and mutated only while it is the
//! manager's *active* table. On rotation it is frozen (read-only) and queued
//! for flushing; once its contents are durable in an SSTable and the WAL is
//! trimmed, it is dropped.

pub mod manager;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::entry::Entry;

#[derive(Debug, Clone)]
struct Versioned {
    timestamp: u64,
    value: Option<Vec<u8>>,
}

/// A sorted map from key to the latest entry for that key.
#[derive(Debug, Default)]
pub struct Memtable {
    data: SkipMap<Vec<u8>, Versioned>,
    entries: AtomicUsize,
    frozen: AtomicBool,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            entries: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    /// Applies a mutation. An entry older than the stored version for the
    /// same key is ignored, so replaying records in any order converges to
    /// the newest-wins state.
    ///
    /// Callers must not apply to a frozen memtable; the manager's rotation
    /// lock guarantees this on the write path.
    pub fn apply(&self, entry: Entry) {
        debug_assert!(!self.is_frozen(), "write to frozen memtable");

        if let Some(existing) = self.data.get(&entry.key) {
            if existing.value().timestamp >= entry.timestamp {
                return;
            }
        } else {
            self.entries.fetch_add(1, Ordering::SeqCst);
        }

        self.data.insert(
            entry.key,
            Versioned {
                timestamp: entry.timestamp,
                value: entry.value,
            },
        );
    }

    /// Point lookup. Tombstones are returned so the caller can distinguish
    /// "deleted" from "not present".
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.data.get(key).map(|item| Entry {
            key: item.key().clone(),
            value: item.value().value.clone(),
            timestamp: item.value().timestamp,
        })
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the memtable read-only.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// All entries in key order, ready for an SSTable writer.
    pub fn entries_sorted(&self) -> Vec<Entry> {
        self.data
            .iter()
            .map(|item| Entry {
                key: item.key().clone(),
                value: item.value().value.clone(),
                timestamp: item.value().timestamp,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_and_get() {
        let memtable = Memtable::new();
        memtable.apply(Entry::put(b"k1".to_vec(), b"v1".to_vec(), 1));
        memtable.apply(Entry::put(b"k2".to_vec(), b"v2".to_vec(), 2));

        assert_eq!(memtable.get(b"k1").unwrap().value, Some(b"v1".to_vec()));
        assert_eq!(memtable.get(b"k2").unwrap().value, Some(b"v2".to_vec()));
        assert!(memtable.get(b"k3").is_none());
        assert_eq!(memtable.len(), 2);
    }

    #[test]
    fn test_newer_timestamp_wins() {
        let memtable = Memtable::new();
        memtable.apply(Entry::put(b"k".to_vec(), b"old".to_vec(), 1));
        memtable.apply(Entry::put(b"k".to_vec(), b"new".to_vec(), 2));
        assert_eq!(memtable.get(b"k").unwrap().value, Some(b"new".to_vec()));

        // A stale entry never overwrites a newer one.
        memtable.apply(Entry::put(b"k".to_vec(), b"stale".to_vec(), 1));
        assert_eq!(memtable.get(b"k").unwrap().value, Some(b"new".to_vec()));
        assert_eq!(memtable.len(), 1);
    }

    #[test]
    fn test_tombstone_retained() {
        let memtable = Memtable::new();
        memtable.apply(Entry::put(b"k".to_vec(), b"v".to_vec(), 1));
        memtable.apply(Entry::tombstone(b"k".to_vec(), 2));

        let entry = memtable.get(b"k").expect("Tombstone should be present");
        assert!(entry.is_tombstone());
        assert_eq!(memtable.len(), 1);
    }

    #[test]
    fn test_entries_sorted_by_key() {
        let memtable = Memtable::new();
        memtable.apply(Entry::put(b"c".to_vec(), b"3".to_vec(), 1));
        memtable.apply(Entry::put(b"a".to_vec(), b"1".to_vec(), 2));
        memtable.apply(Entry::put(b"b".to_vec(), b"2".to_vec(), 3));

        let keys: Vec<Vec<u8>> = memtable
            .entries_sorted()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_freeze_flag() {
        let memtable = Memtable::new();
        assert!(!memtable.is_frozen());
        memtable.freeze();
        assert!(memtable.is_frozen());
    }
}
