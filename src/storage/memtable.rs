//! In-memory sorted buffer of recent writes. Backed by a lock-free skip
//! list so readers never block the writer. A mapped value of `None` is a
//! tombstone shadowing any older version of the key in the sorted tables.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_skiplist::SkipMap;

/// Fixed per-entry accounting overhead in bytes.
const ENTRY_OVERHEAD: u64 = 8;

pub struct MemTable {
    map: SkipMap<Vec<u8>, Option<Vec<u8>>>,
    size: AtomicU64,
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MemTable {
    pub fn new() -> Self {
        MemTable {
            map: SkipMap::new(),
            size: AtomicU64::new(0),
        }
    }

    /// Insert or replace. Replacements adjust the size estimate by the value
    /// delta; new entries account key, value and fixed overhead.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        self.insert(key, Some(value));
    }

    /// Record a deletion as a tombstone entry.
    pub fn delete(&self, key: Vec<u8>) {
        self.insert(key, None);
    }

    fn insert(&self, key: Vec<u8>, value: Option<Vec<u8>>) {
        let new_val_size = value.as_ref().map_or(0, |v| v.len() as u64);

        if let Some(existing) = self.map.get(&key) {
            let old_val_size = existing.value().as_ref().map_or(0, |v| v.len() as u64);
            if new_val_size >= old_val_size {
                self.size.fetch_add(new_val_size - old_val_size, Ordering::SeqCst);
            } else {
                self.size.fetch_sub(old_val_size - new_val_size, Ordering::SeqCst);
            }
        } else {
            self.size
                .fetch_add(key.len() as u64 + new_val_size + ENTRY_OVERHEAD, Ordering::SeqCst);
        }

        self.map.insert(key, value);
    }

    /// `None` = key unknown here; `Some(None)` = tombstoned;
    /// `Some(Some(v))` = live value.
    pub fn get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.map.get(key).map(|e| e.value().clone())
    }

    /// All entries in ascending key order, tombstones included. Used by
    /// flush.
    pub fn iter_entries(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Approximate byte size of the buffered entries.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        while self.map.pop_front().is_some() {}
        self.size.store(0, Ordering::SeqCst);
    }
}
