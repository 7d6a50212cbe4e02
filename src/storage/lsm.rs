//! LSM engine: orchestrates the WAL, the active/immutable memtables and the
//! sorted-table list, and owns the background compactor.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::storage::compaction::{CompactionManager, CompactionStats};
use crate::storage::memtable::MemTable;
use crate::storage::sstable::{parse_table_id, table_file_path, SsTable, TableLookup};
use crate::storage::wal::{SyncPolicy, Wal, WalEntry, WalOp};
use crate::storage::{Result, StoreError};

/// Flush the memtable once its estimated size reaches this many bytes.
pub const DEFAULT_MEMTABLE_THRESHOLD: u64 = 64 * 1024 * 1024;
/// How often the compactor examines the table count.
pub const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_secs(30);
/// Compact when the sorted-table count exceeds this.
pub const DEFAULT_COMPACTION_TRIGGER: usize = 4;

#[derive(Debug, Clone)]
pub struct LsmConfig {
    pub memtable_threshold: u64,
    pub compaction_interval: Duration,
    pub compaction_trigger: usize,
    pub sync_policy: SyncPolicy,
}

impl Default for LsmConfig {
    fn default() -> Self {
        LsmConfig {
            memtable_threshold: DEFAULT_MEMTABLE_THRESHOLD,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
            compaction_trigger: DEFAULT_COMPACTION_TRIGGER,
            sync_policy: SyncPolicy::OnClose,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub memtable_size: u64,
    pub num_sstables: usize,
    pub bloom_filter_hits: i64,
    pub bloom_filter_misses: i64,
    pub compaction: CompactionStats,
}

/// State guarded by the engine lock: the memtable pointers and the
/// sorted-table list (newest first).
pub(crate) struct Inner {
    pub(crate) active: Arc<MemTable>,
    pub(crate) immutable: Option<Arc<MemTable>>,
    pub(crate) tables: Vec<Arc<SsTable>>,
}

pub(crate) struct Shared {
    pub(crate) data_dir: PathBuf,
    pub(crate) wal: Wal,
    pub(crate) inner: RwLock<Inner>,
    pub(crate) next_table_id: AtomicU64,
    /// Serializes flushes; distinct from the engine lock so a long flush
    /// never blocks writers inserting into the new active memtable.
    pub(crate) flush_mu: Mutex<()>,
    pub(crate) memtable_threshold: u64,
    /// Tables skipped because the filter answered definitely-absent.
    pub(crate) bloom_hits: AtomicI64,
    /// Filter passes where the index then missed (false positives).
    pub(crate) bloom_misses: AtomicI64,
}

pub struct LsmStore {
    shared: Arc<Shared>,
    compactor: CompactionManager,
}

impl LsmStore {
    /// Open the engine over `data_dir`: discover existing sorted tables,
    /// replay the WAL into a fresh memtable, and start the compaction
    /// ticker. Must be called inside a tokio runtime.
    pub fn open(data_dir: &Path, config: LsmConfig) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let mut tables: Vec<Arc<SsTable>> = Vec::new();
        let mut max_id: Option<u64> = None;
        for entry in std::fs::read_dir(data_dir)? {
            let path = entry?.path();
            let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_table_id)
            else {
                continue;
            };
            match SsTable::open(&path) {
                Ok(table) => {
                    max_id = Some(max_id.map_or(id, |m| m.max(id)));
                    tables.push(Arc::new(table));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable sorted table");
                }
            }
        }
        // Newest first: higher id shadows lower for the same key.
        tables.sort_by(|a, b| b.id().cmp(&a.id()));

        let wal = Wal::open(data_dir, config.sync_policy)?;
        let active = Arc::new(MemTable::new());
        let replayed = wal.replay()?;
        let replayed_count = replayed.len();
        for entry in replayed {
            match entry.op {
                WalOp::Put => active.put(entry.key, entry.value),
                WalOp::Delete => active.delete(entry.key),
            }
        }
        if replayed_count > 0 {
            info!(entries = replayed_count, "recovered memtable from write-ahead log");
        }

        let shared = Arc::new(Shared {
            data_dir: data_dir.to_path_buf(),
            wal,
            inner: RwLock::new(Inner {
                active,
                immutable: None,
                tables,
            }),
            next_table_id: AtomicU64::new(max_id.map_or(0, |m| m + 1)),
            flush_mu: Mutex::new(()),
            memtable_threshold: config.memtable_threshold,
            bloom_hits: AtomicI64::new(0),
            bloom_misses: AtomicI64::new(0),
        });

        let compactor = CompactionManager::start(
            Arc::clone(&shared),
            config.compaction_interval,
            config.compaction_trigger,
        );

        Ok(LsmStore { shared, compactor })
    }

    /// Durably log the write, then make it visible in the memtable. A WAL
    /// failure leaves the memtable untouched.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.shared.wal.append(&WalEntry {
            timestamp: now_nanos(),
            op: WalOp::Put,
            key: key.to_vec(),
            value: value.to_vec(),
        })?;

        let size = {
            let inner = self.shared.inner.read().unwrap();
            inner.active.put(key.to_vec(), value.to_vec());
            inner.active.size()
        };

        if size >= self.shared.memtable_threshold {
            self.flush_internal(true)?;
        }
        Ok(())
    }

    /// Log and record a tombstone for the key.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.shared.wal.append(&WalEntry {
            timestamp: now_nanos(),
            op: WalOp::Delete,
            key: key.to_vec(),
            value: Vec::new(),
        })?;

        let size = {
            let inner = self.shared.inner.read().unwrap();
            inner.active.delete(key.to_vec());
            inner.active.size()
        };

        if size >= self.shared.memtable_threshold {
            self.flush_internal(true)?;
        }
        Ok(())
    }

    /// Read path: active memtable, then the immutable one being flushed,
    /// then sorted tables newest-first. The first hit wins; a tombstone hit
    /// is not-found.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let tables = {
            let inner = self.shared.inner.read().unwrap();
            if let Some(value) = inner.active.get(key) {
                return value.ok_or(StoreError::NotFound);
            }
            if let Some(immutable) = &inner.immutable {
                if let Some(value) = immutable.get(key) {
                    return value.ok_or(StoreError::NotFound);
                }
            }
            inner.tables.clone()
        };

        for table in &tables {
            match table.get(key)? {
                TableLookup::Filtered => {
                    self.shared.bloom_hits.fetch_add(1, Ordering::Relaxed);
                }
                TableLookup::Missing => {
                    self.shared.bloom_misses.fetch_add(1, Ordering::Relaxed);
                }
                TableLookup::Found(value) => {
                    return value.ok_or(StoreError::NotFound);
                }
            }
        }

        Err(StoreError::NotFound)
    }

    /// Write the current memtable out as a new sorted table regardless of
    /// its size. No-op when empty.
    pub fn flush(&self) -> Result<()> {
        self.flush_internal(false)
    }

    fn flush_internal(&self, recheck_threshold: bool) -> Result<()> {
        let _guard = self.shared.flush_mu.lock().unwrap();

        let (sealed, table_id) = {
            let mut inner = self.shared.inner.write().unwrap();
            if recheck_threshold && inner.active.size() < self.shared.memtable_threshold {
                return Ok(());
            }
            if inner.active.is_empty() {
                return Ok(());
            }
            let sealed = std::mem::replace(&mut inner.active, Arc::new(MemTable::new()));
            inner.immutable = Some(Arc::clone(&sealed));
            let id = self.shared.next_table_id.fetch_add(1, Ordering::SeqCst);
            (sealed, id)
        };

        // Disk I/O happens without the engine lock; readers keep serving
        // from the immutable memtable meanwhile.
        let write_result = (|| {
            let mut writer = crate::storage::sstable::SsTableWriter::new(&self.shared.data_dir, table_id)?;
            for (key, value) in sealed.iter_entries() {
                writer.add(&key, value.as_deref())?;
            }
            let path = writer.finalize()?;
            SsTable::open(&path)
        })();

        let table = match write_result {
            Ok(table) => table,
            Err(e) => {
                // Roll back: the sealed memtable becomes active again so a
                // failed flush is invisible to readers and writers. Writes
                // that landed in the replacement memtable while the flush
                // ran are newer, so they overwrite the sealed entries. The
                // WAL was not reset and still holds everything.
                {
                    let mut inner = self.shared.inner.write().unwrap();
                    let fresh = std::mem::replace(&mut inner.active, Arc::clone(&sealed));
                    for (key, value) in fresh.iter_entries() {
                        match value {
                            Some(v) => sealed.put(key, v),
                            None => sealed.delete(key),
                        }
                    }
                    inner.immutable = None;
                }
                let _ = std::fs::remove_file(table_file_path(&self.shared.data_dir, table_id));
                warn!(error = %e, "memtable flush failed, sealed memtable restored");
                return Err(e);
            }
        };

        let entry_count = table.entry_count();
        {
            let mut inner = self.shared.inner.write().unwrap();
            inner.tables.insert(0, Arc::new(table));
            inner.immutable = None;
        }
        self.shared.wal.reset()?;
        info!(table_id, entries = entry_count, "flushed memtable to sorted table");
        Ok(())
    }

    /// Merge all sorted tables into one immediately.
    pub fn compact(&self) -> Result<()> {
        self.compactor.force(&self.shared)
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.shared.inner.read().unwrap();
        let mut memtable_size = inner.active.size();
        if let Some(immutable) = &inner.immutable {
            memtable_size += immutable.size();
        }
        StoreStats {
            memtable_size,
            num_sstables: inner.tables.len(),
            bloom_filter_hits: self.shared.bloom_hits.load(Ordering::Relaxed),
            bloom_filter_misses: self.shared.bloom_misses.load(Ordering::Relaxed),
            compaction: self.compactor.stats(),
        }
    }

    /// Flush any buffered writes, stop the compactor and close the WAL.
    /// The compactor and WAL are torn down even when the final flush
    /// fails; the flush error is still reported.
    pub fn close(&self) -> Result<()> {
        let flush_result = self.flush();
        self.compactor.stop();
        let wal_result = self.shared.wal.close();
        flush_result.and(wal_result)
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config() -> LsmConfig {
        LsmConfig {
            // Large enough that nothing flushes unless a test asks for it.
            memtable_threshold: 1024 * 1024,
            // Long interval: tests drive compaction through compact().
            compaction_interval: Duration::from_secs(3600),
            compaction_trigger: 4,
            sync_policy: SyncPolicy::OnClose,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(dir.path(), test_config()).unwrap();

        store.put(b"k1", b"v1").unwrap();
        store.put(b"k2", b"v2").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), b"v1");
        assert_eq!(store.get(b"k2").unwrap(), b"v2");

        store.delete(b"k1").unwrap();
        assert!(matches!(store.get(b"k1"), Err(StoreError::NotFound)));
        assert!(matches!(store.get(b"missing"), Err(StoreError::NotFound)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wal_crash_recovery() {
        let dir = tempdir().unwrap();
        {
            let store = LsmStore::open(dir.path(), test_config()).unwrap();
            store.put(b"test", b"recovery_works").unwrap();
            store.put(b"foo", b"bar").unwrap();
            // Dropped without flush or close: only the WAL has the data.
        }

        let store = LsmStore::open(dir.path(), test_config()).unwrap();
        assert_eq!(store.get(b"test").unwrap(), b"recovery_works");
        assert_eq!(store.get(b"foo").unwrap(), b"bar");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recovery_replays_deletes() {
        let dir = tempdir().unwrap();
        {
            let store = LsmStore::open(dir.path(), test_config()).unwrap();
            store.put(b"kept", b"1").unwrap();
            store.put(b"gone", b"2").unwrap();
            store.delete(b"gone").unwrap();
        }

        let store = LsmStore::open(dir.path(), test_config()).unwrap();
        assert_eq!(store.get(b"kept").unwrap(), b"1");
        assert!(matches!(store.get(b"gone"), Err(StoreError::NotFound)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tombstone_across_flush() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(dir.path(), test_config()).unwrap();

        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        store.delete(b"a").unwrap();
        store.flush().unwrap();

        assert_eq!(store.stats().num_sstables, 1);
        assert!(matches!(store.get(b"a"), Err(StoreError::NotFound)));
        assert_eq!(store.get(b"b").unwrap(), b"2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_flush_resets_wal_and_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = LsmStore::open(dir.path(), test_config()).unwrap();
            store.put(b"k", b"v").unwrap();
            store.flush().unwrap();
            store.put(b"after_flush", b"w").unwrap();
        }

        let store = LsmStore::open(dir.path(), test_config()).unwrap();
        // k comes from the sorted table, after_flush from the WAL replay.
        assert_eq!(store.get(b"k").unwrap(), b"v");
        assert_eq!(store.get(b"after_flush").unwrap(), b"w");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_flush_leaves_engine_intact() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("engine");
        let store = LsmStore::open(&data_dir, test_config()).unwrap();

        store.put(b"k1", b"v1").unwrap();
        store.put(b"k2", b"v2").unwrap();

        // Break the data directory: table creation now fails. The open WAL
        // handle keeps accepting appends.
        std::fs::remove_dir_all(&data_dir).unwrap();
        std::fs::write(&data_dir, b"not a directory").unwrap();

        assert!(store.flush().is_err());

        // The failed flush rolled back: no table installed, no sealed
        // memtable left behind, and every write still readable.
        {
            let inner = store.shared.inner.read().unwrap();
            assert!(inner.immutable.is_none());
            assert!(inner.tables.is_empty());
        }
        let stats = store.stats();
        assert_eq!(stats.num_sstables, 0);
        assert!(stats.memtable_size > 0);
        assert_eq!(store.get(b"k1").unwrap(), b"v1");
        assert_eq!(store.get(b"k2").unwrap(), b"v2");

        // A retry that fails again must not drop the earlier entries.
        store.put(b"k3", b"v3").unwrap();
        assert!(store.flush().is_err());
        assert_eq!(store.get(b"k1").unwrap(), b"v1");
        assert_eq!(store.get(b"k2").unwrap(), b"v2");
        assert_eq!(store.get(b"k3").unwrap(), b"v3");

        // Heal the directory: the next flush writes everything out.
        std::fs::remove_file(&data_dir).unwrap();
        store.flush().unwrap();
        let stats = store.stats();
        assert_eq!(stats.num_sstables, 1);
        assert_eq!(stats.memtable_size, 0);
        assert_eq!(store.get(b"k1").unwrap(), b"v1");
        assert_eq!(store.get(b"k2").unwrap(), b"v2");
        assert_eq!(store.get(b"k3").unwrap(), b"v3");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_tears_down_despite_flush_failure() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("engine");
        let store = LsmStore::open(&data_dir, test_config()).unwrap();
        store.put(b"k", b"v").unwrap();

        std::fs::remove_dir_all(&data_dir).unwrap();
        std::fs::write(&data_dir, b"not a directory").unwrap();

        // The flush failure surfaces, but the WAL is still flushed and
        // closed and the compactor stopped.
        assert!(store.close().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_newer_table_shadows_older() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(dir.path(), test_config()).unwrap();

        store.put(b"key", b"old").unwrap();
        store.flush().unwrap();
        store.put(b"key", b"new").unwrap();
        store.flush().unwrap();

        assert_eq!(store.stats().num_sstables, 2);
        assert_eq!(store.get(b"key").unwrap(), b"new");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_memtable_shadows_tables() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(dir.path(), test_config()).unwrap();

        store.put(b"key", b"flushed").unwrap();
        store.flush().unwrap();
        store.put(b"key", b"in_memory").unwrap();

        assert_eq!(store.get(b"key").unwrap(), b"in_memory");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_threshold_triggers_flush() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.memtable_threshold = 64;
        let store = LsmStore::open(dir.path(), config).unwrap();

        for i in 0..8 {
            store
                .put(format!("key_{}", i).as_bytes(), b"some_filler_value_bytes")
                .unwrap();
        }

        let stats = store.stats();
        assert!(stats.num_sstables >= 1, "threshold crossing should have flushed");
        for i in 0..8 {
            assert!(store.get(format!("key_{}", i).as_bytes()).is_ok());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_compaction_merges_and_drops_tombstones() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(dir.path(), test_config()).unwrap();

        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        store.flush().unwrap();
        store.put(b"b", b"2_new").unwrap();
        store.put(b"c", b"3").unwrap();
        store.flush().unwrap();
        store.delete(b"a").unwrap();
        store.flush().unwrap();

        assert_eq!(store.stats().num_sstables, 3);
        store.compact().unwrap();

        let stats = store.stats();
        assert_eq!(stats.num_sstables, 1);
        assert_eq!(stats.compaction.total_compactions, 1);
        assert_eq!(stats.compaction.total_keys_removed, 1);
        assert!(!stats.compaction.last_compaction.is_empty());

        assert!(matches!(store.get(b"a"), Err(StoreError::NotFound)));
        assert_eq!(store.get(b"b").unwrap(), b"2_new");
        assert_eq!(store.get(b"c").unwrap(), b"3");

        // Old table files are gone from disk.
        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| n.starts_with("sstable_"))
                    .unwrap_or(false)
            })
            .collect();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_compacted_state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = LsmStore::open(dir.path(), test_config()).unwrap();
            store.put(b"x", b"1").unwrap();
            store.flush().unwrap();
            store.delete(b"x").unwrap();
            store.put(b"y", b"2").unwrap();
            store.flush().unwrap();
            store.compact().unwrap();
            store.close().unwrap();
        }

        let store = LsmStore::open(dir.path(), test_config()).unwrap();
        assert!(matches!(store.get(b"x"), Err(StoreError::NotFound)));
        assert_eq!(store.get(b"y").unwrap(), b"2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bloom_counters_move_on_cold_reads() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(dir.path(), test_config()).unwrap();

        store.put(b"present", b"v").unwrap();
        store.flush().unwrap();

        for i in 0..50 {
            let _ = store.get(format!("cold_miss_{}", i).as_bytes());
        }

        let stats = store.stats();
        assert!(
            stats.bloom_filter_hits + stats.bloom_filter_misses >= 50,
            "every cold read should be counted as a skip or a false positive"
        );
        assert!(stats.bloom_filter_hits > 0, "most cold reads should be bloom-skipped");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_flushes_pending_writes() {
        let dir = tempdir().unwrap();
        {
            let store = LsmStore::open(dir.path(), test_config()).unwrap();
            store.put(b"pending", b"v").unwrap();
            store.close().unwrap();
        }

        let store = LsmStore::open(dir.path(), test_config()).unwrap();
        assert_eq!(store.stats().num_sstables, 1);
        assert_eq!(store.get(b"pending").unwrap(), b"v");
    }
}
