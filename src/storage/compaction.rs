//! Size-tiered compaction: a periodic ticker merges all sorted tables into
//! one, dropping superseded versions and tombstones.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::storage::lsm::Shared;
use crate::storage::sstable::{SsTable, SsTableWriter};
use crate::storage::Result;

#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    pub total_compactions: i64,
    pub total_keys_removed: i64,
    pub total_bytes_reclaimed: i64,
    /// RFC 3339 timestamp of the last completed compaction; empty if none.
    pub last_compaction: String,
}

#[derive(Default)]
struct Counters {
    total_compactions: AtomicI64,
    total_keys_removed: AtomicI64,
    total_bytes_reclaimed: AtomicI64,
    last_compaction: Mutex<Option<DateTime<Utc>>>,
}

impl Counters {
    fn snapshot(&self) -> CompactionStats {
        CompactionStats {
            total_compactions: self.total_compactions.load(Ordering::Relaxed),
            total_keys_removed: self.total_keys_removed.load(Ordering::Relaxed),
            total_bytes_reclaimed: self.total_bytes_reclaimed.load(Ordering::Relaxed),
            last_compaction: self
                .last_compaction
                .lock()
                .unwrap()
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
        }
    }
}

pub(crate) struct CompactionManager {
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
}

impl CompactionManager {
    /// Spawn the ticker task. Every `interval` it compacts iff the table
    /// count exceeds `trigger`.
    pub(crate) fn start(shared: Arc<Shared>, interval: Duration, trigger: usize) -> Self {
        let counters = Arc::new(Counters::default());
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let ticker_counters = Arc::clone(&counters);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let count = shared.inner.read().unwrap().tables.len();
                        if count > trigger {
                            info!(tables = count, "compaction trigger reached");
                            if let Err(e) = run_compaction(&shared, &ticker_counters) {
                                warn!(error = %e, "compaction failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        CompactionManager { counters, shutdown }
    }

    /// Manual trigger, bypassing the table-count check.
    pub(crate) fn force(&self, shared: &Shared) -> Result<()> {
        run_compaction(shared, &self.counters)
    }

    pub(crate) fn stats(&self) -> CompactionStats {
        self.counters.snapshot()
    }

    pub(crate) fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

fn run_compaction(shared: &Shared, counters: &Counters) -> Result<()> {
    // Snapshot the table list; in-flight reads keep their own clones and
    // the files stay valid until after the swap below.
    let snapshot: Vec<Arc<SsTable>> = shared.inner.read().unwrap().tables.clone();
    if snapshot.len() < 2 {
        return Ok(());
    }

    let new_id = shared.next_table_id.fetch_add(1, Ordering::SeqCst);

    // Stream every input once, newest table first; the first version seen
    // for a key wins.
    let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
    let mut input_bytes: i64 = 0;
    for table in &snapshot {
        for (key, value) in table.scan()? {
            input_bytes += key.len() as i64 + value.as_ref().map_or(0, |v| v.len() as i64);
            merged.entry(key).or_insert(value);
        }
    }

    // This pass covers every table, so tombstones can be dropped outright.
    let mut keys_removed: i64 = 0;
    let mut output_bytes: i64 = 0;
    merged.retain(|key, value| match value {
        None => {
            keys_removed += 1;
            false
        }
        Some(v) => {
            output_bytes += key.len() as i64 + v.len() as i64;
            true
        }
    });

    let mut writer = SsTableWriter::new(&shared.data_dir, new_id)?;
    for (key, value) in &merged {
        writer.add(key, value.as_deref())?;
    }
    let path = writer.finalize()?;
    let new_table = Arc::new(SsTable::open(&path)?);

    let old_ids: HashSet<u64> = snapshot.iter().map(|t| t.id()).collect();
    {
        let mut inner = shared.inner.write().unwrap();
        // Tables flushed while we merged stay in the list; they are newer
        // than everything we just compacted.
        inner.tables.retain(|t| !old_ids.contains(&t.id()));
        inner.tables.push(new_table);
        inner.tables.sort_by(|a, b| b.id().cmp(&a.id()));
    }

    for table in &snapshot {
        if let Err(e) = std::fs::remove_file(table.path()) {
            warn!(path = %table.path().display(), error = %e, "failed to delete compacted table");
        }
    }

    counters.total_compactions.fetch_add(1, Ordering::Relaxed);
    counters.total_keys_removed.fetch_add(keys_removed, Ordering::Relaxed);
    counters
        .total_bytes_reclaimed
        .fetch_add(input_bytes - output_bytes, Ordering::Relaxed);
    *counters.last_compaction.lock().unwrap() = Some(Utc::now());

    info!(
        inputs = snapshot.len(),
        new_table = new_id,
        keys_removed,
        bytes_reclaimed = input_bytes - output_bytes,
        "compaction finished"
    );
    Ok(())
}
