//! Hinted handoff: writes that missed a replica are queued durably and
//! per-target, to be replayed once the replica returns. Each target's list
//! persists as one `hints_<node>.json` file rewritten whole.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterError, Result};

pub const DEFAULT_MAX_HINTS_PER_NODE: usize = 10_000;
pub const DEFAULT_HINT_MAX_AGE: StdDuration = StdDuration::from_secs(24 * 60 * 60);

/// A write owed to a replica that did not acknowledge it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hint {
    pub target_node: String,
    pub key: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    pub timestamp: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

pub struct HintStore {
    hints_dir: PathBuf,
    hints: Mutex<HashMap<String, Vec<Hint>>>,
    max_hints_per_node: usize,
    max_age: Duration,
}

impl HintStore {
    /// Open the store over `hints_dir`, loading any persisted hint files.
    pub fn open(hints_dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(hints_dir)?;

        let store = HintStore {
            hints_dir: hints_dir.to_path_buf(),
            hints: Mutex::new(HashMap::new()),
            max_hints_per_node: DEFAULT_MAX_HINTS_PER_NODE,
            max_age: Duration::from_std(DEFAULT_HINT_MAX_AGE).expect("max age in range"),
        };
        store.load()?;
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) fn with_limits(
        hints_dir: &std::path::Path,
        max_hints_per_node: usize,
        max_age: StdDuration,
    ) -> Result<Self> {
        let mut store = Self::open(hints_dir)?;
        store.max_hints_per_node = max_hints_per_node;
        store.max_age = Duration::from_std(max_age).expect("max age in range");
        Ok(store)
    }

    /// Queue a write for an unreachable replica. Fails with a capacity
    /// error when the target's queue is full.
    pub fn store_hint(
        &self,
        target_node: &str,
        key: &str,
        value: &[u8],
        timestamp: i64,
        version: i64,
    ) -> Result<()> {
        let mut hints = self.hints.lock().unwrap();
        let list = hints.entry(target_node.to_string()).or_default();
        if list.len() >= self.max_hints_per_node {
            return Err(ClusterError::HintCapacity(target_node.to_string()));
        }

        list.push(Hint {
            target_node: target_node.to_string(),
            key: key.to_string(),
            value: value.to_vec(),
            timestamp,
            version,
            created_at: Utc::now(),
        });
        self.persist_target(target_node, list)?;

        debug!(target = target_node, key, "stored hint");
        Ok(())
    }

    pub fn hints_for(&self, target_node: &str) -> Vec<Hint> {
        self.hints
            .lock()
            .unwrap()
            .get(target_node)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop everything queued for a target, file included. Used after a
    /// successful full replay.
    pub fn clear_hints(&self, target_node: &str) -> Result<()> {
        let mut hints = self.hints.lock().unwrap();
        hints.remove(target_node);

        let path = self.target_path(target_node);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(target = target_node, "cleared hints");
        Ok(())
    }

    /// Drop one replayed hint by position.
    pub fn remove_hint(&self, target_node: &str, index: usize) -> Result<()> {
        let mut hints = self.hints.lock().unwrap();
        let Some(list) = hints.get_mut(target_node) else {
            return Ok(());
        };
        if index >= list.len() {
            return Ok(());
        }
        list.remove(index);

        if list.is_empty() {
            hints.remove(target_node);
            return self.clear_file(target_node);
        }
        let list = hints.get(target_node).unwrap();
        self.persist_target(target_node, list)
    }

    /// Drop hints older than the configured maximum age and rewrite the
    /// file of every target whose list changed. Returns how many hints
    /// were removed.
    pub fn cleanup_old(&self) -> usize {
        let cutoff = Utc::now() - self.max_age;
        let mut hints = self.hints.lock().unwrap();

        let mut removed = 0;
        let mut emptied = Vec::new();
        let mut changed = Vec::new();

        for (target, list) in hints.iter_mut() {
            let before = list.len();
            list.retain(|h| h.created_at > cutoff);
            if list.len() != before {
                removed += before - list.len();
                if list.is_empty() {
                    emptied.push(target.clone());
                } else {
                    changed.push(target.clone());
                }
            }
        }

        for target in &emptied {
            hints.remove(target);
            if let Err(e) = self.clear_file(target) {
                warn!(target, error = %e, "failed to remove emptied hint file");
            }
        }
        for target in &changed {
            if let Some(list) = hints.get(target) {
                if let Err(e) = self.persist_target(target, list) {
                    warn!(target, error = %e, "failed to rewrite hint file after cleanup");
                }
            }
        }

        if removed > 0 {
            info!(removed, "cleaned up expired hints");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.hints.lock().unwrap().values().map(Vec::len).sum()
    }

    pub fn count_for(&self, target_node: &str) -> usize {
        self.hints
            .lock()
            .unwrap()
            .get(target_node)
            .map_or(0, Vec::len)
    }

    /// Run `cleanup_old` on a ticker until the returned sender is dropped
    /// or signalled.
    pub fn start_cleanup_task(self: Arc<Self>, interval: StdDuration) -> watch::Sender<bool> {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        store.cleanup_old();
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        shutdown
    }

    fn target_path(&self, target_node: &str) -> PathBuf {
        self.hints_dir.join(format!("hints_{}.json", target_node))
    }

    fn persist_target(&self, target_node: &str, list: &[Hint]) -> Result<()> {
        let data = serde_json::to_vec_pretty(list)?;
        std::fs::write(self.target_path(target_node), data)?;
        Ok(())
    }

    fn clear_file(&self, target_node: &str) -> Result<()> {
        match std::fs::remove_file(self.target_path(target_node)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load(&self) -> Result<()> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.hints_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("hints_") || !name.ends_with(".json") {
                continue;
            }

            let data = match std::fs::read(&path) {
                Ok(d) => d,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read hint file");
                    continue;
                }
            };
            let list: Vec<Hint> = match serde_json::from_slice(&data) {
                Ok(l) => l,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse hint file");
                    continue;
                }
            };
            if let Some(first) = list.first() {
                loaded += list.len();
                self.hints
                    .lock()
                    .unwrap()
                    .insert(first.target_node.clone(), list);
            }
        }

        if loaded > 0 {
            info!(hints = loaded, "loaded hints from disk");
        }
        Ok(())
    }
}
