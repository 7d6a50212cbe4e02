//! Quorum coordinator. Fans each client operation out to the key's
//! preference list, counts acknowledgements against W/R, resolves
//! conflicting reads by last-write-wins, repairs stale replicas in the
//! background, and queues hints for replicas that missed a write.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cluster::registry::NodeRegistry;
use crate::cluster::{ClusterError, Result};
use crate::replication::{
    self, generate_timestamp, generate_version, outdated_replicas, resolve_conflict, HintStore,
    ReplicaResponse,
};

/// Per-replica-call deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// A replica's answer to a read.
#[derive(Debug, Clone, Default)]
pub struct ReplicaRead {
    pub value: Vec<u8>,
    pub found: bool,
    pub timestamp: i64,
    pub version: i64,
}

/// The request/response transport the coordinator speaks to replicas.
/// Kept deliberately thin: gRPC in production, an in-process fake in
/// tests.
#[async_trait]
pub trait ReplicaClient: Send + Sync + 'static {
    async fn replica_put(
        &self,
        node_id: &str,
        key: &str,
        value: &[u8],
        timestamp: i64,
        version: i64,
    ) -> Result<bool>;

    async fn replica_get(&self, node_id: &str, key: &str) -> Result<ReplicaRead>;

    async fn replica_delete(&self, node_id: &str, key: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub replication_factor: usize,
    pub write_quorum: usize,
    pub read_quorum: usize,
    pub rpc_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            replication_factor: replication::REPLICATION_FACTOR,
            write_quorum: replication::WRITE_QUORUM,
            read_quorum: replication::READ_QUORUM,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

pub struct Coordinator {
    registry: Arc<NodeRegistry>,
    transport: Arc<dyn ReplicaClient>,
    hints: Arc<HintStore>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        registry: Arc<NodeRegistry>,
        transport: Arc<dyn ReplicaClient>,
        hints: Arc<HintStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Coordinator {
            registry,
            transport,
            hints,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn hints(&self) -> &Arc<HintStore> {
        &self.hints
    }

    /// Replicate a write to the key's preference list. Succeeds once W
    /// replicas acknowledge; failed replicas get a durable hint.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let prefs = self
            .registry
            .preference_list(key, self.config.replication_factor);
        if prefs.is_empty() {
            return Err(ClusterError::EmptyRing);
        }

        let timestamp = generate_timestamp();
        let version = generate_version(timestamp);
        debug!(key, replicas = ?prefs, w = self.config.write_quorum, "coordinating put");

        let mut calls = Vec::with_capacity(prefs.len());
        for node_id in &prefs {
            let transport = Arc::clone(&self.transport);
            let node_id = node_id.clone();
            let key = key.to_string();
            let value = value.to_vec();
            let deadline = self.config.rpc_timeout;
            calls.push(tokio::spawn(async move {
                let outcome = timeout(
                    deadline,
                    transport.replica_put(&node_id, &key, &value, timestamp, version),
                )
                .await;
                (node_id, flatten_ack(outcome))
            }));
        }

        let mut successful = 0;
        for call in calls {
            let Ok((node_id, outcome)) = call.await else {
                continue;
            };
            match outcome {
                Ok(()) => successful += 1,
                Err(e) => {
                    warn!(key, node = %node_id, error = %e, "replica write failed, storing hint");
                    if let Err(hint_err) =
                        self.hints
                            .store_hint(&node_id, key, value, timestamp, version)
                    {
                        warn!(node = %node_id, error = %hint_err, "failed to store hint");
                    }
                }
            }
        }

        if successful < self.config.write_quorum {
            return Err(ClusterError::QuorumNotReached {
                operation: "write",
                successful,
                required: self.config.write_quorum,
                total: prefs.len(),
            });
        }
        info!(key, successful, total = prefs.len(), "put reached quorum");
        Ok(())
    }

    /// Quorum read: needs R participating replicas, resolves divergent
    /// answers by last-write-wins, and asynchronously rewrites the winner
    /// to every outdated replica.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let prefs = self
            .registry
            .preference_list(key, self.config.replication_factor);
        if prefs.is_empty() {
            return Err(ClusterError::EmptyRing);
        }
        debug!(key, replicas = ?prefs, r = self.config.read_quorum, "coordinating get");

        let mut calls = Vec::with_capacity(prefs.len());
        for node_id in &prefs {
            let transport = Arc::clone(&self.transport);
            let node_id = node_id.clone();
            let key = key.to_string();
            let deadline = self.config.rpc_timeout;
            calls.push(tokio::spawn(async move {
                let outcome = timeout(deadline, transport.replica_get(&node_id, &key)).await;
                let outcome = match outcome {
                    Ok(inner) => inner,
                    Err(_) => Err(ClusterError::Transport("replica read timed out".into())),
                };
                (node_id, outcome)
            }));
        }

        let mut participating = 0;
        let mut found = Vec::new();
        for call in calls {
            let Ok((node_id, outcome)) = call.await else {
                continue;
            };
            match outcome {
                Ok(read) => {
                    participating += 1;
                    if read.found {
                        found.push(ReplicaResponse {
                            node_id,
                            success: true,
                            value: read.value,
                            version: read.version,
                            timestamp: read.timestamp,
                            error: None,
                        });
                    }
                }
                Err(e) => {
                    debug!(key, node = %node_id, error = %e, "replica read failed");
                }
            }
        }

        if participating < self.config.read_quorum {
            return Err(ClusterError::QuorumNotReached {
                operation: "read",
                successful: participating,
                required: self.config.read_quorum,
                total: prefs.len(),
            });
        }
        if found.is_empty() {
            return Err(ClusterError::NotFound);
        }

        let winner = match resolve_conflict(&found) {
            Some(w) => w.clone(),
            None => return Err(ClusterError::NotFound),
        };
        let outdated = outdated_replicas(&found, &winner);
        if !outdated.is_empty() {
            info!(key, outdated = ?outdated, "read repair needed");
            self.spawn_read_repair(key, &winner, outdated);
        }

        Ok(winner.value)
    }

    /// Replicated delete. Like put this needs W acknowledgements; unlike
    /// put, failed replicas are not hinted, so a missed delete converges
    /// only through a later read repair.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let prefs = self
            .registry
            .preference_list(key, self.config.replication_factor);
        if prefs.is_empty() {
            return Err(ClusterError::EmptyRing);
        }
        debug!(key, replicas = ?prefs, "coordinating delete");

        let mut calls = Vec::with_capacity(prefs.len());
        for node_id in &prefs {
            let transport = Arc::clone(&self.transport);
            let node_id = node_id.clone();
            let key = key.to_string();
            let deadline = self.config.rpc_timeout;
            calls.push(tokio::spawn(async move {
                let outcome = timeout(deadline, transport.replica_delete(&node_id, &key)).await;
                (node_id, flatten_ack(outcome))
            }));
        }

        let mut successful = 0;
        for call in calls {
            let Ok((node_id, outcome)) = call.await else {
                continue;
            };
            match outcome {
                Ok(()) => successful += 1,
                Err(e) => warn!(key, node = %node_id, error = %e, "replica delete failed"),
            }
        }

        if successful < self.config.write_quorum {
            return Err(ClusterError::QuorumNotReached {
                operation: "delete",
                successful,
                required: self.config.write_quorum,
                total: prefs.len(),
            });
        }
        info!(key, successful, total = prefs.len(), "delete reached quorum");
        Ok(())
    }

    fn spawn_read_repair(&self, key: &str, winner: &ReplicaResponse, outdated: Vec<String>) {
        let transport = Arc::clone(&self.transport);
        let key = key.to_string();
        let value = winner.value.clone();
        let timestamp = winner.timestamp;
        let version = winner.version;
        tokio::spawn(async move {
            for node_id in outdated {
                match transport
                    .replica_put(&node_id, &key, &value, timestamp, version)
                    .await
                {
                    Ok(true) => info!(key, node = %node_id, "read repair completed"),
                    Ok(false) => warn!(key, node = %node_id, "read repair rejected"),
                    Err(e) => warn!(key, node = %node_id, error = %e, "read repair failed"),
                }
            }
        });
    }
}

/// Collapse timeout/transport/nack layers into one per-replica outcome.
fn flatten_ack(
    outcome: std::result::Result<Result<bool>, tokio::time::error::Elapsed>,
) -> Result<()> {
    match outcome {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err(ClusterError::Transport("replica reported failure".into())),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ClusterError::Transport("replica call timed out".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Scriptable in-process replica set.
    #[derive(Default)]
    struct FakeReplicas {
        /// node -> (value, timestamp, version)
        data: Mutex<HashMap<String, HashMap<String, (Vec<u8>, i64, i64)>>>,
        down: Mutex<HashSet<String>>,
        puts: Mutex<Vec<(String, String, Vec<u8>, i64, i64)>>,
    }

    impl FakeReplicas {
        fn seed(&self, node: &str, key: &str, value: &[u8], timestamp: i64, version: i64) {
            self.data
                .lock()
                .unwrap()
                .entry(node.to_string())
                .or_default()
                .insert(key.to_string(), (value.to_vec(), timestamp, version));
        }

        fn take_down(&self, node: &str) {
            self.down.lock().unwrap().insert(node.to_string());
        }

        fn recorded_puts(&self) -> Vec<(String, String, Vec<u8>, i64, i64)> {
            self.puts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReplicaClient for FakeReplicas {
        async fn replica_put(
            &self,
            node_id: &str,
            key: &str,
            value: &[u8],
            timestamp: i64,
            version: i64,
        ) -> Result<bool> {
            if self.down.lock().unwrap().contains(node_id) {
                return Err(ClusterError::Transport(format!("{} unreachable", node_id)));
            }
            self.puts.lock().unwrap().push((
                node_id.to_string(),
                key.to_string(),
                value.to_vec(),
                timestamp,
                version,
            ));
            self.seed(node_id, key, value, timestamp, version);
            Ok(true)
        }

        async fn replica_get(&self, node_id: &str, key: &str) -> Result<ReplicaRead> {
            if self.down.lock().unwrap().contains(node_id) {
                return Err(ClusterError::Transport(format!("{} unreachable", node_id)));
            }
            let data = self.data.lock().unwrap();
            match data.get(node_id).and_then(|kv| kv.get(key)) {
                Some((value, timestamp, version)) => Ok(ReplicaRead {
                    value: value.clone(),
                    found: true,
                    timestamp: *timestamp,
                    version: *version,
                }),
                None => Ok(ReplicaRead::default()),
            }
        }

        async fn replica_delete(&self, node_id: &str, key: &str) -> Result<bool> {
            if self.down.lock().unwrap().contains(node_id) {
                return Err(ClusterError::Transport(format!("{} unreachable", node_id)));
            }
            self.data
                .lock()
                .unwrap()
                .entry(node_id.to_string())
                .or_default()
                .remove(key);
            Ok(true)
        }
    }

    fn test_cluster(
        hints_dir: &std::path::Path,
    ) -> (Coordinator, Arc<FakeReplicas>, Vec<String>) {
        let registry = Arc::new(NodeRegistry::new(crate::cluster::DEFAULT_VIRTUAL_NODES));
        registry.register("node1", "addr1").unwrap();
        registry.register("node2", "addr2").unwrap();
        registry.register("node3", "addr3").unwrap();

        let replicas = Arc::new(FakeReplicas::default());
        let hints = Arc::new(HintStore::open(hints_dir).unwrap());
        let coordinator = Coordinator::new(
            Arc::clone(&registry),
            Arc::clone(&replicas) as Arc<dyn ReplicaClient>,
            hints,
            CoordinatorConfig::default(),
        );
        let prefs = registry.preference_list("the_key", 3);
        (coordinator, replicas, prefs)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_then_get_round_trip() {
        let dir = tempdir().unwrap();
        let (coordinator, _replicas, _) = test_cluster(dir.path());

        coordinator.put("the_key", b"the_value").await.unwrap();
        assert_eq!(coordinator.get("the_key").await.unwrap(), b"the_value");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_writes_all_replicas_with_one_version() {
        let dir = tempdir().unwrap();
        let (coordinator, replicas, _) = test_cluster(dir.path());

        coordinator.put("the_key", b"v").await.unwrap();

        let puts = replicas.recorded_puts();
        assert_eq!(puts.len(), 3);
        let (_, _, _, ts0, ver0) = &puts[0];
        for (_, key, value, ts, ver) in &puts {
            assert_eq!(key, "the_key");
            assert_eq!(value, b"v");
            assert_eq!(ts, ts0);
            assert_eq!(ver, ver0);
        }
        assert_eq!(*ver0, *ts0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_tolerates_one_down_replica_and_hints_it() {
        let dir = tempdir().unwrap();
        let (coordinator, replicas, prefs) = test_cluster(dir.path());
        replicas.take_down(&prefs[2]);

        coordinator.put("the_key", b"v").await.unwrap();

        assert_eq!(coordinator.hints().count_for(&prefs[2]), 1);
        let hint = &coordinator.hints().hints_for(&prefs[2])[0];
        assert_eq!(hint.key, "the_key");
        assert_eq!(hint.value, b"v");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_fails_below_write_quorum() {
        let dir = tempdir().unwrap();
        let (coordinator, replicas, prefs) = test_cluster(dir.path());
        replicas.take_down(&prefs[0]);
        replicas.take_down(&prefs[1]);

        match coordinator.put("the_key", b"v").await {
            Err(ClusterError::QuorumNotReached {
                operation,
                successful,
                required,
                total,
            }) => {
                assert_eq!(operation, "write");
                assert_eq!(successful, 1);
                assert_eq!(required, 2);
                assert_eq!(total, 3);
            }
            other => panic!("expected quorum failure, got {:?}", other),
        }
        // Both failed replicas were hinted.
        assert_eq!(coordinator.hints().count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_fails_below_read_quorum() {
        let dir = tempdir().unwrap();
        let (coordinator, replicas, prefs) = test_cluster(dir.path());
        for node in prefs.iter().take(2) {
            replicas.take_down(node);
        }

        match coordinator.get("the_key").await {
            Err(ClusterError::QuorumNotReached { operation, .. }) => {
                assert_eq!(operation, "read")
            }
            other => panic!("expected quorum failure, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_missing_key_is_not_found() {
        let dir = tempdir().unwrap();
        let (coordinator, _replicas, _) = test_cluster(dir.path());

        assert!(matches!(
            coordinator.get("never_written").await,
            Err(ClusterError::NotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_last_write_wins_and_read_repair() {
        let dir = tempdir().unwrap();
        let (coordinator, replicas, prefs) = test_cluster(dir.path());

        // Replicas diverge: one holds the newest write, two hold stale
        // versions.
        let now = generate_timestamp();
        replicas.seed(&prefs[0], "the_key", b"stale_old", now - 2000, 0);
        replicas.seed(&prefs[1], "the_key", b"winner", now, 2);
        replicas.seed(&prefs[2], "the_key", b"stale_mid", now - 1000, 1);

        let value = coordinator.get("the_key").await.unwrap();
        assert_eq!(value, b"winner");

        // The async repair rewrites both stale replicas with the winner's
        // value and version.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let repairs = replicas.recorded_puts();
        assert_eq!(repairs.len(), 2);
        let repaired: HashSet<String> = repairs.iter().map(|(n, ..)| n.clone()).collect();
        assert!(repaired.contains(&prefs[0]));
        assert!(repaired.contains(&prefs[2]));
        for (_, key, value, ts, ver) in &repairs {
            assert_eq!(key, "the_key");
            assert_eq!(value, b"winner");
            assert_eq!(*ts, now);
            assert_eq!(*ver, 2);
        }

        // After repair, every replica answers with the winner.
        let value = coordinator.get("the_key").await.unwrap();
        assert_eq!(value, b"winner");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(replicas.recorded_puts().len(), 2, "no further repair needed");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_reaches_quorum() {
        let dir = tempdir().unwrap();
        let (coordinator, replicas, prefs) = test_cluster(dir.path());

        coordinator.put("the_key", b"v").await.unwrap();
        replicas.take_down(&prefs[2]);
        coordinator.delete("the_key").await.unwrap();

        assert!(matches!(
            coordinator.get("the_key").await,
            Err(ClusterError::NotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_fails_below_quorum() {
        let dir = tempdir().unwrap();
        let (coordinator, replicas, prefs) = test_cluster(dir.path());
        replicas.take_down(&prefs[0]);
        replicas.take_down(&prefs[1]);

        assert!(matches!(
            coordinator.delete("the_key").await,
            Err(ClusterError::QuorumNotReached { operation: "delete", .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_ring_is_an_error() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(NodeRegistry::new(8));
        let replicas = Arc::new(FakeReplicas::default());
        let hints = Arc::new(HintStore::open(dir.path()).unwrap());
        let coordinator = Coordinator::new(
            registry,
            replicas as Arc<dyn ReplicaClient>,
            hints,
            CoordinatorConfig::default(),
        );

        assert!(matches!(
            coordinator.put("k", b"v").await,
            Err(ClusterError::EmptyRing)
        ));
    }
}
