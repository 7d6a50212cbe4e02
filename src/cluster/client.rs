//! Client-facing cluster handle: wires the registry, the gRPC replica
//! transport, the hint store and the coordinator together over a static
//! node topology.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::cluster::coordinator::{Coordinator, CoordinatorConfig, ReplicaClient};
use crate::cluster::grpc::GrpcReplicaClient;
use crate::cluster::registry::{NodeInfo, NodeRegistry};
use crate::cluster::{Result, DEFAULT_VIRTUAL_NODES};
use crate::replication::HintStore;
use crate::server::kv;

/// How often expired hints are swept.
const HINT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct ClusterClient {
    coordinator: Coordinator,
    transport: Arc<GrpcReplicaClient>,
    registry: Arc<NodeRegistry>,
    hints: Arc<HintStore>,
    _cleanup_shutdown: watch::Sender<bool>,
}

impl ClusterClient {
    /// Connect to every node in the topology and start the hint cleaner.
    pub async fn connect(
        node_addresses: &HashMap<String, String>,
        hints_dir: &Path,
    ) -> Result<Self> {
        let registry = Arc::new(NodeRegistry::new(DEFAULT_VIRTUAL_NODES));
        for (node_id, address) in node_addresses {
            registry.register(node_id, address)?;
        }

        let transport = Arc::new(GrpcReplicaClient::connect(node_addresses).await?);
        let hints = Arc::new(HintStore::open(hints_dir)?);
        let cleanup_shutdown = Arc::clone(&hints).start_cleanup_task(HINT_CLEANUP_INTERVAL);

        let coordinator = Coordinator::new(
            Arc::clone(&registry),
            Arc::clone(&transport) as Arc<dyn ReplicaClient>,
            Arc::clone(&hints),
            CoordinatorConfig::default(),
        );

        Ok(ClusterClient {
            coordinator,
            transport,
            registry,
            hints,
            _cleanup_shutdown: cleanup_shutdown,
        })
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.coordinator.put(key, value).await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.coordinator.get(key).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.coordinator.delete(key).await
    }

    /// Storage statistics from every node in the topology.
    pub async fn all_stats(&self) -> Result<HashMap<String, kv::StatsResponse>> {
        let mut all = HashMap::new();
        for info in self.registry.list() {
            let stats = self.transport.node_stats(&info.id).await?;
            all.insert(info.id, stats);
        }
        Ok(all)
    }

    /// Force a compaction on every node.
    pub async fn compact_all(&self) -> Result<()> {
        for info in self.registry.list() {
            self.transport.node_compact(&info.id).await?;
        }
        Ok(())
    }

    /// Which node the ring holds primarily responsible for a key.
    pub fn node_for_key(&self, key: &str) -> Result<NodeInfo> {
        self.registry.route_key(key)
    }

    pub fn hint_count(&self) -> usize {
        self.hints.count()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }
}
