//! gRPC implementation of the replica transport: one connected client per
//! registered node.

use std::collections::HashMap;

use async_trait::async_trait;
use tonic::transport::Channel;

use crate::cluster::coordinator::{ReplicaClient, ReplicaRead};
use crate::cluster::{ClusterError, Result};
use crate::server::kv;
use crate::server::kv::kv_store_client::KvStoreClient;

pub struct GrpcReplicaClient {
    clients: HashMap<String, KvStoreClient<Channel>>,
}

impl GrpcReplicaClient {
    /// Connect to every node up front; a single unreachable node fails the
    /// whole connect, mirroring an operator-supplied static topology.
    pub async fn connect(node_addresses: &HashMap<String, String>) -> Result<Self> {
        let mut clients = HashMap::new();
        for (node_id, address) in node_addresses {
            let endpoint = if address.starts_with("http") {
                address.clone()
            } else {
                format!("http://{}", address)
            };
            let client = KvStoreClient::connect(endpoint).await.map_err(|e| {
                ClusterError::Transport(format!(
                    "failed to connect to node {} at {}: {}",
                    node_id, address, e
                ))
            })?;
            clients.insert(node_id.clone(), client);
        }
        Ok(GrpcReplicaClient { clients })
    }

    /// tonic clients are cheap clones over a shared channel.
    fn client(&self, node_id: &str) -> Result<KvStoreClient<Channel>> {
        self.clients
            .get(node_id)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownNode(node_id.to_string()))
    }

    pub async fn node_stats(&self, node_id: &str) -> Result<kv::StatsResponse> {
        let mut client = self.client(node_id)?;
        let response = client
            .stats(kv::StatsRequest {})
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(response.into_inner())
    }

    pub async fn node_compact(&self, node_id: &str) -> Result<()> {
        let mut client = self.client(node_id)?;
        let response = client
            .compact(kv::CompactRequest {})
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?
            .into_inner();
        if response.success {
            Ok(())
        } else {
            Err(ClusterError::Transport(response.error))
        }
    }
}

#[async_trait]
impl ReplicaClient for GrpcReplicaClient {
    async fn replica_put(
        &self,
        node_id: &str,
        key: &str,
        value: &[u8],
        timestamp: i64,
        version: i64,
    ) -> Result<bool> {
        let mut client = self.client(node_id)?;
        let response = client
            .replica_put(kv::ReplicaPutRequest {
                key: key.to_string(),
                value: value.to_vec(),
                timestamp,
                version,
            })
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(response.into_inner().success)
    }

    async fn replica_get(&self, node_id: &str, key: &str) -> Result<ReplicaRead> {
        let mut client = self.client(node_id)?;
        let response = client
            .replica_get(kv::ReplicaGetRequest {
                key: key.to_string(),
            })
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?
            .into_inner();
        Ok(ReplicaRead {
            value: response.value,
            found: response.found,
            timestamp: response.timestamp,
            version: response.version,
        })
    }

    async fn replica_delete(&self, node_id: &str, key: &str) -> Result<bool> {
        let mut client = self.client(node_id)?;
        let response = client
            .delete(kv::DeleteRequest {
                key: key.to_string(),
            })
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok(response.into_inner().success)
    }
}
