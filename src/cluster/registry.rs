//! Node directory: identity and address bookkeeping layered over the hash
//! ring. Registering a node places it on the ring; unregistering removes
//! its virtual points.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::cluster::ring::HashRing;
use crate::cluster::{ClusterError, Result};

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: String,
    pub address: String,
    pub added_at: DateTime<Utc>,
}

pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, NodeInfo>>,
    ring: HashRing,
}

impl NodeRegistry {
    pub fn new(virtual_nodes: usize) -> Self {
        NodeRegistry {
            nodes: RwLock::new(HashMap::new()),
            ring: HashRing::new(virtual_nodes),
        }
    }

    pub fn register(&self, node_id: &str, address: &str) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(node_id) {
            return Err(ClusterError::AlreadyRegistered(node_id.to_string()));
        }

        nodes.insert(
            node_id.to_string(),
            NodeInfo {
                id: node_id.to_string(),
                address: address.to_string(),
                added_at: Utc::now(),
            },
        );
        self.ring.add_node(node_id);
        Ok(())
    }

    pub fn unregister(&self, node_id: &str) -> Result<()> {
        let mut nodes = self.nodes.write().unwrap();
        if nodes.remove(node_id).is_none() {
            return Err(ClusterError::UnknownNode(node_id.to_string()));
        }
        self.ring.remove_node(node_id);
        Ok(())
    }

    pub fn lookup(&self, node_id: &str) -> Result<NodeInfo> {
        self.nodes
            .read()
            .unwrap()
            .get(node_id)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownNode(node_id.to_string()))
    }

    /// The node the ring holds responsible for a key.
    pub fn route_key(&self, key: &str) -> Result<NodeInfo> {
        let node_id = self.ring.route(key).ok_or(ClusterError::EmptyRing)?;
        self.lookup(&node_id)
    }

    pub fn preference_list(&self, key: &str, n: usize) -> Vec<String> {
        self.ring.preference_list(key, n)
    }

    pub fn list(&self) -> Vec<NodeInfo> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    pub fn addresses(&self) -> HashMap<String, String> {
        self.nodes
            .read()
            .unwrap()
            .iter()
            .map(|(id, info)| (id.clone(), info.address.clone()))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn key_distribution(&self, num_keys: usize) -> HashMap<String, usize> {
        self.ring.key_distribution(num_keys)
    }
}
