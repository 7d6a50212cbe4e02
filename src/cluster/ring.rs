//! Consistent hash ring with virtual nodes. Both keys and nodes hash onto
//! a 32-bit circle; a key belongs to the first node position at or after
//! its own, wrapping around.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Virtual points per physical node. More points even out the key
/// distribution at the cost of a larger ring.
pub const DEFAULT_VIRTUAL_NODES: usize = 256;

struct RingState {
    /// ring position -> physical node id
    ring: HashMap<u32, String>,
    /// ascending ring positions for binary search
    sorted_hashes: Vec<u32>,
    nodes: HashSet<String>,
}

pub struct HashRing {
    virtual_nodes: usize,
    state: RwLock<RingState>,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        let virtual_nodes = if virtual_nodes == 0 {
            DEFAULT_VIRTUAL_NODES
        } else {
            virtual_nodes
        };
        HashRing {
            virtual_nodes,
            state: RwLock::new(RingState {
                ring: HashMap::new(),
                sorted_hashes: Vec::new(),
                nodes: HashSet::new(),
            }),
        }
    }

    /// Add a physical node and its virtual points. Adding a node that is
    /// already present is a no-op.
    pub fn add_node(&self, node_id: &str) {
        let mut state = self.state.write().unwrap();
        if !state.nodes.insert(node_id.to_string()) {
            return;
        }

        for i in 0..self.virtual_nodes {
            let hash = hash_key(&format!("{}-vnode-{}", node_id, i));
            state.ring.insert(hash, node_id.to_string());
            state.sorted_hashes.push(hash);
        }
        state.sorted_hashes.sort_unstable();
    }

    /// Remove a physical node and all of its virtual points. Unknown nodes
    /// are a no-op, so add followed by remove restores the prior ring.
    pub fn remove_node(&self, node_id: &str) {
        let mut state = self.state.write().unwrap();
        if !state.nodes.remove(node_id) {
            return;
        }

        let RingState {
            ring,
            sorted_hashes,
            ..
        } = &mut *state;
        sorted_hashes.retain(|hash| {
            if ring.get(hash).map(|n| n.as_str()) == Some(node_id) {
                ring.remove(hash);
                false
            } else {
                true
            }
        });
    }

    /// The node responsible for a key, or `None` on an empty ring.
    pub fn route(&self, key: &str) -> Option<String> {
        let state = self.state.read().unwrap();
        if state.sorted_hashes.is_empty() {
            return None;
        }

        let hash = hash_key(key);
        let idx = state.sorted_hashes.partition_point(|h| *h < hash);
        let idx = if idx >= state.sorted_hashes.len() { 0 } else { idx };
        state.ring.get(&state.sorted_hashes[idx]).cloned()
    }

    /// Walk clockwise from the key's position collecting the first `n`
    /// distinct physical nodes: the primary plus its successors. Shorter
    /// than `n` only when the cluster itself is.
    pub fn preference_list(&self, key: &str, n: usize) -> Vec<String> {
        let state = self.state.read().unwrap();
        if state.sorted_hashes.is_empty() {
            return Vec::new();
        }

        let n = n.min(state.nodes.len());
        let hash = hash_key(key);
        let mut idx = state.sorted_hashes.partition_point(|h| *h < hash);
        if idx >= state.sorted_hashes.len() {
            idx = 0;
        }

        let mut result = Vec::with_capacity(n);
        let mut seen: HashSet<&str> = HashSet::new();
        while result.len() < n && seen.len() < state.nodes.len() {
            let node = &state.ring[&state.sorted_hashes[idx]];
            if seen.insert(node.as_str()) {
                result.push(node.clone());
            }
            idx = (idx + 1) % state.sorted_hashes.len();
        }
        result
    }

    pub fn nodes(&self) -> Vec<String> {
        self.state.read().unwrap().nodes.iter().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().unwrap().nodes.len()
    }

    /// Simulate placing `num_keys` synthetic keys and count per node.
    pub fn key_distribution(&self, num_keys: usize) -> HashMap<String, usize> {
        let mut distribution = HashMap::new();
        for i in 0..num_keys {
            if let Some(node) = self.route(&format!("key_{}", i)) {
                *distribution.entry(node).or_insert(0) += 1;
            }
        }
        distribution
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<(u32, String)> {
        let state = self.state.read().unwrap();
        let mut entries: Vec<(u32, String)> = state
            .ring
            .iter()
            .map(|(h, n)| (*h, n.clone()))
            .collect();
        entries.sort();
        entries
    }
}

/// Ring position of a key: the big-endian 32-bit prefix of its MD5 digest.
/// MD5 is stable across runs, which keeps routing deterministic.
fn hash_key(key: &str) -> u32 {
    let digest = md5::compute(key.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}
