//! Transport seam for Raft RPCs. Production nodes speak gRPC; tests wire a
//! cluster together in-process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, RaftNode, RequestVoteRequest,
    RequestVoteResponse, TransportError,
};

#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        peer_id: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn append_entries(
        &self,
        peer_id: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;
}

/// Delivers RPCs by calling the target node's handlers directly.
/// Disconnected nodes behave like crashed ones: every call errors.
#[derive(Default)]
pub struct InMemoryNetwork {
    nodes: RwLock<HashMap<String, RaftNode>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: RaftNode) {
        self.nodes
            .write()
            .unwrap()
            .insert(node.id().to_string(), node);
    }

    pub fn disconnect(&self, node_id: &str) {
        self.nodes.write().unwrap().remove(node_id);
    }

    fn node(&self, node_id: &str) -> Result<RaftNode, TransportError> {
        self.nodes
            .read()
            .unwrap()
            .get(node_id)
            .cloned()
            .ok_or_else(|| TransportError(format!("node {} unreachable", node_id)))
    }
}

#[async_trait]
impl RaftTransport for InMemoryNetwork {
    async fn request_vote(
        &self,
        peer_id: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        Ok(self.node(peer_id)?.handle_request_vote(request))
    }

    async fn append_entries(
        &self,
        peer_id: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        Ok(self.node(peer_id)?.handle_append_entries(request))
    }
}
