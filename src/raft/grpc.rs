//! gRPC surface for Raft: a tonic service delegating to the node's
//! handlers, and a client-side transport that dials peers by address.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tonic::{Request, Response, Status};

use crate::raft::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, RaftNode, RaftTransport,
    RequestVoteRequest, RequestVoteResponse, TransportError,
};

pub mod proto {
    tonic::include_proto!("raft");
}

use proto::raft_client::RaftClient;
use proto::raft_server::{Raft, RaftServer};

pub struct RaftRpcService {
    node: RaftNode,
}

/// Wrap a node as a tonic service ready to be added to a server builder.
pub fn raft_service(node: RaftNode) -> RaftServer<RaftRpcService> {
    RaftServer::new(RaftRpcService { node })
}

#[tonic::async_trait]
impl Raft for RaftRpcService {
    async fn request_vote(
        &self,
        request: Request<proto::RequestVoteRequest>,
    ) -> Result<Response<proto::RequestVoteResponse>, Status> {
        let req = request.into_inner();
        let response = self.node.handle_request_vote(RequestVoteRequest {
            term: req.term,
            candidate_id: req.candidate_id,
            last_log_index: req.last_log_index,
            last_log_term: req.last_log_term,
        });
        Ok(Response::new(proto::RequestVoteResponse {
            term: response.term,
            vote_granted: response.vote_granted,
        }))
    }

    async fn append_entries(
        &self,
        request: Request<proto::AppendEntriesRequest>,
    ) -> Result<Response<proto::AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        let response = self.node.handle_append_entries(AppendEntriesRequest {
            term: req.term,
            leader_id: req.leader_id,
            prev_log_index: req.prev_log_index,
            prev_log_term: req.prev_log_term,
            entries: req
                .entries
                .into_iter()
                .map(|e| LogEntry {
                    index: e.index,
                    term: e.term,
                    command: e.command,
                })
                .collect(),
            leader_commit: req.leader_commit,
        });
        Ok(Response::new(proto::AppendEntriesResponse {
            term: response.term,
            success: response.success,
            conflict_term: response.conflict_term,
            conflict_index: response.conflict_index,
        }))
    }
}

/// Per-RPC deadline; failed or slow peers count as no response.
const RPC_TIMEOUT: Duration = Duration::from_millis(300);

/// Client transport dialing each peer's address per call.
pub struct GrpcRaftTransport {
    peer_addresses: HashMap<String, String>,
}

impl GrpcRaftTransport {
    pub fn new(peer_addresses: HashMap<String, String>) -> Self {
        GrpcRaftTransport { peer_addresses }
    }

    async fn connect(&self, peer_id: &str) -> Result<RaftClient<tonic::transport::Channel>, TransportError> {
        let address = self
            .peer_addresses
            .get(peer_id)
            .ok_or_else(|| TransportError(format!("no address for peer {}", peer_id)))?;
        let endpoint = if address.starts_with("http") {
            address.clone()
        } else {
            format!("http://{}", address)
        };
        RaftClient::connect(endpoint)
            .await
            .map_err(|e| TransportError(format!("connect to {}: {}", peer_id, e)))
    }
}

#[async_trait]
impl RaftTransport for GrpcRaftTransport {
    async fn request_vote(
        &self,
        peer_id: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        let call = async {
            let mut client = self.connect(peer_id).await?;
            let response = client
                .request_vote(proto::RequestVoteRequest {
                    term: request.term,
                    candidate_id: request.candidate_id,
                    last_log_index: request.last_log_index,
                    last_log_term: request.last_log_term,
                })
                .await
                .map_err(|e| TransportError(e.to_string()))?
                .into_inner();
            Ok(RequestVoteResponse {
                term: response.term,
                vote_granted: response.vote_granted,
            })
        };
        tokio::time::timeout(RPC_TIMEOUT, call)
            .await
            .map_err(|_| TransportError(format!("request_vote to {} timed out", peer_id)))?
    }

    async fn append_entries(
        &self,
        peer_id: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let call = async {
            let mut client = self.connect(peer_id).await?;
            let response = client
                .append_entries(proto::AppendEntriesRequest {
                    term: request.term,
                    leader_id: request.leader_id,
                    prev_log_index: request.prev_log_index,
                    prev_log_term: request.prev_log_term,
                    entries: request
                        .entries
                        .into_iter()
                        .map(|e| proto::LogEntry {
                            index: e.index,
                            term: e.term,
                            command: e.command,
                        })
                        .collect(),
                    leader_commit: request.leader_commit,
                })
                .await
                .map_err(|e| TransportError(e.to_string()))?
                .into_inner();
            Ok(AppendEntriesResponse {
                term: response.term,
                success: response.success,
                conflict_term: response.conflict_term,
                conflict_index: response.conflict_index,
            })
        };
        tokio::time::timeout(RPC_TIMEOUT, call)
            .await
            .map_err(|_| TransportError(format!("append_entries to {} timed out", peer_id)))?
    }
}
