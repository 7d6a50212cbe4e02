//! Cluster layer: consistent-hash placement, node directory, and the
//! quorum coordinator that fans client operations out to replicas.

mod client;
mod coordinator;
mod grpc;
mod registry;
mod ring;

pub use client::ClusterClient;
pub use coordinator::{Coordinator, CoordinatorConfig, ReplicaClient, ReplicaRead};
pub use grpc::GrpcReplicaClient;
pub use registry::{NodeInfo, NodeRegistry};
pub use ring::{HashRing, DEFAULT_VIRTUAL_NODES};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("node {0} already registered")]
    AlreadyRegistered(String),

    #[error("node {0} not found")]
    UnknownNode(String),

    #[error("no nodes in hash ring")]
    EmptyRing,

    /// The key is absent on every replica that answered.
    #[error("key not found")]
    NotFound,

    /// Fewer replicas participated than the quorum requires.
    #[error("{operation} quorum not reached: {successful}/{total} replicas (need {required})")]
    QuorumNotReached {
        operation: &'static str,
        successful: usize,
        required: usize,
        total: usize,
    },

    #[error("hint capacity reached for node {0}")]
    HintCapacity(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hint file error: {0}")]
    HintFile(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
