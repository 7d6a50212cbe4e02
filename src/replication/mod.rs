//! Replication semantics shared by the cluster coordinator: quorum
//! accounting, last-write-wins conflict resolution, read-repair target
//! selection, and the durable hinted-handoff queue.

mod hints;

pub use hints::{Hint, HintStore, DEFAULT_HINT_MAX_AGE, DEFAULT_MAX_HINTS_PER_NODE};

use std::time::{SystemTime, UNIX_EPOCH};

/// N: replicas per key.
pub const REPLICATION_FACTOR: usize = 3;
/// W: acknowledgements required for a write to succeed.
pub const WRITE_QUORUM: usize = 2;
/// R: responses required for a read to succeed. W + R > N gives
/// read-your-writes for a single client in the absence of concurrent
/// writers.
pub const READ_QUORUM: usize = 2;

/// One replica's answer to a fanned-out operation.
#[derive(Debug, Clone)]
pub struct ReplicaResponse {
    pub node_id: String,
    pub success: bool,
    pub value: Vec<u8>,
    pub version: i64,
    pub timestamp: i64,
    pub error: Option<String>,
}

/// Last-write-wins: highest timestamp wins, ties broken by the larger
/// version number.
pub fn resolve_conflict(responses: &[ReplicaResponse]) -> Option<&ReplicaResponse> {
    let mut latest = responses.first()?;
    for resp in &responses[1..] {
        if resp.timestamp > latest.timestamp
            || (resp.timestamp == latest.timestamp && resp.version > latest.version)
        {
            latest = resp;
        }
    }
    Some(latest)
}

pub fn quorum_reached(responses: &[ReplicaResponse], quorum: usize) -> bool {
    responses.iter().filter(|r| r.success).count() >= quorum
}

/// Coordinator-generated write timestamp: nanoseconds since the epoch.
/// Replicas never regenerate it.
pub fn generate_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub fn generate_version(timestamp: i64) -> i64 {
    timestamp
}

/// True when the answering replicas disagree on (timestamp, version).
pub fn needs_read_repair(responses: &[ReplicaResponse]) -> bool {
    match responses.split_first() {
        Some((first, rest)) => rest
            .iter()
            .any(|r| r.timestamp != first.timestamp || r.version != first.version),
        None => false,
    }
}

/// Replicas whose answer is older than the winner's: strictly older
/// timestamp, or the same timestamp with a smaller version.
pub fn outdated_replicas(responses: &[ReplicaResponse], winner: &ReplicaResponse) -> Vec<String> {
    responses
        .iter()
        .filter(|r| {
            r.node_id != winner.node_id
                && (r.timestamp < winner.timestamp
                    || (r.timestamp == winner.timestamp && r.version < winner.version))
        })
        .map(|r| r.node_id.clone())
        .collect()
}
