//! Storage-node gRPC service: the client-facing Put/Get/Delete surface and
//! the replica-internal ReplicaPut/ReplicaGet used by the cluster
//! coordinator, all over one LSM engine.

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::replication::{generate_timestamp, generate_version};
use crate::storage::{LsmConfig, LsmStore, StoreError};

pub mod kv {
    tonic::include_proto!("kv");
}

use kv::kv_store_server::{KvStore, KvStoreServer};

/// Every value stored through the server is framed with the write's
/// `[timestamp: i64 LE][version: i64 LE]` so replica reads can report the
/// version they hold. Replica writes use the coordinator's pair verbatim;
/// that is what lets read repair converge.
const VERSION_HEADER_SIZE: usize = 16;

fn encode_versioned(timestamp: i64, version: i64, value: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(VERSION_HEADER_SIZE + value.len());
    record.extend_from_slice(&timestamp.to_le_bytes());
    record.extend_from_slice(&version.to_le_bytes());
    record.extend_from_slice(value);
    record
}

fn decode_versioned(record: &[u8]) -> Result<(i64, i64, Vec<u8>), StoreError> {
    if record.len() < VERSION_HEADER_SIZE {
        return Err(StoreError::Corruption(
            "stored record shorter than version header".to_string(),
        ));
    }
    let timestamp = i64::from_le_bytes(record[0..8].try_into().unwrap());
    let version = i64::from_le_bytes(record[8..16].try_into().unwrap());
    Ok((timestamp, version, record[VERSION_HEADER_SIZE..].to_vec()))
}

pub struct KvService {
    store: Arc<LsmStore>,
}

impl KvService {
    pub fn new(store: Arc<LsmStore>) -> Self {
        KvService { store }
    }
}

#[tonic::async_trait]
impl KvStore for KvService {
    async fn put(
        &self,
        request: Request<kv::PutRequest>,
    ) -> Result<Response<kv::PutResponse>, Status> {
        let req = request.into_inner();
        debug!(key = %req.key, bytes = req.value.len(), "put");

        let timestamp = generate_timestamp();
        let version = generate_version(timestamp);
        let record = encode_versioned(timestamp, version, &req.value);
        match self.store.put(req.key.as_bytes(), &record) {
            Ok(()) => Ok(Response::new(kv::PutResponse {
                success: true,
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(kv::PutResponse {
                success: false,
                error: e.to_string(),
            })),
        }
    }

    async fn get(
        &self,
        request: Request<kv::GetRequest>,
    ) -> Result<Response<kv::GetResponse>, Status> {
        let req = request.into_inner();
        debug!(key = %req.key, "get");

        match self.store.get(req.key.as_bytes()) {
            Ok(record) => {
                let (_, _, value) = decode_versioned(&record).map_err(Status::from)?;
                Ok(Response::new(kv::GetResponse {
                    value,
                    found: true,
                    error: String::new(),
                }))
            }
            Err(StoreError::NotFound) => Ok(Response::new(kv::GetResponse {
                value: Vec::new(),
                found: false,
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(kv::GetResponse {
                value: Vec::new(),
                found: false,
                error: e.to_string(),
            })),
        }
    }

    async fn delete(
        &self,
        request: Request<kv::DeleteRequest>,
    ) -> Result<Response<kv::DeleteResponse>, Status> {
        let req = request.into_inner();
        debug!(key = %req.key, "delete");

        match self.store.delete(req.key.as_bytes()) {
            Ok(()) => Ok(Response::new(kv::DeleteResponse {
                success: true,
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(kv::DeleteResponse {
                success: false,
                error: e.to_string(),
            })),
        }
    }

    async fn replica_put(
        &self,
        request: Request<kv::ReplicaPutRequest>,
    ) -> Result<Response<kv::ReplicaPutResponse>, Status> {
        let req = request.into_inner();
        debug!(key = %req.key, timestamp = req.timestamp, version = req.version, "replica put");

        // The coordinator's timestamp/version is authoritative.
        let record = encode_versioned(req.timestamp, req.version, &req.value);
        let success = self.store.put(req.key.as_bytes(), &record).is_ok();
        Ok(Response::new(kv::ReplicaPutResponse { success }))
    }

    async fn replica_get(
        &self,
        request: Request<kv::ReplicaGetRequest>,
    ) -> Result<Response<kv::ReplicaGetResponse>, Status> {
        let req = request.into_inner();
        debug!(key = %req.key, "replica get");

        match self.store.get(req.key.as_bytes()) {
            Ok(record) => {
                let (timestamp, version, value) =
                    decode_versioned(&record).map_err(Status::from)?;
                Ok(Response::new(kv::ReplicaGetResponse {
                    value,
                    found: true,
                    timestamp,
                    version,
                }))
            }
            Err(StoreError::NotFound) => Ok(Response::new(kv::ReplicaGetResponse {
                value: Vec::new(),
                found: false,
                timestamp: 0,
                version: 0,
            })),
            Err(e) => Err(Status::from(e)),
        }
    }

    async fn stats(
        &self,
        _request: Request<kv::StatsRequest>,
    ) -> Result<Response<kv::StatsResponse>, Status> {
        let stats = self.store.stats();
        Ok(Response::new(kv::StatsResponse {
            memtable_size: stats.memtable_size as i64,
            num_sstables: stats.num_sstables as i32,
            bloom_filter_hits: stats.bloom_filter_hits,
            bloom_filter_misses: stats.bloom_filter_misses,
            compaction_total_compactions: stats.compaction.total_compactions,
            compaction_total_keys_removed: stats.compaction.total_keys_removed,
            compaction_total_bytes_reclaimed: stats.compaction.total_bytes_reclaimed,
            compaction_last_compaction: stats.compaction.last_compaction,
        }))
    }

    async fn compact(
        &self,
        _request: Request<kv::CompactRequest>,
    ) -> Result<Response<kv::CompactResponse>, Status> {
        info!("manual compaction requested");
        match self.store.compact() {
            Ok(()) => Ok(Response::new(kv::CompactResponse {
                success: true,
                error: String::new(),
            })),
            Err(e) => Ok(Response::new(kv::CompactResponse {
                success: false,
                error: e.to_string(),
            })),
        }
    }
}

/// Open the engine over `data_dir` and serve the KV service until the
/// process ends.
pub async fn run_server(
    addr: SocketAddr,
    data_dir: String,
    config: LsmConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let store = Arc::new(LsmStore::open(std::path::Path::new(&data_dir), config)?);
    let service = KvService::new(Arc::clone(&store));

    info!(%addr, data_dir, "storage node listening");
    Server::builder()
        .add_service(KvStoreServer::new(service))
        .serve(addr)
        .await?;

    store.close()?;
    Ok(())
}
