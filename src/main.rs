use std::collections::HashMap;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use quorumkv::cluster::ClusterClient;
use quorumkv::server::run_server;
use quorumkv::storage::{LsmConfig, SyncPolicy};

#[derive(Parser)]
#[command(name = "quorumkv")]
#[command(about = "A replicated LSM-tree key-value store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Debug)]
enum SyncMode {
    /// fsync on every WAL append
    Always,
    /// fsync at most once per --sync-interval-ms
    Interval,
    /// fsync only on WAL rotation and close
    OnClose,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a storage node
    Server {
        #[arg(long, default_value = "127.0.0.1:50051")]
        addr: String,

        /// Data directory for the WAL and sorted tables
        #[arg(long, default_value = "kv_data")]
        data_dir: String,

        /// Memtable flush threshold in bytes
        #[arg(long, default_value_t = 64 * 1024 * 1024)]
        memtable_threshold: u64,

        /// Seconds between compaction checks
        #[arg(long, default_value_t = 30)]
        compaction_interval_secs: u64,

        /// Compact when more than this many sorted tables exist
        #[arg(long, default_value_t = 4)]
        compaction_trigger: usize,

        /// WAL durability policy
        #[arg(long, value_enum, default_value_t = SyncMode::OnClose)]
        sync_policy: SyncMode,

        /// Milliseconds between WAL syncs when --sync-policy interval
        #[arg(long, default_value_t = 1000)]
        sync_interval_ms: u64,
    },
    /// Issue quorum operations against a cluster of storage nodes
    Cluster {
        /// Cluster member in the form id=host:port (repeat per node)
        #[arg(long = "node", required = true)]
        nodes: Vec<String>,

        /// Directory for hinted-handoff files
        #[arg(long, default_value = "./hints")]
        hints_dir: String,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

#[derive(Subcommand)]
enum ClusterCommands {
    /// Store a key-value pair with quorum replication
    Put { key: String, value: String },
    /// Read a key with a quorum of replicas
    Get { key: String },
    /// Delete a key on a quorum of replicas
    Delete { key: String },
    /// Show storage statistics from every node
    Stats,
    /// Force compaction on every node
    Compact,
    /// Show which node is primary for a key
    Route { key: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quorumkv=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server {
            addr,
            data_dir,
            memtable_threshold,
            compaction_interval_secs,
            compaction_trigger,
            sync_policy,
            sync_interval_ms,
        } => {
            let config = LsmConfig {
                memtable_threshold,
                compaction_interval: Duration::from_secs(compaction_interval_secs),
                compaction_trigger,
                sync_policy: match sync_policy {
                    SyncMode::Always => SyncPolicy::Always,
                    SyncMode::Interval => {
                        SyncPolicy::Interval(Duration::from_millis(sync_interval_ms))
                    }
                    SyncMode::OnClose => SyncPolicy::OnClose,
                },
            };
            run_server(addr.parse()?, data_dir, config).await
        }
        Commands::Cluster {
            nodes,
            hints_dir,
            command,
        } => {
            let addresses = parse_node_specs(&nodes)?;
            let client =
                ClusterClient::connect(&addresses, std::path::Path::new(&hints_dir)).await?;
            run_cluster_command(&client, command).await
        }
    }
}

async fn run_cluster_command(
    client: &ClusterClient,
    command: ClusterCommands,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match command {
        ClusterCommands::Put { key, value } => {
            client.put(&key, value.as_bytes()).await?;
            println!("OK");
        }
        ClusterCommands::Get { key } => {
            let value = client.get(&key).await?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        ClusterCommands::Delete { key } => {
            client.delete(&key).await?;
            println!("OK");
        }
        ClusterCommands::Stats => {
            let mut all = client.all_stats().await?.into_iter().collect::<Vec<_>>();
            all.sort_by(|(a, _), (b, _)| a.cmp(b));
            for (node, stats) in all {
                println!("{}:", node);
                println!("  memtable_size:          {}", stats.memtable_size);
                println!("  num_sstables:           {}", stats.num_sstables);
                println!("  bloom_filter_hits:      {}", stats.bloom_filter_hits);
                println!("  bloom_filter_misses:    {}", stats.bloom_filter_misses);
                println!(
                    "  compactions:            {} ({} keys removed, {} bytes reclaimed)",
                    stats.compaction_total_compactions,
                    stats.compaction_total_keys_removed,
                    stats.compaction_total_bytes_reclaimed
                );
                if !stats.compaction_last_compaction.is_empty() {
                    println!("  last_compaction:        {}", stats.compaction_last_compaction);
                }
            }
            if client.hint_count() > 0 {
                println!("pending hints: {}", client.hint_count());
            }
        }
        ClusterCommands::Compact => {
            client.compact_all().await?;
            println!("OK");
        }
        ClusterCommands::Route { key } => {
            let node = client.node_for_key(&key)?;
            println!("{} -> {} ({})", key, node.id, node.address);
        }
    }
    Ok(())
}

/// Parse repeated `id=host:port` flags into an address map.
fn parse_node_specs(
    specs: &[String],
) -> Result<HashMap<String, String>, Box<dyn std::error::Error + Send + Sync>> {
    let mut addresses = HashMap::new();
    for spec in specs {
        let (id, addr) = spec
            .split_once('=')
            .ok_or_else(|| format!("invalid --node value {:?}, expected id=host:port", spec))?;
        if addresses.insert(id.to_string(), addr.to_string()).is_some() {
            return Err(format!("duplicate node id {:?}", id).into());
        }
    }
    Ok(addresses)
}
