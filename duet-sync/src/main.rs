//! duet-server: sync server for the collaborative editor.
//!
//! Without `--redis-url` the server runs as a single node with an in-process
//! coordination store; without `--data-dir` snapshots live in memory.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use duet_sync::config::{CoordinationConfig, ServerConfig};
use duet_sync::coordination::{CoordinationStore, MemoryHub, MemoryStore, RedisStore};
use duet_sync::gateway::SyncGateway;
use duet_sync::maintenance::Maintenance;
use duet_sync::rooms::RoomDirectory;
use duet_sync::runtime::DocumentRegistry;
use duet_sync::server::SyncServer;
use duet_sync::storage::{MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig};

/// Real-time document sync server.
#[derive(Parser)]
#[command(name = "duet-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long, env = "DUET_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long, env = "DUET_BIND")]
    bind: Option<String>,

    /// Redis URL for the shared replication log
    #[arg(long, env = "DUET_REDIS_URL")]
    redis_url: Option<String>,

    /// RocksDB directory for durable snapshots
    #[arg(short, long, env = "DUET_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Per-document size limit in bytes
    #[arg(long)]
    max_document_bytes: Option<u64>,

    /// Room codes to create at startup (single-node directory)
    #[arg(long = "room")]
    rooms: Vec<String>,
}

impl Args {
    fn into_config(self) -> Result<(ServerConfig, Vec<String>), Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(url) = self.redis_url {
            let coordination = config.coordination.get_or_insert_with(CoordinationConfig::default);
            coordination.url = url;
        }
        if let Some(path) = self.data_dir {
            let storage = config.storage.get_or_insert_with(StoreConfig::default);
            storage.path = path;
        }
        if let Some(limit) = self.max_document_bytes {
            config.runtime.max_document_bytes = limit;
        }
        Ok((config, self.rooms))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let (config, rooms) = Args::parse().into_config()?;

    let coordination: Arc<dyn CoordinationStore> = match &config.coordination {
        Some(redis) => {
            info!("Using Redis coordination at {}", redis.url);
            Arc::new(RedisStore::connect(redis).await?)
        }
        None => {
            info!("Using in-process coordination (single node)");
            Arc::new(MemoryStore::connect(&MemoryHub::new()))
        }
    };

    let snapshots: Arc<dyn SnapshotStore> = match &config.storage {
        Some(storage) => {
            info!("Opening snapshot store at {}", storage.path.display());
            Arc::new(RocksSnapshotStore::open(storage.clone())?)
        }
        None => {
            info!("Using in-memory snapshot store");
            Arc::new(MemorySnapshotStore::new())
        }
    };

    let directory = Arc::new(RoomDirectory::new(snapshots.clone()));
    for code in &rooms {
        let room = directory.create_room(code.as_str(), None).await?;
        info!("Room {:?} -> document {}", room.code, room.doc_id);
    }

    let registry = DocumentRegistry::new(coordination, snapshots, config.runtime.clone());
    let gateway = Arc::new(SyncGateway::new(
        registry.clone(),
        directory.clone(),
        directory.clone(),
    ));

    let maintenance = Arc::new(Maintenance::new(
        registry,
        directory,
        config.maintenance.clone(),
    ));
    let _maintenance = maintenance.spawn();

    let server = SyncServer::new(config, gateway);
    server.run().await.map_err(|e| -> Box<dyn std::error::Error> { e })
}
