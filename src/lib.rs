use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use tokio::net::TcpListener;

pub mod ccm;
pub mod error;
pub mod executor;
pub mod lexer;
pub mod planner;
pub mod processor;
pub mod protocol;
pub mod storage;
pub mod types;
pub mod wal;

use crate::ccm::ProtocolKind;
use crate::processor::QueryProcessor;
use crate::storage::{FileStore, TableStore};
use crate::wal::{RecoverCriteria, RecoveryManager, WalManager};

/// Server configuration
#[derive(Clone)]
pub struct Config {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Directory for data files, the catalog, and the WAL
    pub data_dir: PathBuf,
    /// Concurrency-control protocol for this process
    pub protocol: ProtocolKind,
    /// Buffered WAL records before an automatic checkpoint
    pub checkpoint_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5432".parse().expect("invalid default bind address"),
            data_dir: PathBuf::from("./data"),
            protocol: ProtocolKind::LockBased,
            checkpoint_threshold: 1000,
        }
    }
}

/// The database server
pub struct Server {
    config: Config,
    processor: Arc<QueryProcessor>,
}

impl Server {
    /// Create a new server: open storage, run crash recovery, open the WAL
    /// where recovery left off, and wire up the processor.
    pub fn new(config: Config) -> error::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let storage: Arc<dyn TableStore> = Arc::new(FileStore::open(config.data_dir.clone())?);

        let recovery = RecoveryManager::new(config.data_dir.clone());
        let outcome = recovery.recover(storage.as_ref(), &RecoverCriteria::default())?;

        let wal = Arc::new(WalManager::open(
            &config.data_dir,
            outcome.next_lsn,
            config.checkpoint_threshold,
        )?);
        let ccm = ccm::build(config.protocol);
        let processor = Arc::new(QueryProcessor::new(storage, ccm, wal));

        Ok(Self { config, processor })
    }

    /// Shared processor handle (used by tests driving the server directly).
    pub fn processor(&self) -> Arc<QueryProcessor> {
        Arc::clone(&self.processor)
    }

    /// Run the server, accepting connections until the process exits.
    pub async fn run(&self) -> error::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("basalt listening on {}", self.config.bind_addr);
        info!("data directory: {:?}", self.config.data_dir);
        info!("concurrency protocol: {:?}", self.config.protocol);

        protocol::serve(listener, Arc::clone(&self.processor)).await
    }

    /// Serve on an already-bound listener (integration tests bind an
    /// ephemeral port themselves).
    pub async fn serve_on(&self, listener: TcpListener) -> error::Result<()> {
        protocol::serve(listener, Arc::clone(&self.processor)).await
    }
}
