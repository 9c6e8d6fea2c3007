//! RaftKV Server Binary
//!
//! Runs one replica: raft node, KV service and TCP listener.

use std::sync::Arc;

use clap::Parser;
use raftkv::network::{Server, TcpTransport};
use raftkv::persist::FilePersister;
use raftkv::{Config, KvServer};
use tracing_subscriber::{fmt, EnvFilter};

/// RaftKV Server
#[derive(Parser, Debug)]
#[command(name = "raftkv-server")]
#[command(about = "Replica of a Raft-replicated key-value store")]
#[command(version)]
struct Args {
    /// This node's index in --peers
    #[arg(short, long)]
    id: usize,

    /// Addresses of every node in the cluster, in id order
    #[arg(short, long, value_delimiter = ',', required = true)]
    peers: Vec<String>,

    /// Root data directory; state goes to <data-dir>/node-<id>
    #[arg(short, long, default_value = "./raftkv_data")]
    data_dir: String,

    /// Snapshot once the raft state reaches this many bytes
    #[arg(short, long)]
    max_raft_state: Option<usize>,

    /// Seed for the election timer RNG
    #[arg(long)]
    seed: Option<u64>,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,raftkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    let listen = match args.peers.get(args.id) {
        Some(addr) => addr.clone(),
        None => {
            tracing::error!("--id {} is outside the {} listed peers", args.id, args.peers.len());
            std::process::exit(2);
        }
    };

    tracing::info!("RaftKV Server v{}", raftkv::VERSION);
    tracing::info!("Node {} of {}", args.id, args.peers.len());
    tracing::info!("Data directory: {}", args.data_dir);
    tracing::info!("Listen address: {}", listen);

    let mut builder = Config::builder()
        .data_dir(&args.data_dir)
        .listen_addr(listen)
        .max_raft_state(args.max_raft_state);
    if let Some(seed) = args.seed {
        builder = builder.rng_seed(seed);
    }
    let config = builder.build();

    let node_dir = config.data_dir.join(format!("node-{}", args.id));
    let persister = match FilePersister::open(&node_dir) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            tracing::error!("Failed to open persisted state in {}: {}", node_dir.display(), e);
            std::process::exit(1);
        }
    };

    let transport = Arc::new(TcpTransport::new(args.peers.clone(), config.rpc_timeout));
    let node = match KvServer::start(args.id, args.peers.len(), &config, transport, persister) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("Failed to start node: {}", e);
            std::process::exit(1);
        }
    };

    let mut server = match Server::start(&config, node.clone()) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", config.listen_addr, e);
            node.kill();
            std::process::exit(1);
        }
    };

    server.wait();
    node.kill();
    tracing::info!("Server stopped");
}
