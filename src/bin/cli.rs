//! RaftKV CLI Client
//!
//! Command-line interface for a RaftKV cluster.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use raftkv::kv::KvEndpoint;
use raftkv::network::TcpKvEndpoint;
use raftkv::Clerk;

/// RaftKV CLI
#[derive(Parser, Debug)]
#[command(name = "raftkv-cli")]
#[command(about = "CLI for the RaftKV replicated key-value store")]
struct Args {
    /// Cluster addresses, comma separated
    #[arg(short, long, value_delimiter = ',', default_value = "127.0.0.1:7100")]
    servers: Vec<String>,

    /// Per-request network timeout in milliseconds
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,

    /// Give up on an operation after this many seconds
    #[arg(long, default_value = "10")]
    deadline_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key to a value
    Put {
        key: String,
        value: String,
    },

    /// Append to a key's value
    Append {
        key: String,
        value: String,
    },

    /// Ping every server
    Ping,
}

fn main() {
    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);

    let endpoints: Vec<Arc<TcpKvEndpoint>> = args
        .servers
        .iter()
        .map(|addr| Arc::new(TcpKvEndpoint::new(addr.as_str(), timeout)))
        .collect();

    if let Commands::Ping = args.command {
        let mut failed = false;
        for endpoint in &endpoints {
            match endpoint.ping() {
                Ok(()) => println!("{}: PONG", endpoint.addr()),
                Err(e) => {
                    println!("{}: {}", endpoint.addr(), e);
                    failed = true;
                }
            }
        }
        if failed {
            std::process::exit(1);
        }
        return;
    }

    let servers: Vec<Arc<dyn KvEndpoint>> = endpoints
        .into_iter()
        .map(|e| e as Arc<dyn KvEndpoint>)
        .collect();
    let mut clerk = Clerk::new(servers).with_deadline(Duration::from_secs(args.deadline_secs));

    let outcome = match args.command {
        Commands::Get { key } => clerk.get(&key).map(|value| match value {
            Some(v) => println!("{}", v),
            None => println!("(nil)"),
        }),
        Commands::Put { key, value } => clerk.put(&key, &value).map(|_| println!("OK")),
        Commands::Append { key, value } => clerk.append(&key, &value).map(|_| println!("OK")),
        Commands::Ping => Ok(()),
    };

    if let Err(e) = outcome {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
