//! Run one raft node with a line console on stdin.
//!
//! ```text
//! raft-node --id 1 --config cluster.json
//! ```
//!
//! `cluster.json` maps node ids to addresses, optionally with timing overrides:
//!
//! ```text
//! { "nodes": { "1": "127.0.0.1:7101", "2": "127.0.0.1:7102", "3": "127.0.0.1:7103" },
//!   "raft": { "heartbeat_interval": 50 } }
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueHint};
use raft_core::{ClusterConfig, RaftNode};
use raft_node::console::{Console, Step};
use raft_node::{init_logging, spawn_node, KvStore, LogFormat, RpcServer, TcpTransport, Transport};
use raft_storage::FileStorage;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Command-line arguments for the raft node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a raft consensus node")]
struct Args {
    /// Numeric node id (must appear in the cluster config)
    #[arg(long)]
    id: u64,

    /// Cluster config file (JSON)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: PathBuf,

    /// Directory for durable term, vote and log (default: data/node-<id>)
    #[arg(long, value_hint = ValueHint::DirPath)]
    data_dir: Option<PathBuf>,

    /// `pretty` or `json`; falls back to LOG_FORMAT
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Run without the stdin console, until ctrl-c
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format.unwrap_or_else(LogFormat::from_env))
        .map_err(|e| anyhow!("failed to initialize logging: {e}"))?;

    let cluster = ClusterConfig::load(&args.config)
        .with_context(|| format!("loading cluster config {}", args.config.display()))?;
    cluster
        .validate_member(args.id)
        .with_context(|| format!("node {} is not usable with this config", args.id))?;
    let listen = cluster
        .address(args.id)
        .ok_or_else(|| anyhow!("no address for node {}", args.id))?
        .to_string();

    let data_dir = args
        .data_dir
        .unwrap_or_else(|| PathBuf::from(format!("data/node-{}", args.id)));
    let storage = FileStorage::new(&data_dir)
        .with_context(|| format!("opening storage in {}", data_dir.display()))?;
    let node = RaftNode::with_config(args.id, cluster.node_ids(), cluster.raft.clone(), storage)
        .context("restoring node state")?;

    let store = KvStore::new();
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::from_cluster(&cluster));
    let handle = spawn_node(node, store.clone(), Arc::clone(&transport));

    let server = RpcServer::bind(&listen, handle.clone())
        .await
        .with_context(|| format!("binding {listen}"))?;
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "rpc server failed");
        }
    });

    if args.no_console {
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    } else {
        let console = Console::new(handle.clone(), store, transport, cluster);
        println!("node {} listening on {listen}, type HELP for commands", args.id);
        run_console(&console).await?;
    }

    handle.shutdown().await.ok();
    Ok(())
}

async fn run_console(console: &Console) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await.context("reading stdin")? else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        match console.run_line(&line).await {
            Step::Continue(output) => output.iter().for_each(|line| println!("{line}")),
            Step::Exit => {
                println!("shutting down");
                return Ok(());
            }
        }
    }
}
