//! # console
//!
//! why: let an operator drive a node from stdin
//! relations: parses lines for the node binary; writes go through NodeHandle,
//! reads hit the local KvStore
//! what: ConsoleCommand parsing, Console::run_line
//!
//! Only PUT, DELETE and SUBMIT go through the replicated log. GET reads the local
//! copy of the store, which may lag the leader.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use raft_core::ClusterConfig;
use tokio::time::timeout;

use crate::error::NodeError;
use crate::handle::NodeHandle;
use crate::kv::{KvCommand, KvOutcome, KvStore};
use crate::status::cluster_status;
use crate::transport::Transport;

/// How long PUT and DELETE wait for their entry to apply locally.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands that can be entered at the prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Replicate the rest of the line as raw bytes.
    Submit { payload: String },
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    Status,
    Cluster,
    Campaign,
    Stop,
    Resume,
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parse one line of input. Command words are case-insensitive:
    /// - `SUBMIT <text>` (alias: `sub`)
    /// - `PUT <key> <value>` (alias: `p`), the value may contain spaces
    /// - `GET <key>` (alias: `g`)
    /// - `DELETE <key>` (aliases: `del`, `d`)
    /// - `STATUS` (alias: `s`), `CLUSTER` (alias: `cl`), `CAMPAIGN` (alias: `c`)
    /// - `STOP`, `RESUME`, `HELP` (alias: `h`), `EXIT` (aliases: `e`, `quit`, `q`)
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized = match cmd.as_str() {
            "SUB" => "SUBMIT",
            "P" => "PUT",
            "G" => "GET",
            "D" | "DEL" => "DELETE",
            "S" => "STATUS",
            "CL" => "CLUSTER",
            "C" => "CAMPAIGN",
            "H" => "HELP",
            "E" | "Q" | "QUIT" => "EXIT",
            other => other,
        };

        match (normalized, parts.len()) {
            ("STATUS", 1) => Ok(Self::Status),
            ("CLUSTER", 1) => Ok(Self::Cluster),
            ("CAMPAIGN", 1) => Ok(Self::Campaign),
            ("STOP", 1) => Ok(Self::Stop),
            ("RESUME", 1) => Ok(Self::Resume),
            ("HELP", 1) => Ok(Self::Help),
            ("EXIT", 1) => Ok(Self::Exit),
            ("SUBMIT", n) if n > 1 => Ok(Self::Submit {
                payload: parts[1..].join(" "),
            }),
            ("PUT", n) if n > 2 => Ok(Self::Put {
                key: parts[1].to_string(),
                value: parts[2..].join(" "),
            }),
            ("GET", 2) => Ok(Self::Get {
                key: parts[1].to_string(),
            }),
            ("DELETE", 2) => Ok(Self::Delete {
                key: parts[1].to_string(),
            }),
            ("SUBMIT", _) => Err(anyhow!("SUBMIT requires a payload: SUBMIT <text>")),
            ("PUT", _) => Err(anyhow!("PUT requires a key and a value: PUT <key> <value>")),
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("DELETE", _) => Err(anyhow!("DELETE requires exactly one argument: DELETE <key>")),
            ("STATUS" | "CLUSTER" | "CAMPAIGN" | "STOP" | "RESUME" | "HELP" | "EXIT", _) => {
                Err(anyhow!("{normalized} takes no arguments"))
            }
            _ => Err(anyhow!("invalid command, type HELP for the command list")),
        }
    }
}

const HELP: &[&str] = &[
    "Commands (case-insensitive):",
    "  SUBMIT <text>      (alias: sub)  -- append raw bytes to the log",
    "  PUT <key> <value>  (alias: p)    -- replicate a write, wait for it to apply",
    "  GET <key>          (alias: g)    -- read the local store",
    "  DELETE <key>       (alias: d)    -- replicate a delete",
    "  STATUS             (alias: s)    -- show this node's state",
    "  CLUSTER            (alias: cl)   -- query every node's state",
    "  CAMPAIGN           (alias: c)    -- start an election now",
    "  STOP / RESUME                    -- leave / rejoin the cluster",
    "  HELP               (alias: h)    -- show this message",
    "  EXIT               (alias: e)    -- shut down this node",
];

/// Result of running one console line.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Continue(Vec<String>),
    Exit,
}

/// Everything the console needs to serve one node.
pub struct Console {
    handle: NodeHandle,
    store: KvStore,
    transport: Arc<dyn Transport>,
    cluster: ClusterConfig,
}

impl Console {
    pub fn new(handle: NodeHandle, store: KvStore, transport: Arc<dyn Transport>, cluster: ClusterConfig) -> Self {
        Self {
            handle,
            store,
            transport,
            cluster,
        }
    }

    pub async fn run_line(&self, line: &str) -> Step {
        match ConsoleCommand::parse(line) {
            Ok(ConsoleCommand::Exit) => Step::Exit,
            Ok(command) => Step::Continue(self.execute(command).await),
            Err(e) => Step::Continue(vec![format!("ERROR: {e}")]),
        }
    }

    pub async fn execute(&self, command: ConsoleCommand) -> Vec<String> {
        match command {
            ConsoleCommand::Submit { payload } => match self.handle.submit(payload.into_bytes()).await {
                Ok(accepted) => vec![format!("accepted at index {} (term {})", accepted.index, accepted.term)],
                Err(e) => vec![describe(&e)],
            },
            ConsoleCommand::Put { key, value } => {
                let command = KvCommand::Put {
                    key: key.clone(),
                    value: value.clone(),
                };
                match self.replicate(&command).await {
                    Ok(_) => vec![format!("OK: {key} = {value}")],
                    Err(e) => vec![e],
                }
            }
            ConsoleCommand::Delete { key } => match self.replicate(&KvCommand::Delete { key: key.clone() }).await {
                Ok(KvOutcome::Deleted { previous: Some(_) }) => vec![format!("OK: deleted {key}")],
                Ok(_) => vec![format!("{key} not found")],
                Err(e) => vec![e],
            },
            ConsoleCommand::Get { key } => match self.store.get(&key) {
                Some(value) => vec![format!("{key} = {value}")],
                None => vec![format!("{key} not found")],
            },
            ConsoleCommand::Status => match self.handle.status().await {
                Ok(status) => {
                    let mut lines = vec![status.to_string()];
                    let data = self.store.snapshot();
                    if data.is_empty() {
                        lines.push("  store: empty".to_string());
                    }
                    lines.extend(data.iter().map(|(k, v)| format!("  {k} = {v}")));
                    lines
                }
                Err(e) => vec![describe(&e)],
            },
            ConsoleCommand::Cluster => cluster_status(self.transport.as_ref(), &self.cluster)
                .await
                .iter()
                .map(ToString::to_string)
                .collect(),
            ConsoleCommand::Campaign => match self.handle.campaign().await {
                Ok(()) => vec!["election started".to_string()],
                Err(e) => vec![describe(&e)],
            },
            ConsoleCommand::Stop => match self.handle.stop().await {
                Ok(()) => vec!["node stopped".to_string()],
                Err(e) => vec![describe(&e)],
            },
            ConsoleCommand::Resume => match self.handle.resume().await {
                Ok(()) => vec!["node resumed".to_string()],
                Err(e) => vec![describe(&e)],
            },
            ConsoleCommand::Help => HELP.iter().map(|line| line.to_string()).collect(),
            ConsoleCommand::Exit => vec!["shutting down".to_string()],
        }
    }

    async fn replicate(&self, command: &KvCommand) -> Result<KvOutcome, String> {
        let bytes = command.encode().map_err(|e| format!("ERROR: {e}"))?;
        let result = timeout(WRITE_TIMEOUT, self.handle.write(bytes))
            .await
            .map_err(|_| "ERROR: timed out waiting for the write to apply".to_string())?
            .map_err(|e| describe(&e))?;
        KvOutcome::decode(&result).map_err(|e| format!("ERROR: bad apply result: {e}"))
    }
}

fn describe(error: &NodeError) -> String {
    match error {
        NodeError::NotLeader { leader_hint: Some(leader) } => {
            format!("ERROR: not the leader, try node {leader}")
        }
        NodeError::NotLeader { leader_hint: None } => "ERROR: not the leader, no leader known".to_string(),
        other => format!("ERROR: {other}"),
    }
}
