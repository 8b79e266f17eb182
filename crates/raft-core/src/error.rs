//! # error
//!
//! why: give every failure in the consensus core a typed, matchable shape
//! relations: returned by node.rs, storage implementations and config loading
//! what: StorageError, ConfigError, RaftError

use crate::NodeId;

/// Failure to read or write durable raft state.
///
/// Any write failure is fatal to the node that observes it: continuing without the
/// write could re-grant a vote or lose an acknowledged entry.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("corrupt log: {0}")]
    Corrupt(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Invalid cluster or timing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("election timeout: min({min}) must be < max({max})")]
    ElectionTimeout { min: u64, max: u64 },

    #[error("election_timeout_min({election_timeout_min}) must be > heartbeat_interval({heartbeat_interval})")]
    ElectionTimeoutLTHeartBeat {
        election_timeout_min: u64,
        heartbeat_interval: u64,
    },

    #[error("rpc_timeout({rpc_timeout}) must be <= election_timeout_min({election_timeout_min})")]
    RpcTimeoutGTElectionTimeout {
        rpc_timeout: u64,
        election_timeout_min: u64,
    },

    #[error("{name} must be > 0")]
    Zero { name: &'static str },

    #[error("cluster configuration lists no nodes")]
    EmptyCluster,

    #[error("node {0} is not a member of the cluster configuration")]
    UnknownNode(NodeId),

    #[error("failed to read cluster configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse cluster configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors surfaced by [`crate::RaftNode`] operations.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("node {node} is not the leader (leader hint: {leader_hint:?})")]
    NotLeader {
        node: NodeId,
        leader_hint: Option<NodeId>,
    },
}
