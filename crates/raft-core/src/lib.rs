//! # raft-core
//!
//! why: implement the core raft consensus rules in pure, portable rust
//! relations: driven by raft-node's engine loop, persisted via raft-storage
//! what: node state machine, election and replication rules, log, config, storage and
//! state-machine seams

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod state_machine;
pub mod storage;

pub use config::{ClusterConfig, RaftConfig};
pub use error::{ConfigError, RaftError, StorageError};
pub use log::{Log, LogEntry};
pub use message::RaftMessage;
pub use node::{LeaderState, NodeState, RaftNode, Role};
pub use state_machine::{Applied, StateMachine};
pub use storage::Storage;

/// Cluster-unique node identifier.
pub type NodeId = u64;

/// Logical clock epoch.
pub type Term = u64;

/// Position in the replicated log. Index 0 is the empty sentinel.
pub type LogIndex = u64;
