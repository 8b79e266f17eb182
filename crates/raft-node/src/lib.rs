//! # raft-node
//!
//! why: run a raft-core node for real: timers, peers, clients, a process
//! relations: drives raft-core's RaftNode, persists through raft-storage
//! what: engine loop, NodeHandle, transports (tcp and in-memory), status, key-value
//! demo state machine, console and logging setup for the `raft-node` binary

pub mod console;
pub mod engine;
pub mod error;
pub mod handle;
pub mod kv;
pub mod mem_network;
pub mod status;
pub mod telemetry;
pub mod transport;

pub use engine::spawn_node;
pub use error::{NodeError, TransportError};
pub use handle::{Accepted, NodeHandle};
pub use kv::{KvCommand, KvOutcome, KvStore};
pub use mem_network::{MemNetwork, MemTransport};
pub use status::{cluster_status, MemberStatus, NodeStatus};
pub use telemetry::{init_logging, LogFormat};
pub use transport::{RpcServer, TcpTransport, Transport};
