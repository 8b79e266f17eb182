//! # error
//!
//! why: type the failures a caller of the runtime can observe
//! relations: returned by NodeHandle, transports and the rpc server
//! what: NodeError, TransportError

use raft_core::{LogIndex, NodeId};

/// Errors returned by [`crate::NodeHandle`] calls.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("node is stopped")]
    Stopped,

    /// The engine loop is gone: shut down, or halted after a durability failure.
    #[error("node engine is not running")]
    Halted,

    #[error("entry {index} was overwritten by a later leader before it committed")]
    Superseded { index: LogIndex },

    #[error("unexpected {0} delivered as a request")]
    UnexpectedMessage(&'static str),
}

/// Failure to complete an outbound rpc. The engine treats every variant as a
/// negative reply and retries on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("rpc to node {0} timed out")]
    Timeout(NodeId),

    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("no address configured for node {0}")]
    UnknownNode(NodeId),

    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("remote node refused: {0}")]
    Remote(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(&'static str),
}
