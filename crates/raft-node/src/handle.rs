//! # handle
//!
//! why: the only way to reach a running node from outside its engine loop
//! relations: wraps the engine's event queue, used by transports, console and tests
//! what: NodeHandle, Accepted

use raft_core::{LogIndex, NodeId, RaftMessage, Term};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::engine::Event;
use crate::error::NodeError;
use crate::status::NodeStatus;

/// A command appended to the leader's log. Not yet committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub index: LogIndex,
    pub term: Term,
}

/// Cloneable handle to a node's engine loop.
///
/// Every call is a message to the engine plus a oneshot reply; once the engine is
/// gone each call fails with [`NodeError::Halted`].
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    tx: mpsc::Sender<Event>,
}

impl NodeHandle {
    pub(crate) fn new(id: NodeId, tx: mpsc::Sender<Event>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// `false` once the engine loop has exited.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn call<T>(&self, event: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(event(reply))
            .await
            .map_err(|_| NodeError::Halted)?;
        rx.await.map_err(|_| NodeError::Halted)
    }

    /// Append `command` to the log if this node leads. Returns once the entry is
    /// durable locally; commitment happens later.
    pub async fn submit(&self, command: Vec<u8>) -> Result<Accepted, NodeError> {
        self.call(|reply| Event::Submit { command, reply }).await?
    }

    /// Like [`submit`](Self::submit), but wait until the entry has been applied on
    /// this node and return the state machine's result.
    pub async fn write(&self, command: Vec<u8>) -> Result<Vec<u8>, NodeError> {
        self.call(|reply| Event::Write { command, reply }).await?
    }

    /// Hand an inbound RequestVote or AppendEntries to the engine and wait for the
    /// reply it would send back.
    pub async fn deliver(&self, message: RaftMessage) -> Result<RaftMessage, NodeError> {
        self.call(|reply| Event::Raft { message, reply }).await?
    }

    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        self.call(|reply| Event::Status { reply }).await
    }

    /// Start an election now instead of waiting for the timer.
    pub async fn campaign(&self) -> Result<(), NodeError> {
        self.call(|reply| Event::Campaign { reply }).await?
    }

    /// Take the node out of the cluster without exiting: it steps down, ignores its
    /// timers and refuses inbound rpcs until [`resume`](Self::resume).
    pub async fn stop(&self) -> Result<(), NodeError> {
        self.call(|reply| Event::Stop { reply }).await
    }

    pub async fn resume(&self) -> Result<(), NodeError> {
        self.call(|reply| Event::Resume { reply }).await
    }

    /// Stop the engine loop. Later calls fail with [`NodeError::Halted`].
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.call(|reply| Event::Shutdown { reply }).await
    }
}
