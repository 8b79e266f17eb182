//! # status
//!
//! why: expose a node's consensus state without handing out the node itself
//! relations: built by the engine, served over transports, printed by the console
//! what: NodeStatus snapshot, MemberStatus and cluster_status aggregation

use std::fmt;

use raft_core::{ClusterConfig, LogIndex, NodeId, NodeState, RaftNode, Storage, Term};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::transport::Transport;

/// Point-in-time view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: NodeState,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub leader_hint: Option<NodeId>,
    pub stopped: bool,
}

impl NodeStatus {
    pub fn from_node<S: Storage>(node: &RaftNode<S>, stopped: bool) -> Self {
        Self {
            id: node.id(),
            role: node.state(),
            term: node.current_term(),
            voted_for: node.voted_for(),
            commit_index: node.commit_index(),
            last_applied: node.last_applied(),
            last_log_index: node.last_log_index(),
            leader_hint: node.leader_hint(),
            stopped,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} | {:?}{} | term {} | voted for {} | leader {} | commit {} | applied {} | last index {}",
            self.id,
            self.role,
            if self.stopped { " (stopped)" } else { "" },
            self.term,
            fmt_id(self.voted_for),
            fmt_id(self.leader_hint),
            self.commit_index,
            self.last_applied,
            self.last_log_index,
        )
    }
}

fn fmt_id(id: Option<NodeId>) -> String {
    id.map_or_else(|| "-".to_string(), |id| id.to_string())
}

/// One row of a cluster-wide status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub id: NodeId,
    pub address: String,
    /// `None` when the node could not be reached.
    pub status: Option<NodeStatus>,
    pub error: Option<String>,
}

impl MemberStatus {
    pub fn is_up(&self) -> bool {
        self.status.is_some()
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.status, &self.error) {
            (Some(status), _) => write!(f, "{} @ {}", status, self.address),
            (None, Some(error)) => write!(f, "node {} | DOWN | {} @ {}", self.id, error, self.address),
            (None, None) => write!(f, "node {} | DOWN @ {}", self.id, self.address),
        }
    }
}

/// Ask every configured member for its status, one after another. Members that fail
/// or do not answer within the rpc timeout are reported down.
pub async fn cluster_status(transport: &dyn Transport, cluster: &ClusterConfig) -> Vec<MemberStatus> {
    let rpc_timeout = cluster.raft.rpc_timeout();
    let mut members = Vec::with_capacity(cluster.nodes.len());

    for (&id, address) in &cluster.nodes {
        let (status, error) = match timeout(rpc_timeout, transport.status(id)).await {
            Ok(Ok(status)) => (Some(status), None),
            Ok(Err(e)) => (None, Some(e.to_string())),
            Err(_) => (None, Some("status request timed out".to_string())),
        };
        members.push(MemberStatus {
            id,
            address: address.clone(),
            status,
            error,
        });
    }
    members
}
