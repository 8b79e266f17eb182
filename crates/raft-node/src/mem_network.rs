//! # mem_network
//!
//! why: run whole clusters inside one runtime
//! relations: implements Transport over registered NodeHandles; used by tests
//! what: MemNetwork router, MemTransport, isolate/block/heal
//!
//! A call goes straight to the target's handle unless the link has been cut.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use raft_core::{NodeId, RaftMessage};

use crate::error::TransportError;
use crate::handle::NodeHandle;
use crate::status::NodeStatus;
use crate::transport::Transport;

#[derive(Debug, Default)]
struct Links {
    nodes: BTreeMap<NodeId, NodeHandle>,
    isolated: BTreeSet<NodeId>,
    /// cut links, stored as (low id, high id)
    blocked: BTreeSet<(NodeId, NodeId)>,
}

impl Links {
    fn connected(&self, a: NodeId, b: NodeId) -> bool {
        !self.isolated.contains(&a) && !self.isolated.contains(&b) && !self.blocked.contains(&pair(a, b))
    }
}

fn pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

/// Shared routing table. Clones refer to the same network.
#[derive(Debug, Clone, Default)]
pub struct MemNetwork {
    links: Arc<RwLock<Links>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handle` reachable under its id, replacing an earlier registration.
    pub fn register(&self, handle: NodeHandle) {
        self.links.write().nodes.insert(handle.id(), handle);
    }

    pub fn unregister(&self, id: NodeId) {
        self.links.write().nodes.remove(&id);
    }

    /// The transport node `local` sends through.
    pub fn transport(&self, local: NodeId) -> MemTransport {
        MemTransport {
            network: self.clone(),
            local,
        }
    }

    /// Cut every link to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        tracing::debug!(node = id, "isolating");
        self.links.write().isolated.insert(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        tracing::debug!(node = id, "reconnecting");
        self.links.write().isolated.remove(&id);
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn block(&self, a: NodeId, b: NodeId) {
        self.links.write().blocked.insert(pair(a, b));
    }

    /// Restore every isolated node and cut link.
    pub fn heal(&self) {
        let mut links = self.links.write();
        links.isolated.clear();
        links.blocked.clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<NodeHandle, TransportError> {
        let links = self.links.read();
        if !links.connected(from, to) {
            return Err(TransportError::Unreachable(to));
        }
        links.nodes.get(&to).cloned().ok_or(TransportError::Unreachable(to))
    }
}

/// One node's view of a [`MemNetwork`].
#[derive(Debug, Clone)]
pub struct MemTransport {
    network: MemNetwork,
    local: NodeId,
}

#[async_trait]
impl Transport for MemTransport {
    async fn send(&self, target: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError> {
        let handle = self.network.route(self.local, target)?;
        let reply = handle
            .deliver(message)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))?;
        // a link cut while the call was in flight loses the reply
        self.network.route(target, self.local)?;
        Ok(reply)
    }

    async fn status(&self, target: NodeId) -> Result<NodeStatus, TransportError> {
        let handle = self.network.route(self.local, target)?;
        handle
            .status()
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))
    }
}
