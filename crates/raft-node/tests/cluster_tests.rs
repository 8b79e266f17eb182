//! Whole-cluster tests: real engines on one runtime, wired through MemNetwork.
//!
//! Most tests run with paused time, so election timeouts and heartbeats advance
//! virtually and the scenarios stay fast and repeatable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use raft_core::{ClusterConfig, LogEntry, LogIndex, NodeId, NodeState, RaftMessage, RaftNode, StateMachine, Storage, Term};
use raft_node::{
    cluster_status, spawn_node, MemNetwork, NodeError, NodeHandle, NodeStatus, RpcServer, TcpTransport, Transport,
    TransportError,
};
use raft_storage::{FileStorage, InMemoryStorage};
use tokio::time::{sleep, timeout};

// -- harness --

/// State machine that records every apply. Clones share the record.
#[derive(Debug, Clone, Default)]
struct Journal(Arc<Mutex<Vec<(LogIndex, Vec<u8>)>>>);

impl Journal {
    fn entries(&self) -> Vec<(LogIndex, Vec<u8>)> {
        self.0.lock().clone()
    }

    fn commands(&self) -> Vec<Vec<u8>> {
        self.0.lock().iter().map(|(_, c)| c.clone()).collect()
    }
}

impl StateMachine for Journal {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8> {
        self.0.lock().push((index, command.to_vec()));
        command.to_vec()
    }
}

struct TestCluster {
    ids: Vec<NodeId>,
    network: MemNetwork,
    handles: BTreeMap<NodeId, NodeHandle>,
    storages: BTreeMap<NodeId, InMemoryStorage>,
    journals: BTreeMap<NodeId, Journal>,
}

impl TestCluster {
    fn start(n: u64) -> Self {
        let storages = (1..=n).map(|id| (id, InMemoryStorage::new())).collect();
        Self::with_storages(storages)
    }

    fn with_storages(storages: BTreeMap<NodeId, InMemoryStorage>) -> Self {
        let mut cluster = Self {
            ids: storages.keys().copied().collect(),
            network: MemNetwork::new(),
            handles: BTreeMap::new(),
            storages,
            journals: BTreeMap::new(),
        };
        for id in cluster.ids.clone() {
            cluster.boot(id);
        }
        cluster
    }

    /// Start (or restart) `id` from whatever its storage holds, with an empty journal.
    fn boot(&mut self, id: NodeId) {
        let storage = self.storages[&id].clone();
        let node = RaftNode::new(id, self.ids.clone(), storage).unwrap();
        let journal = Journal::default();
        let handle = spawn_node(node, journal.clone(), Arc::new(self.network.transport(id)));
        self.network.register(handle.clone());
        self.handles.insert(id, handle);
        self.journals.insert(id, journal);
    }

    async fn crash(&mut self, id: NodeId) {
        self.handles[&id].shutdown().await.unwrap();
        self.network.unregister(id);
    }

    fn handle(&self, id: NodeId) -> &NodeHandle {
        &self.handles[&id]
    }

    fn journal(&self, id: NodeId) -> &Journal {
        &self.journals[&id]
    }

    fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig::new(self.ids.iter().map(|&id| (id, format!("mem://{id}"))).collect())
    }

    async fn status(&self, id: NodeId) -> NodeStatus {
        self.handle(id).status().await.unwrap()
    }

    async fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::new();
        for handle in self.handles.values() {
            if let Ok(status) = handle.status().await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Wait until some node outside `excluding` leads in the highest term any of
    /// those nodes has seen.
    async fn wait_for_leader(&self, excluding: &[NodeId]) -> (NodeId, Term) {
        for _ in 0..200 {
            let live: Vec<NodeStatus> = self
                .statuses()
                .await
                .into_iter()
                .filter(|s| !excluding.contains(&s.id) && !s.stopped)
                .collect();
            let max_term = live.iter().map(|s| s.term).max().unwrap_or(0);
            if let Some(leader) = live
                .iter()
                .find(|s| s.role == NodeState::Leader && s.term == max_term)
            {
                return (leader.id, leader.term);
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("no leader elected");
    }

    async fn wait_for_applied(&self, id: NodeId, count: usize) {
        for _ in 0..200 {
            if self.journal(id).entries().len() >= count {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("node {id} applied {:?}", self.journal(id).entries());
    }

    fn follower_of(&self, leader: NodeId) -> NodeId {
        self.ids.iter().copied().find(|&id| id != leader).unwrap()
    }
}

/// Refuses every vote after 50ms, claiming term 9. Everything else is unreachable.
struct LateVoter;

#[async_trait]
impl Transport for LateVoter {
    async fn send(&self, target: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError> {
        match message {
            RaftMessage::VoteRequest { .. } => {
                sleep(Duration::from_millis(50)).await;
                Ok(RaftMessage::VoteResponse {
                    term: 9,
                    vote_granted: false,
                })
            }
            _ => Err(TransportError::Unreachable(target)),
        }
    }

    async fn status(&self, target: NodeId) -> Result<NodeStatus, TransportError> {
        Err(TransportError::Unreachable(target))
    }
}

fn entries(terms: &[Term]) -> Vec<LogEntry> {
    terms
        .iter()
        .enumerate()
        .map(|(i, &term)| LogEntry::new(term, i as u64 + 1, format!("e{}", i + 1).into_bytes()))
        .collect()
}

// -- elections --

#[tokio::test(start_paused = true)]
async fn three_nodes_elect_one_leader() {
    let cluster = TestCluster::start(3);
    let (leader, term) = cluster.wait_for_leader(&[]).await;
    assert!(term >= 1);

    sleep(Duration::from_millis(300)).await;
    let statuses = cluster.statuses().await;
    let leaders: Vec<_> = statuses.iter().filter(|s| s.role == NodeState::Leader).collect();
    assert_eq!(leaders.len(), 1);
    assert_eq!(leaders[0].id, leader);
    for status in &statuses {
        if status.id != leader {
            assert_eq!(status.leader_hint, Some(leader));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn partitioned_leader_steps_down_after_rejoining() {
    let cluster = TestCluster::start(3);
    let (old_leader, old_term) = cluster.wait_for_leader(&[]).await;

    cluster.network.isolate(old_leader);
    let (new_leader, new_term) = cluster.wait_for_leader(&[old_leader]).await;
    assert_ne!(new_leader, old_leader);
    assert!(new_term > old_term);

    // cut off, it never hears of the new term
    let stale = cluster.status(old_leader).await;
    assert_eq!(stale.role, NodeState::Leader);
    assert_eq!(stale.term, old_term);

    cluster.network.reconnect(old_leader);
    sleep(Duration::from_millis(500)).await;

    let rejoined = cluster.status(old_leader).await;
    assert_eq!(rejoined.role, NodeState::Follower);
    assert!(rejoined.term >= new_term);
    let leaders = cluster
        .statuses()
        .await
        .into_iter()
        .filter(|s| s.role == NodeState::Leader)
        .count();
    assert_eq!(leaders, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_campaigns_settle_on_one_leader() {
    let cluster = TestCluster::start(3);
    let (a, b) = tokio::join!(cluster.handle(1).campaign(), cluster.handle(2).campaign());
    a.unwrap();
    b.unwrap();

    let (_, term) = cluster.wait_for_leader(&[]).await;
    let leaders_in_term = cluster
        .statuses()
        .await
        .into_iter()
        .filter(|s| s.role == NodeState::Leader && s.term == term)
        .count();
    assert_eq!(leaders_in_term, 1);
}

#[tokio::test(start_paused = true)]
async fn single_node_cluster_leads_itself() {
    let cluster = TestCluster::start(1);
    let (leader, _) = cluster.wait_for_leader(&[]).await;
    assert_eq!(leader, 1);

    let result = cluster.handle(1).write(b"solo".to_vec()).await.unwrap();
    assert_eq!(result, b"solo");
    assert_eq!(cluster.journal(1).entries(), vec![(1, b"solo".to_vec())]);
}

#[tokio::test(start_paused = true)]
async fn newer_term_in_a_late_vote_reply_is_adopted() {
    let node = RaftNode::new(1, vec![1, 2, 3], InMemoryStorage::new()).unwrap();
    let handle = spawn_node(node, Journal::default(), Arc::new(LateVoter));

    handle.campaign().await.unwrap();
    assert_eq!(handle.status().await.unwrap().term, 1);

    // a term-2 leader shows up before the term-1 vote replies arrive
    let reply = handle
        .deliver(RaftMessage::AppendEntries {
            term: 2,
            leader_id: 3,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        })
        .await
        .unwrap();
    assert!(matches!(reply, RaftMessage::AppendEntriesResponse { term: 2, success: true, .. }));

    sleep(Duration::from_millis(70)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.term, 9);
    assert_eq!(status.role, NodeState::Follower);
    assert_eq!(status.voted_for, None);
}

// -- replication --

#[tokio::test(start_paused = true)]
async fn slow_follower_applies_each_entry_exactly_once() {
    let cluster = TestCluster::start(3);
    let (leader, _) = cluster.wait_for_leader(&[]).await;
    let slow = cluster.follower_of(leader);

    cluster.handle(slow).stop().await.unwrap();
    let result = cluster.handle(leader).write(b"x".to_vec()).await.unwrap();
    assert_eq!(result, b"x");
    assert_eq!(cluster.journal(leader).commands(), vec![b"x".to_vec()]);
    assert!(cluster.journal(slow).entries().is_empty());

    cluster.handle(slow).resume().await.unwrap();
    cluster.wait_for_applied(slow, 1).await;
    sleep(Duration::from_millis(300)).await;

    for &id in &cluster.ids {
        assert_eq!(cluster.journal(id).entries(), vec![(1, b"x".to_vec())], "node {id}");
        let status = cluster.status(id).await;
        assert_eq!(status.commit_index, 1);
        assert_eq!(status.last_applied, 1);
    }
}

#[tokio::test(start_paused = true)]
async fn submit_returns_accepted_position() {
    let cluster = TestCluster::start(3);
    let (leader, term) = cluster.wait_for_leader(&[]).await;

    let first = cluster.handle(leader).submit(b"a".to_vec()).await.unwrap();
    let second = cluster.handle(leader).submit(b"b".to_vec()).await.unwrap();
    assert_eq!((first.index, first.term), (1, term));
    assert_eq!((second.index, second.term), (2, term));

    for &id in &cluster.ids {
        cluster.wait_for_applied(id, 2).await;
        assert_eq!(cluster.journal(id).commands(), vec![b"a".to_vec(), b"b".to_vec()]);
    }
}

#[tokio::test(start_paused = true)]
async fn follower_rejects_submit_with_leader_hint() {
    let cluster = TestCluster::start(3);
    let (leader, _) = cluster.wait_for_leader(&[]).await;
    sleep(Duration::from_millis(200)).await;
    let follower = cluster.follower_of(leader);

    let err = cluster.handle(follower).submit(b"nope".to_vec()).await.unwrap_err();
    assert!(matches!(err, NodeError::NotLeader { leader_hint: Some(id) } if id == leader));
}

#[tokio::test(start_paused = true)]
async fn conflicting_follower_adopts_leader_log_from_index_five() {
    // node 2 holds a term-2 suffix that never committed; nodes 1 and 3 hold term 3
    let storages = BTreeMap::from([
        (1, InMemoryStorage::with_state(3, None, entries(&[1, 1, 1, 1, 3]))),
        (2, InMemoryStorage::with_state(2, None, entries(&[1, 1, 1, 1, 2, 2]))),
        (3, InMemoryStorage::with_state(3, None, entries(&[1, 1, 1, 1, 3]))),
    ]);
    let cluster = TestCluster::with_storages(storages);

    cluster.handle(1).campaign().await.unwrap();
    let (leader, _) = cluster.wait_for_leader(&[]).await;
    assert_eq!(leader, 1);

    cluster.handle(1).write(b"e6".to_vec()).await.unwrap();
    cluster.wait_for_applied(2, 6).await;

    let leader_log = cluster.storages[&1].load_log().unwrap();
    let follower_log = cluster.storages[&2].load_log().unwrap();
    assert_eq!(follower_log, leader_log);
    assert_eq!(follower_log[4].term, 3);
    assert_eq!(follower_log.len(), 6);
    assert_eq!(
        cluster.journal(2).commands()[4..],
        [b"e5".to_vec(), b"e6".to_vec()]
    );
}

// -- failures --

#[tokio::test(start_paused = true)]
async fn restarted_follower_catches_up_from_storage() {
    let mut cluster = TestCluster::start(3);
    let (leader, _) = cluster.wait_for_leader(&[]).await;
    let follower = cluster.follower_of(leader);

    cluster.handle(leader).write(b"a".to_vec()).await.unwrap();
    cluster.handle(leader).write(b"b".to_vec()).await.unwrap();
    cluster.wait_for_applied(follower, 2).await;

    cluster.crash(follower).await;
    assert!(matches!(cluster.handle(follower).status().await, Err(NodeError::Halted)));
    cluster.handle(leader).write(b"c".to_vec()).await.unwrap();
    assert_eq!(cluster.storages[&follower].load_log().unwrap().len(), 2);

    cluster.boot(follower);

    cluster.wait_for_applied(follower, 3).await;
    assert_eq!(
        cluster.journal(follower).commands(),
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
    );
}

#[tokio::test(start_paused = true)]
async fn storage_failure_halts_the_node() {
    let cluster = TestCluster::start(3);
    let (leader, _) = cluster.wait_for_leader(&[]).await;

    cluster.storages[&leader].fail_writes(true);
    let err = cluster.handle(leader).submit(b"lost".to_vec()).await.unwrap_err();
    assert!(matches!(err, NodeError::Halted));
    assert!(!cluster.handle(leader).is_running());
    assert!(matches!(cluster.handle(leader).status().await, Err(NodeError::Halted)));

    let (new_leader, _) = cluster.wait_for_leader(&[leader]).await;
    assert_ne!(new_leader, leader);
}

#[tokio::test(start_paused = true)]
async fn stopped_node_refuses_rpcs_until_resumed() {
    let cluster = TestCluster::start(3);
    let (leader, term) = cluster.wait_for_leader(&[]).await;

    cluster.handle(leader).stop().await.unwrap();
    let stopped = cluster.status(leader).await;
    assert!(stopped.stopped);
    assert_eq!(stopped.role, NodeState::Follower);

    let probe = RaftMessage::VoteRequest {
        term: term + 10,
        candidate_id: 9,
        last_log_index: 0,
        last_log_term: 0,
    };
    assert!(matches!(cluster.handle(leader).deliver(probe).await, Err(NodeError::Stopped)));
    assert!(matches!(cluster.handle(leader).campaign().await, Err(NodeError::Stopped)));

    let (new_leader, new_term) = cluster.wait_for_leader(&[leader]).await;
    assert_ne!(new_leader, leader);

    cluster.handle(leader).resume().await.unwrap();
    sleep(Duration::from_millis(300)).await;
    let resumed = cluster.status(leader).await;
    assert!(!resumed.stopped);
    assert!(resumed.term >= new_term);
}

#[tokio::test(start_paused = true)]
async fn pending_write_fails_when_node_stops() {
    let cluster = TestCluster::start(3);
    let (leader, _) = cluster.wait_for_leader(&[]).await;
    for id in cluster.ids.iter().copied().filter(|&id| id != leader) {
        cluster.network.isolate(id);
    }

    let writer = cluster.handle(leader).clone();
    let pending = tokio::spawn(async move { writer.write(b"stuck".to_vec()).await });
    sleep(Duration::from_millis(100)).await;
    cluster.handle(leader).stop().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, NodeError::Stopped));
}

#[tokio::test(start_paused = true)]
async fn pending_write_fails_when_a_newer_leader_replaces_it() {
    let cluster = TestCluster::start(3);
    let (leader, term) = cluster.wait_for_leader(&[]).await;
    let rival = cluster.follower_of(leader);
    for id in cluster.ids.iter().copied().filter(|&id| id != leader) {
        cluster.network.isolate(id);
    }

    let writer = cluster.handle(leader).clone();
    let pending = tokio::spawn(async move { writer.write(b"doomed".to_vec()).await });
    sleep(Duration::from_millis(100)).await;

    let reply = cluster
        .handle(leader)
        .deliver(RaftMessage::AppendEntries {
            term: term + 5,
            leader_id: rival,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(term + 5, 1, b"winner".to_vec())],
            leader_commit: 0,
        })
        .await
        .unwrap();
    assert!(matches!(
        reply,
        RaftMessage::AppendEntriesResponse { success: true, match_index: 1, .. }
    ));

    let err = timeout(Duration::from_secs(1), pending)
        .await
        .expect("write was never answered")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, NodeError::Superseded { index: 1 }));
}

#[tokio::test(start_paused = true)]
async fn cluster_status_marks_unreachable_nodes_down() {
    let cluster = TestCluster::start(3);
    cluster.wait_for_leader(&[]).await;
    cluster.network.isolate(3);

    let transport = cluster.network.transport(1);
    let members = cluster_status(&transport, &cluster.cluster_config()).await;
    assert_eq!(members.len(), 3);
    assert!(members[0].is_up());
    assert!(members[1].is_up());
    assert!(!members[2].is_up());
    assert_eq!(members[2].address, "mem://3");
    assert!(members[2].to_string().contains("DOWN"));
}

#[tokio::test(start_paused = true)]
async fn file_backed_node_recovers_its_log() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemNetwork::new();

    let node = RaftNode::new(1, vec![1], FileStorage::new(dir.path()).unwrap()).unwrap();
    let handle = spawn_node(node, Journal::default(), Arc::new(network.transport(1)));
    handle.campaign().await.unwrap();
    handle.write(b"a".to_vec()).await.unwrap();
    let before = handle.status().await.unwrap();
    handle.shutdown().await.unwrap();

    let node = RaftNode::new(1, vec![1], FileStorage::new(dir.path()).unwrap()).unwrap();
    assert_eq!(node.current_term(), before.term);
    assert_eq!(node.voted_for(), Some(1));
    let journal = Journal::default();
    let handle = spawn_node(node, journal.clone(), Arc::new(network.transport(1)));

    // the old entry commits underneath the first entry of the new term
    handle.campaign().await.unwrap();
    handle.write(b"b".to_vec()).await.unwrap();
    assert_eq!(journal.entries(), vec![(1, b"a".to_vec()), (2, b"b".to_vec())]);
    assert!(handle.status().await.unwrap().term > before.term);
}

// -- tcp --

#[tokio::test]
async fn tcp_transport_reaches_rpc_server() {
    let network = MemNetwork::new();
    let node = RaftNode::new(1, vec![1, 2], InMemoryStorage::new()).unwrap();
    let handle = spawn_node(node, Journal::default(), Arc::new(network.transport(1)));

    let server = RpcServer::bind("127.0.0.1:0", handle.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let transport = TcpTransport::new(BTreeMap::from([(1, addr.to_string())]));
    let status = transport.status(1).await.unwrap();
    assert_eq!(status.id, 1);

    let reply = transport
        .send(
            1,
            RaftMessage::VoteRequest {
                term: 50,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            },
        )
        .await
        .unwrap();
    assert_eq!(
        reply,
        RaftMessage::VoteResponse {
            term: 50,
            vote_granted: true
        }
    );

    let reply = transport
        .send(
            1,
            RaftMessage::AppendEntries {
                term: 50,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![LogEntry::new(50, 1, b"over tcp".to_vec())],
                leader_commit: 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(
        reply,
        RaftMessage::AppendEntriesResponse {
            term: 50,
            success: true,
            match_index: 1
        }
    );

    let status = handle.status().await.unwrap();
    assert_eq!(status.leader_hint, Some(2));
    assert_eq!(status.last_applied, 1);

    handle.shutdown().await.unwrap();
}
