//! # engine
//!
//! why: drive a RaftNode with real time, a network and clients
//! relations: owns one raft_core::RaftNode and StateMachine; fed by NodeHandle,
//! talks to peers through a Transport
//! what: Event queue, Engine select loop, spawn_node
//!
//! All node state lives inside one task. Inbound rpcs, client calls, rpc replies and
//! timers are serialized through a single mpsc queue. Outbound rpcs run in their own
//! tasks and post their reply back, tagged with the term they were sent in. A reply
//! carrying a newer term always moves the node to that term; otherwise a reply whose
//! tag no longer matches is dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::sync::Arc;

use raft_core::{LogEntry, LogIndex, NodeId, RaftError, RaftMessage, RaftNode, StateMachine, Storage, Term};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};

use crate::error::{NodeError, TransportError};
use crate::handle::{Accepted, NodeHandle};
use crate::status::NodeStatus;
use crate::transport::Transport;

const EVENT_QUEUE_DEPTH: usize = 1024;

type Reply<T> = oneshot::Sender<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RpcKind {
    Vote,
    Append,
}

#[derive(Debug)]
pub(crate) enum Event {
    /// inbound RequestVote / AppendEntries
    Raft {
        message: RaftMessage,
        reply: Reply<Result<RaftMessage, NodeError>>,
    },
    /// reply (or failure) of an rpc this node sent in `term`
    RpcReply {
        kind: RpcKind,
        term: Term,
        from: NodeId,
        result: Result<RaftMessage, TransportError>,
    },
    Submit {
        command: Vec<u8>,
        reply: Reply<Result<Accepted, NodeError>>,
    },
    Write {
        command: Vec<u8>,
        reply: Reply<Result<Vec<u8>, NodeError>>,
    },
    Status {
        reply: Reply<NodeStatus>,
    },
    Campaign {
        reply: Reply<Result<(), NodeError>>,
    },
    Stop {
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

enum Wake {
    Event(Event),
    ElectionTimeout,
    Heartbeat,
    Closed,
}

enum Flow {
    Continue,
    Shutdown,
}

struct PendingWrite {
    term: Term,
    reply: Reply<Result<Vec<u8>, NodeError>>,
}

/// Spawn the engine loop for `node` on the current tokio runtime.
pub fn spawn_node<S, M>(node: RaftNode<S>, state_machine: M, transport: Arc<dyn Transport>) -> NodeHandle
where
    S: Storage + 'static,
    M: StateMachine + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let id = node.id();
    let election = Box::pin(sleep(node.config().random_election_timeout()));
    let engine = Engine {
        node,
        state_machine,
        transport,
        rx,
        tx: tx.downgrade(),
        election,
        in_flight: BTreeSet::new(),
        pending: BTreeMap::new(),
        stopped: false,
    };
    tokio::spawn(engine.run());
    NodeHandle::new(id, tx)
}

struct Engine<S, M> {
    node: RaftNode<S>,
    state_machine: M,
    transport: Arc<dyn Transport>,
    rx: mpsc::Receiver<Event>,
    tx: mpsc::WeakSender<Event>,
    election: Pin<Box<Sleep>>,
    /// peers with an AppendEntries outstanding
    in_flight: BTreeSet<NodeId>,
    /// write() callers waiting for their index to apply
    pending: BTreeMap<LogIndex, PendingWrite>,
    stopped: bool,
}

impl<S, M> Engine<S, M>
where
    S: Storage + 'static,
    M: StateMachine + 'static,
{
    async fn run(mut self) {
        let id = self.node.id();
        info!(node = id, term = self.node.current_term(), last_index = self.node.last_log_index(), "engine started");

        let mut heartbeat = interval(self.node.config().heartbeat());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! { biased;
                event = self.rx.recv() => event.map_or(Wake::Closed, Wake::Event),
                _ = &mut self.election => Wake::ElectionTimeout,
                _ = heartbeat.tick() => Wake::Heartbeat,
            };

            let step = match wake {
                Wake::Event(event) => self.handle_event(event),
                Wake::ElectionTimeout => self.on_election_timeout().map(|()| Flow::Continue),
                Wake::Heartbeat => {
                    self.replicate_all();
                    Ok(Flow::Continue)
                }
                Wake::Closed => Ok(Flow::Shutdown),
            };

            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => break,
                Err(e) => {
                    error!(node = id, term = self.node.current_term(), error = %e, "durability failure, halting node");
                    break;
                }
            }
        }

        self.fail_pending(|| NodeError::Halted);
        info!(node = id, "engine stopped");
    }

    /// A storage failure surfaces as `Err` and halts the loop; any reply sender still
    /// held at that point is dropped, which the caller sees as [`NodeError::Halted`].
    fn handle_event(&mut self, event: Event) -> Result<Flow, RaftError> {
        match event {
            Event::Raft { message, reply } => self.on_raft_request(message, reply)?,
            Event::RpcReply {
                kind,
                term,
                from,
                result,
            } => self.on_rpc_reply(kind, term, from, result)?,
            Event::Submit { command, reply } => match self.accept(command)? {
                Ok(entry) => {
                    let _ = reply.send(Ok(Accepted {
                        index: entry.index,
                        term: entry.term,
                    }));
                    self.after_append();
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Event::Write { command, reply } => match self.accept(command)? {
                Ok(entry) => {
                    let pending = PendingWrite { term: entry.term, reply };
                    if let Some(old) = self.pending.insert(entry.index, pending) {
                        let _ = old.reply.send(Err(NodeError::Superseded { index: entry.index }));
                    }
                    self.after_append();
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Event::Status { reply } => {
                let _ = reply.send(NodeStatus::from_node(&self.node, self.stopped));
            }
            Event::Campaign { reply } => {
                if self.stopped {
                    let _ = reply.send(Err(NodeError::Stopped));
                } else {
                    if !self.node.is_leader() {
                        self.campaign()?;
                    }
                    let _ = reply.send(Ok(()));
                }
            }
            Event::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Event::Resume { reply } => {
                if self.stopped {
                    info!(node = self.node.id(), term = self.node.current_term(), "resuming");
                    self.stopped = false;
                    self.reset_election_timer();
                }
                let _ = reply.send(());
            }
            Event::Shutdown { reply } => {
                info!(node = self.node.id(), "shutdown requested");
                let _ = reply.send(());
                return Ok(Flow::Shutdown);
            }
        }
        Ok(Flow::Continue)
    }

    // -- timers --

    fn reset_election_timer(&mut self) {
        let deadline = Instant::now() + self.node.config().random_election_timeout();
        self.election.as_mut().reset(deadline);
    }

    fn on_election_timeout(&mut self) -> Result<(), RaftError> {
        if self.stopped || self.node.is_leader() {
            self.reset_election_timer();
            return Ok(());
        }
        debug!(node = self.node.id(), term = self.node.current_term(), "election timeout");
        self.campaign()
    }

    // -- election --

    fn campaign(&mut self) -> Result<(), RaftError> {
        let request = self.node.start_election()?;
        self.reset_election_timer();

        if self.node.is_leader() {
            self.on_became_leader();
            return Ok(());
        }

        let term = self.node.current_term();
        let peers: Vec<NodeId> = self.node.peers().collect();
        for peer in peers {
            self.spawn_rpc(RpcKind::Vote, term, peer, request.clone());
        }
        Ok(())
    }

    fn on_became_leader(&mut self) {
        self.in_flight.clear();
        let term = self.node.current_term();
        let peers: Vec<NodeId> = self.node.peers().collect();
        for peer in peers {
            if let Some(heartbeat) = self.node.create_heartbeat(peer) {
                self.in_flight.insert(peer);
                self.spawn_rpc(RpcKind::Append, term, peer, heartbeat);
            }
        }
    }

    // -- replication --

    fn replicate_all(&mut self) {
        if self.stopped || !self.node.is_leader() {
            return;
        }
        let peers: Vec<NodeId> = self.node.peers().collect();
        for peer in peers {
            self.replicate_to(peer);
        }
    }

    /// At most one AppendEntries per peer is outstanding.
    fn replicate_to(&mut self, peer: NodeId) {
        if self.in_flight.contains(&peer) {
            return;
        }
        let Some(message) = self.node.create_append_entries(peer) else {
            return;
        };
        self.in_flight.insert(peer);
        self.spawn_rpc(RpcKind::Append, self.node.current_term(), peer, message);
    }

    fn next_index(&self, peer: NodeId) -> Option<LogIndex> {
        self.node
            .leader_state()
            .and_then(|state| state.next_index.get(&peer).copied())
    }

    fn spawn_rpc(&self, kind: RpcKind, term: Term, peer: NodeId, message: RaftMessage) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let rpc_timeout = self.node.config().rpc_timeout();

        tokio::spawn(async move {
            let result = match timeout(rpc_timeout, transport.send(peer, message)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(peer)),
            };
            let _ = tx
                .send(Event::RpcReply {
                    kind,
                    term,
                    from: peer,
                    result,
                })
                .await;
        });
    }

    fn on_rpc_reply(
        &mut self,
        kind: RpcKind,
        sent_term: Term,
        from: NodeId,
        result: Result<RaftMessage, TransportError>,
    ) -> Result<(), RaftError> {
        let id = self.node.id();
        if kind == RpcKind::Append {
            self.in_flight.remove(&from);
        }
        if self.stopped {
            return Ok(());
        }
        // a newer term is adopted whatever round the reply belongs to
        if let Ok(message) = &result {
            if message.term() > self.node.current_term() {
                info!(node = id, peer = from, term = message.term(), "rpc reply carries a newer term");
                self.node.become_follower(message.term())?;
                return Ok(());
            }
        }
        if sent_term != self.node.current_term() {
            debug!(node = id, peer = from, sent_term, term = self.node.current_term(), "dropping stale reply");
            return Ok(());
        }

        let message = match result {
            Ok(message) => message,
            Err(e) => {
                debug!(node = id, peer = from, ?kind, error = %e, "rpc failed");
                return Ok(());
            }
        };

        match message {
            RaftMessage::VoteResponse { term, vote_granted } => {
                if self.node.handle_vote_response(term, vote_granted, from)? {
                    self.on_became_leader();
                }
            }
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
            } => {
                let next_before = self.next_index(from);
                if self.node.handle_append_entries_response(term, success, from, match_index)? {
                    self.apply_committed();
                }
                let last_index = self.node.last_log_index();
                let resend = match self.next_index(from) {
                    Some(next) if success => next <= last_index,
                    Some(next) => Some(next) != next_before,
                    None => false,
                };
                if resend {
                    self.replicate_to(from);
                }
            }
            other => {
                warn!(node = id, peer = from, kind = other.kind(), "request received as an rpc reply");
            }
        }
        Ok(())
    }

    // -- inbound rpcs --

    fn on_raft_request(
        &mut self,
        message: RaftMessage,
        reply: Reply<Result<RaftMessage, NodeError>>,
    ) -> Result<(), RaftError> {
        if self.stopped {
            let _ = reply.send(Err(NodeError::Stopped));
            return Ok(());
        }

        let (response, reset_timer) = match message {
            RaftMessage::VoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => self
                .node
                .handle_vote_request(term, candidate_id, last_log_index, last_log_term)?,
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.node.handle_append_entries(
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            )?,
            other => {
                let _ = reply.send(Err(NodeError::UnexpectedMessage(other.kind())));
                return Ok(());
            }
        };

        if reset_timer {
            self.reset_election_timer();
        }
        let _ = reply.send(Ok(response));
        self.fail_truncated();
        self.apply_committed();
        Ok(())
    }

    // -- clients --

    /// Append a client command. The outer `Result` carries fatal storage errors, the
    /// inner one the caller-facing refusal.
    fn accept(&mut self, command: Vec<u8>) -> Result<Result<LogEntry, NodeError>, RaftError> {
        if self.stopped {
            return Ok(Err(NodeError::Stopped));
        }
        match self.node.append_entry(command) {
            Ok(entry) => Ok(Ok(entry)),
            Err(RaftError::NotLeader { leader_hint, .. }) => Ok(Err(NodeError::NotLeader { leader_hint })),
            Err(e) => Err(e),
        }
    }

    fn after_append(&mut self) {
        self.apply_committed();
        self.replicate_all();
    }

    fn apply_committed(&mut self) {
        for applied in self.node.apply_committed(&mut self.state_machine) {
            debug!(node = self.node.id(), index = applied.index, term = applied.term, "applied entry");
            if let Some(pending) = self.pending.remove(&applied.index) {
                let result = if pending.term == applied.term {
                    Ok(applied.result)
                } else {
                    Err(NodeError::Superseded { index: applied.index })
                };
                let _ = pending.reply.send(result);
            }
        }
    }

    /// Answer `write` callers whose entry a newer leader has removed or replaced.
    fn fail_truncated(&mut self) {
        let node = &self.node;
        let lost: Vec<LogIndex> = self
            .pending
            .iter()
            .filter(|(index, pending)| node.get_entry(**index).map(|e| e.term) != Some(pending.term))
            .map(|(&index, _)| index)
            .collect();
        for index in lost {
            if let Some(pending) = self.pending.remove(&index) {
                debug!(node = node.id(), index, "pending write truncated");
                let _ = pending.reply.send(Err(NodeError::Superseded { index }));
            }
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        info!(node = self.node.id(), term = self.node.current_term(), "stopping");
        self.node.step_down();
        self.stopped = true;
        self.in_flight.clear();
        self.fail_pending(|| NodeError::Stopped);
    }

    fn fail_pending(&mut self, error: impl Fn() -> NodeError) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(error()));
        }
    }
}
