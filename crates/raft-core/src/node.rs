//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entries, storage.rs for durability
//! what: NodeState / Role enums, RaftNode with election, replication and commit rules
//!
//! The node is sans-io: it never sends anything or reads a clock. Callers feed it
//! requests, replies and timer firings, and it answers with messages plus a flag telling
//! the caller whether to reset the election timer.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::RaftConfig;
use crate::error::{ConfigError, RaftError};
use crate::log::{Log, LogEntry};
use crate::message::RaftMessage;
use crate::state_machine::{Applied, StateMachine};
use crate::storage::Storage;
use crate::{LogIndex, NodeId, Term};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// Per-peer replication progress, only alive while the node leads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderState {
    /// index of the next entry to send to each peer
    pub next_index: BTreeMap<NodeId, LogIndex>,
    /// highest index known to be replicated on each peer
    pub match_index: BTreeMap<NodeId, LogIndex>,
}

impl LeaderState {
    fn new(peers: impl Iterator<Item = NodeId>, last_log_index: LogIndex) -> Self {
        let mut state = Self::default();
        for peer in peers {
            state.next_index.insert(peer, last_log_index + 1);
            state.match_index.insert(peer, 0);
        }
        state
    }
}

/// Role plus the data that only exists in that role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Follower { leader: Option<NodeId> },
    Candidate { votes: BTreeSet<NodeId> },
    Leader(LeaderState),
}

impl Role {
    pub fn state(&self) -> NodeState {
        match self {
            Role::Follower { .. } => NodeState::Follower,
            Role::Candidate { .. } => NodeState::Candidate,
            Role::Leader(_) => NodeState::Leader,
        }
    }
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode<S> {
    id: NodeId,
    cluster_nodes: Vec<NodeId>,
    config: RaftConfig,
    current_term: Term,
    voted_for: Option<NodeId>,
    role: Role,
    log: Log,
    commit_index: LogIndex,
    last_applied: LogIndex,
    storage: S,
}

impl<S: Storage> RaftNode<S> {
    /// Create a node with the default config, restoring term, vote and log from `storage`
    pub fn new(id: NodeId, cluster_nodes: Vec<NodeId>, storage: S) -> Result<Self, RaftError> {
        Self::with_config(id, cluster_nodes, RaftConfig::default(), storage)
    }

    pub fn with_config(
        id: NodeId,
        mut cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        storage: S,
    ) -> Result<Self, RaftError> {
        config.validate()?;
        cluster_nodes.sort_unstable();
        cluster_nodes.dedup();
        if cluster_nodes.is_empty() {
            return Err(ConfigError::EmptyCluster.into());
        }
        if !cluster_nodes.contains(&id) {
            return Err(ConfigError::UnknownNode(id).into());
        }

        let (current_term, voted_for) = storage.load_term_and_vote()?;
        let log = Log::from_entries(storage.load_log()?)?;
        if current_term > 0 || !log.is_empty() {
            info!(
                node = id,
                term = current_term,
                voted_for = ?voted_for,
                last_index = log.last_index(),
                "restored durable state"
            );
        }

        Ok(Self {
            id,
            cluster_nodes,
            config,
            current_term,
            voted_for,
            role: Role::Follower { leader: None },
            log,
            commit_index: 0,
            last_applied: 0,
            storage,
        })
    }

    // -- accessors --

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> NodeState {
        self.role.state()
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn cluster_nodes(&self) -> &[NodeId] {
        &self.cluster_nodes
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Every member except this node.
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&n| n != self.id)
    }

    /// Best known leader for the current term.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match &self.role {
            Role::Follower { leader } => *leader,
            Role::Candidate { .. } => None,
            Role::Leader(_) => Some(self.id),
        }
    }

    pub fn leader_state(&self) -> Option<&LeaderState> {
        match &self.role {
            Role::Leader(state) => Some(state),
            _ => None,
        }
    }

    /// Votes collected in the current election, if campaigning.
    pub fn votes_received(&self) -> Option<&BTreeSet<NodeId>> {
        match &self.role {
            Role::Candidate { votes } => Some(votes),
            _ => None,
        }
    }

    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received()
            .is_some_and(|votes| votes.len() >= self.quorum_size())
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: LogIndex) -> Option<&LogEntry> {
        self.log.get(index)
    }

    /// Term at `index`, 0 for the sentinel or a missing entry.
    pub fn get_term_at(&self, index: LogIndex) -> Term {
        self.log.term_at(index).unwrap_or(0)
    }

    // -- role transitions --

    /// Adopt `term` (if newer) and fall back to follower.
    ///
    /// The new term and the cleared vote are persisted before memory changes.
    pub fn become_follower(&mut self, term: Term) -> Result<(), RaftError> {
        let term_changed = term > self.current_term;
        if term_changed {
            self.storage.save_term_and_vote(term, None)?;
            self.current_term = term;
            self.voted_for = None;
        }
        match self.role {
            Role::Follower { .. } if !term_changed => {}
            Role::Follower { .. } => self.role = Role::Follower { leader: None },
            _ => {
                info!(node = self.id, term = self.current_term, from = ?self.state(), "stepping down to follower");
                self.role = Role::Follower { leader: None };
            }
        }
        Ok(())
    }

    /// Leave candidacy or leadership without touching the term.
    pub fn step_down(&mut self) {
        if !matches!(self.role, Role::Follower { .. }) {
            info!(node = self.id, term = self.current_term, "stepping down");
        }
        self.role = Role::Follower { leader: None };
    }

    fn become_leader(&mut self) {
        let last = self.log.last_index();
        let state = LeaderState::new(
            self.cluster_nodes.iter().copied().filter(|&n| n != self.id),
            last,
        );
        self.role = Role::Leader(state);
        info!(node = self.id, term = self.current_term, last_index = last, "became leader");
    }

    // -- election --

    /// Start (or restart) an election: bump the term, vote for self, and return the
    /// VoteRequest to broadcast. A single-node cluster wins on the spot.
    pub fn start_election(&mut self) -> Result<RaftMessage, RaftError> {
        let term = self.current_term + 1;
        self.storage.save_term_and_vote(term, Some(self.id))?;
        self.current_term = term;
        self.voted_for = Some(self.id);
        self.role = Role::Candidate {
            votes: BTreeSet::from([self.id]),
        };
        info!(node = self.id, term, "starting election");

        if self.has_quorum() {
            self.become_leader();
        }

        Ok(RaftMessage::VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }

    /// Handle RequestVote. Returns the reply and whether the election timer should
    /// reset (only when the vote is granted).
    pub fn handle_vote_request(
        &mut self,
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Result<(RaftMessage, bool), RaftError> {
        if term > self.current_term {
            self.become_follower(term)?;
        }

        let can_vote = self.voted_for.is_none() || self.voted_for == Some(candidate_id);
        let up_to_date = self.log.is_up_to_date(last_log_index, last_log_term);
        let granted = term == self.current_term && can_vote && up_to_date;

        if granted && self.voted_for != Some(candidate_id) {
            self.storage.save_term_and_vote(self.current_term, Some(candidate_id))?;
            self.voted_for = Some(candidate_id);
        }

        if granted {
            info!(node = self.id, candidate = candidate_id, term, "granting vote");
        } else {
            debug!(
                node = self.id,
                candidate = candidate_id,
                term,
                current_term = self.current_term,
                voted_for = ?self.voted_for,
                up_to_date,
                "rejecting vote"
            );
        }

        let reply = RaftMessage::VoteResponse {
            term: self.current_term,
            vote_granted: granted,
        };
        Ok((reply, granted))
    }

    /// Count a vote reply. Returns `true` when this reply won the election.
    pub fn handle_vote_response(
        &mut self,
        term: Term,
        vote_granted: bool,
        from: NodeId,
    ) -> Result<bool, RaftError> {
        if term > self.current_term {
            self.become_follower(term)?;
            return Ok(false);
        }
        if term < self.current_term || !vote_granted || !self.cluster_nodes.contains(&from) {
            return Ok(false);
        }

        let quorum = self.quorum_size();
        let Role::Candidate { votes } = &mut self.role else {
            return Ok(false);
        };
        votes.insert(from);
        let won = votes.len() >= quorum;
        debug!(node = self.id, peer = from, votes = votes.len(), quorum, "vote granted");

        if won {
            self.become_leader();
        }
        Ok(won)
    }

    // -- replication (leader side) --

    /// Append a client command to the leader's log.
    pub fn append_entry(&mut self, command: Vec<u8>) -> Result<LogEntry, RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                node: self.id,
                leader_hint: self.leader_hint(),
            });
        }
        let entry = LogEntry::new(self.current_term, self.log.last_index() + 1, command);
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        self.log.push(entry.clone());
        debug!(node = self.id, index = entry.index, term = entry.term, "appended client entry");
        self.advance_commit_index();
        Ok(entry)
    }

    /// AppendEntries for `peer` carrying everything from its next index, bounded by
    /// `max_payload_entries`. `None` unless leading.
    pub fn create_append_entries(&self, peer: NodeId) -> Option<RaftMessage> {
        self.append_entries_for(peer, self.config.max_payload_entries as usize)
    }

    /// Empty AppendEntries for `peer`, anchored at its next index.
    pub fn create_heartbeat(&self, peer: NodeId) -> Option<RaftMessage> {
        self.append_entries_for(peer, 0)
    }

    fn append_entries_for(&self, peer: NodeId, max_entries: usize) -> Option<RaftMessage> {
        let Role::Leader(state) = &self.role else {
            return None;
        };
        let next = *state.next_index.get(&peer)?;
        let prev_log_index = next.saturating_sub(1);
        let entries = if max_entries == 0 {
            Vec::new()
        } else {
            self.log.entries_from(next, max_entries)
        };
        Some(RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries,
            leader_commit: self.commit_index,
        })
    }

    /// Process a peer's AppendEntries reply. Returns `true` if the commit index moved.
    pub fn handle_append_entries_response(
        &mut self,
        term: Term,
        success: bool,
        from: NodeId,
        match_index: LogIndex,
    ) -> Result<bool, RaftError> {
        if term > self.current_term {
            self.become_follower(term)?;
            return Ok(false);
        }
        if term < self.current_term {
            return Ok(false);
        }

        let last_index = self.log.last_index();
        let Role::Leader(state) = &mut self.role else {
            return Ok(false);
        };
        if !state.next_index.contains_key(&from) {
            return Ok(false);
        }

        let matched = state.match_index.entry(from).or_insert(0);
        if success {
            *matched = (*matched).max(match_index.min(last_index));
            let matched = *matched;
            state.next_index.insert(from, matched + 1);
            Ok(self.advance_commit_index())
        } else {
            let floor = *matched + 1;
            if let Some(next) = state.next_index.get_mut(&from) {
                *next = next.saturating_sub(1).max(floor);
                debug!(node = self.id, peer = from, next_index = *next, "log mismatch, backing off");
            }
            Ok(false)
        }
    }

    /// Move the commit index to the highest entry of the current term stored on a
    /// majority. Entries from earlier terms only commit underneath such an entry.
    fn advance_commit_index(&mut self) -> bool {
        let Role::Leader(state) = &self.role else {
            return false;
        };
        let quorum = self.quorum_size();
        let mut new_commit = self.commit_index;
        for n in (self.commit_index + 1..=self.log.last_index()).rev() {
            let term = self.get_term_at(n);
            if term < self.current_term {
                break;
            }
            let replicas = 1 + state.match_index.values().filter(|&&m| m >= n).count();
            if replicas >= quorum {
                new_commit = n;
                break;
            }
        }

        if new_commit > self.commit_index {
            info!(node = self.id, term = self.current_term, commit_index = new_commit, "advanced commit index");
            self.commit_index = new_commit;
            true
        } else {
            false
        }
    }

    // -- replication (follower side) --

    /// Handle AppendEntries. Returns the reply and whether the election timer should
    /// reset (any request from a leader of the current term).
    pub fn handle_append_entries(
        &mut self,
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Result<(RaftMessage, bool), RaftError> {
        if term < self.current_term {
            debug!(node = self.id, leader = leader_id, term, current_term = self.current_term, "rejecting stale AppendEntries");
            return Ok((self.append_reply(false, 0), false));
        }

        if self.is_leader() && term == self.current_term {
            error!(node = self.id, other = leader_id, term, "another leader claims this term");
        }
        self.become_follower(term)?;
        if let Role::Follower { leader } = &mut self.role {
            *leader = Some(leader_id);
        }

        if !self.log.matches(prev_log_index, prev_log_term) {
            debug!(
                node = self.id,
                prev_log_index,
                prev_log_term,
                last_index = self.log.last_index(),
                "log mismatch"
            );
            return Ok((self.append_reply(false, 0), true));
        }

        let contiguous = entries
            .iter()
            .enumerate()
            .all(|(offset, e)| e.index == prev_log_index + 1 + offset as LogIndex);
        if !contiguous {
            warn!(node = self.id, leader = leader_id, "AppendEntries carried non-contiguous entries");
            return Ok((self.append_reply(false, 0), true));
        }

        let last_new = prev_log_index + entries.len() as LogIndex;
        let mut first_new = entries.len();
        for (pos, entry) in entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(existing) => {
                    if entry.index <= self.commit_index {
                        error!(
                            node = self.id,
                            index = entry.index,
                            existing,
                            incoming = entry.term,
                            "refusing to overwrite a committed entry"
                        );
                        return Ok((self.append_reply(false, 0), true));
                    }
                    info!(node = self.id, from_index = entry.index, "truncating conflicting suffix");
                    self.storage.truncate_log_from(entry.index)?;
                    self.log.truncate_from(entry.index);
                    first_new = pos;
                    break;
                }
                None => {
                    first_new = pos;
                    break;
                }
            }
        }

        let new_entries = &entries[first_new..];
        if !new_entries.is_empty() {
            self.storage.append_entries(new_entries)?;
            for entry in new_entries {
                self.log.push(entry.clone());
            }
        }

        if leader_commit > self.commit_index {
            let commit = leader_commit.min(last_new);
            if commit > self.commit_index {
                debug!(node = self.id, commit_index = commit, "follower commit advanced");
                self.commit_index = commit;
            }
        }

        Ok((self.append_reply(true, last_new), true))
    }

    fn append_reply(&self, success: bool, match_index: LogIndex) -> RaftMessage {
        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
        }
    }

    // -- state machine --

    /// Feed every committed, not yet applied entry to `state_machine`, in order.
    /// `last_applied` moves only after each `apply` returns.
    pub fn apply_committed<M>(&mut self, state_machine: &mut M) -> Vec<Applied>
    where
        M: StateMachine + ?Sized,
    {
        let mut applied = Vec::new();
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get(index) else {
                error!(node = self.id, index, "committed entry missing from log");
                break;
            };
            let term = entry.term;
            let result = state_machine.apply(index, &entry.command);
            self.last_applied = index;
            applied.push(Applied { index, term, result });
        }
        applied
    }
}
