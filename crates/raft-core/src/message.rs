//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, serialized by raft-node's transports
//! what: VoteRequest, VoteResponse, AppendEntries, AppendEntriesResponse

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::{LogIndex, NodeId, Term};

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request a vote during leader election
    VoteRequest {
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    /// Response to a vote request
    VoteResponse {
        term: Term,
        vote_granted: bool,
    },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    /// Response to AppendEntries
    ///
    /// `match_index` is the index of the last entry the follower now shares with the
    /// leader (`prev_log_index + entries.len()`), or 0 on failure.
    AppendEntriesResponse {
        term: Term,
        success: bool,
        match_index: LogIndex,
    },
}

impl RaftMessage {
    /// The term carried by every request and reply.
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. } => *term,
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest { .. } => "VoteRequest",
            RaftMessage::VoteResponse { .. } => "VoteResponse",
            RaftMessage::AppendEntries { entries, .. } if entries.is_empty() => "Heartbeat",
            RaftMessage::AppendEntries { .. } => "AppendEntries",
            RaftMessage::AppendEntriesResponse { .. } => "AppendEntriesResponse",
        }
    }
}
