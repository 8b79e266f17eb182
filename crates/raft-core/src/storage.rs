//! # storage
//!
//! why: let the consensus rules persist term, vote and log without knowing the medium
//! relations: implemented by raft-storage (file, in-memory), called by node.rs
//! what: Storage trait

use crate::error::StorageError;
use crate::log::LogEntry;
use crate::{LogIndex, NodeId, Term};

/// Durable storage of raft state.
///
/// Every write must be durable when it returns `Ok`: the node replies to peers right
/// after these calls, and a reply must never get ahead of what survives a crash.
pub trait Storage: Send {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError>;

    /// load the persisted term and voted_for, `(0, None)` for a fresh node
    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>), StorageError>;

    /// append entries to the end of the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// drop every entry with index >= `from_index` (conflict resolution)
    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<(), StorageError>;
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        (**self).save_term_and_vote(term, voted_for)
    }

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>), StorageError> {
        (**self).load_term_and_vote()
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        (**self).append_entries(entries)
    }

    fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        (**self).load_log()
    }

    fn truncate_log_from(&mut self, from_index: LogIndex) -> Result<(), StorageError> {
        (**self).truncate_log_from(from_index)
    }
}
