//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, mirrored to durable storage through the Storage trait
//! what: LogEntry struct, Log container with sentinel-aware lookups and up-to-date checks

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::{LogIndex, Term};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: LogIndex,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: LogIndex, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }
}

/// In-memory view of a node's log.
///
/// Entries are dense: the entry at position `i` always has index `i + 1`. Index 0 is
/// a virtual sentinel with term 0 that is never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from entries loaded out of storage.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, StorageError> {
        for (pos, entry) in entries.iter().enumerate() {
            let expected = pos as LogIndex + 1;
            if entry.index != expected {
                return Err(StorageError::Corrupt(format!(
                    "log entry at position {pos} has index {} (expected {expected})",
                    entry.index
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.last().map_or(0, |e| e.index)
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |e| e.term)
    }

    /// Entry at `index`, or `None` for the sentinel and anything past the end.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Term of the entry at `index`. The sentinel reports term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// Log-matching check: does this log hold an entry at `index` with `term`?
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = start.max(1);
        if start > self.last_index() {
            return Vec::new();
        }
        self.entries[start as usize - 1..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// Is a log ending at (`last_log_index`, `last_log_term`) at least as up to date
    /// as this one? Higher last term wins; equal terms compare length.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_term = self.last_term();
        last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.last_index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub(crate) fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    pub(crate) fn truncate_from(&mut self, index: LogIndex) {
        self.entries.truncate(index.saturating_sub(1) as usize);
    }
}
