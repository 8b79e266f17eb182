//! # kv
//!
//! why: give the binary something to replicate
//! relations: implements raft_core::StateMachine; commands come from the console
//! what: KvCommand wire format, KvStore, KvOutcome

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use raft_core::{LogIndex, StateMachine};
use serde::{Deserialize, Serialize};

/// Commands that flow through the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvCommand {
    Put { key: String, value: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// What applying one command did. Returned, JSON encoded, as the apply result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum KvOutcome {
    Written { previous: Option<String> },
    Deleted { previous: Option<String> },
    /// The entry was not a KvCommand. It still occupies its log index.
    Rejected { reason: String },
}

impl KvOutcome {
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// In-memory map. Clones share the same data, so the console can read what the
/// engine applies.
#[derive(Debug, Clone, Default)]
pub struct KvStore {
    data: Arc<RwLock<BTreeMap<String, String>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.read().clone()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8> {
        let outcome = match KvCommand::decode(command) {
            Ok(KvCommand::Put { key, value }) => KvOutcome::Written {
                previous: self.data.write().insert(key, value),
            },
            Ok(KvCommand::Delete { key }) => KvOutcome::Deleted {
                previous: self.data.write().remove(&key),
            },
            Err(e) => {
                tracing::warn!(index, error = %e, "skipping entry that is not a kv command");
                KvOutcome::Rejected { reason: e.to_string() }
            }
        };
        serde_json::to_vec(&outcome).unwrap_or_default()
    }
}
