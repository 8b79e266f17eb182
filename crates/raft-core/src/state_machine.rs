//! # state_machine
//!
//! why: hand committed commands to the replicated application, in order, exactly once
//! relations: driven by RaftNode::apply_committed, implemented by the application
//! what: StateMachine trait, Applied report

use crate::{LogIndex, Term};

/// The replicated application.
///
/// `apply` is called once per committed index, strictly in index order. Commands are
/// opaque bytes; the returned bytes are handed back to whoever submitted the command.
pub trait StateMachine: Send {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8>;
}

impl<M: StateMachine + ?Sized> StateMachine for Box<M> {
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> Vec<u8> {
        (**self).apply(index, command)
    }
}

/// Record of one entry handed to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub index: LogIndex,
    pub term: Term,
    pub result: Vec<u8>,
}
