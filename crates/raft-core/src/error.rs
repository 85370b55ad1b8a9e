//! # error
//!
//! why: one error vocabulary for the consensus core and its storage boundary
//! relations: returned by node.rs, storage.rs, applier.rs; mapped into ClientResponse
//! what: StorageError, RaftError, Result alias

use thiserror::Error;

use crate::NodeId;

/// Failures of the durability boundary
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stored state is corrupt: {0}")]
    Corrupt(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("not the leader, current leader is {leader_id:?}")]
    NotLeader { leader_id: Option<NodeId> },

    #[error("entry {index} was not committed before the commit timeout")]
    CommitTimeout { index: u64 },

    #[error("entry {index} was replaced by another leader before it committed")]
    EntrySuperseded { index: u64 },

    #[error("persistence failure: {0}")]
    Storage(#[from] StorageError),

    #[error("node halted after a persistence failure")]
    Halted,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error("node is shut down")]
    Shutdown,
}

impl RaftError {
    /// Whether the same request may succeed if retried later.
    ///
    /// Redirects are not retryable at this node; timeouts and supersession are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::CommitTimeout { .. } | RaftError::EntrySuperseded { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
