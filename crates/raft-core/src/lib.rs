//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-runtime (timers, network, clients), persisted via raft-storage
//! what: protocol state machine, log, rpc messages, storage contract, applier, events

pub mod applier;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod log;
pub mod message;
pub mod node;
pub mod state_machine;
pub mod storage;
pub mod timer;

/// Opaque, stable identity of a cluster member
pub type NodeId = String;

pub use applier::{Applied, Applier};
pub use command::{ClientResponse, Command};
pub use config::{ClusterConfig, RaftConfig};
pub use error::{RaftError, Result, StorageError};
pub use event::RaftEvent;
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, RaftRequest, RaftResponse, RequestVoteRequest,
    RequestVoteResponse,
};
pub use node::{NodeState, NodeStatus, RaftNode};
pub use state_machine::{KeyValueStore, StateMachine};
pub use storage::{InMemoryStorage, PersistentState, Storage};
