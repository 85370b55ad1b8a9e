//! # event
//!
//! why: let monitoring observe elections, commits and failures without touching node state
//! relations: queued by node.rs, drained and broadcast by the runtime event bus
//! what: RaftEvent, one variant per notification kind

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::node::NodeState;
use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftEvent {
    StateChanged {
        node_id: NodeId,
        old: NodeState,
        new: NodeState,
        term: u64,
    },
    LeaderElected {
        leader_id: NodeId,
        term: u64,
    },
    LogCommitted {
        index: u64,
        command: Command,
    },
    NodeJoined {
        node_id: NodeId,
    },
    NodeLeft {
        node_id: NodeId,
    },
    Error {
        error: String,
        context: String,
    },
}

impl RaftEvent {
    pub fn error(error: impl ToString, context: impl Into<String>) -> Self {
        RaftEvent::Error {
            error: error.to_string(),
            context: context.into(),
        }
    }
}
