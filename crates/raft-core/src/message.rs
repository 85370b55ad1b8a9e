//! # message
//!
//! why: define the two raft rpcs exchanged between nodes
//! relations: produced and consumed by node.rs, carried by the runtime transport
//! what: RequestVote and AppendEntries request/response pairs, dispatch enums, frame validation

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::log::LogEntry;
use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry this request would leave in the follower's log
    pub fn last_index(&self) -> u64 {
        self.prev_log_index.saturating_add(self.entries.len() as u64)
    }

    /// Structural checks that do not need the receiver's state.
    ///
    /// Entries must follow `prev_log_index` without gaps, and no entry may
    /// come from a term later than the sender's.
    pub fn validate(&self) -> Result<()> {
        for (offset, entry) in self.entries.iter().enumerate() {
            let expected = (offset as u64)
                .checked_add(1)
                .and_then(|n| self.prev_log_index.checked_add(n))
                .ok_or_else(|| {
                    RaftError::MalformedMessage(format!(
                        "entry at offset {} overflows the log index space",
                        offset
                    ))
                })?;
            if entry.index != expected {
                return Err(RaftError::MalformedMessage(format!(
                    "entry at offset {} has index {}, expected {}",
                    offset, entry.index, expected
                )));
            }
            if entry.term > self.term {
                return Err(RaftError::MalformedMessage(format!(
                    "entry {} has term {} above request term {}",
                    entry.index, entry.term, self.term
                )));
            }
        }
        if self.prev_log_term > self.term {
            return Err(RaftError::MalformedMessage(format!(
                "prev_log_term {} above request term {}",
                self.prev_log_term, self.term
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On rejection: where the leader should resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_index: Option<u64>,
    /// On rejection: the follower's term at `prev_log_index`, if it had one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_term: Option<u64>,
}

impl AppendEntriesResponse {
    pub fn accepted(term: u64) -> Self {
        Self {
            term,
            success: true,
            conflict_index: None,
            conflict_term: None,
        }
    }

    pub fn rejected(term: u64) -> Self {
        Self {
            term,
            success: false,
            conflict_index: None,
            conflict_term: None,
        }
    }
}

/// Inbound rpcs a node dispatches on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
}

impl RaftRequest {
    pub fn term(&self) -> u64 {
        match self {
            RaftRequest::RequestVote(req) => req.term,
            RaftRequest::AppendEntries(req) => req.term,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RaftError::MalformedMessage(e.to_string()))
    }

    /// Decode and validate a frame received from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let request: Self =
            serde_json::from_slice(bytes).map_err(|e| RaftError::MalformedMessage(e.to_string()))?;
        if let RaftRequest::AppendEntries(req) = &request {
            req.validate()?;
        }
        Ok(request)
    }
}

impl RaftResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RaftError::MalformedMessage(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RaftError::MalformedMessage(e.to_string()))
    }
}
