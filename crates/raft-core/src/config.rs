//! # config
//!
//! why: static cluster membership and raft timing, fixed for the process lifetime
//! relations: read by node.rs (quorum, batch size) and the runtime (timers, rpc and commit timeouts)
//! what: RaftConfig timing knobs, ClusterConfig membership, json loading and validation

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{RaftError, Result};
use crate::NodeId;

/// Timing and batching parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound (inclusive) of the randomized election timeout, ms
    pub election_timeout_min: u64,
    /// Upper bound (exclusive) of the randomized election timeout, ms
    pub election_timeout_max: u64,
    /// Leader heartbeat period, ms
    pub heartbeat_interval: u64,
    /// Per-RPC deadline, ms
    pub rpc_timeout: u64,
    /// Maximum entries carried by one AppendEntries
    pub max_batch_size: usize,
    /// How long a client waits for its entry to commit, ms
    pub commit_timeout: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 450,
            heartbeat_interval: 100,
            rpc_timeout: 100,
            max_batch_size: 100,
            commit_timeout: 5000,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 || self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout range [{}, {}) is empty",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {}ms must be positive and below the election timeout minimum {}ms",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.rpc_timeout == 0 || self.commit_timeout == 0 {
            return Err(RaftError::InvalidConfig(
                "rpc and commit timeouts must be positive".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(RaftError::InvalidConfig(
                "max batch size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn commit_deadline(&self) -> Duration {
        Duration::from_millis(self.commit_timeout)
    }
}

/// Membership of the cluster as seen from one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub node_id: NodeId,
    /// Every member, this node included
    pub members: Vec<NodeId>,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl ClusterConfig {
    pub fn new(node_id: impl Into<NodeId>, members: Vec<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            members,
            raft: RaftConfig::default(),
        }
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RaftError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| RaftError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.raft.validate()?;
        if !self.members.contains(&self.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} is not in the member list",
                self.node_id
            )));
        }
        let mut sorted = self.members.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != self.members.len() {
            return Err(RaftError::InvalidConfig(
                "member list contains duplicates".to_string(),
            ));
        }
        Ok(())
    }

    /// Members other than this node
    pub fn peers(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .filter(|m| **m != self.node_id)
            .cloned()
            .collect()
    }
}
