//! # error
//!
//! why: separate "the message never arrived" from "the peer answered with an error"
//! relations: returned by transport.rs implementations, consumed by raft.rs
//! what: TransportError

use raft_core::{NodeId, RaftError};
use thiserror::Error;

/// Failure to complete one RPC round trip
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("rpc to {0} timed out")]
    Timeout(NodeId),

    /// The peer received the request but refused to handle it
    #[error("node {peer} failed the request: {reason}")]
    Remote { peer: NodeId, reason: String },

    #[error("codec error: {0}")]
    Codec(String),
}

impl TransportError {
    pub fn remote(peer: &NodeId, error: &RaftError) -> Self {
        TransportError::Remote {
            peer: peer.clone(),
            reason: error.to_string(),
        }
    }
}
