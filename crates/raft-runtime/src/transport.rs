//! # transport
//!
//! why: the driver only needs "send this rpc to that node and wait for the answer"
//! relations: implemented by network.rs; Raft implements RpcHandler on the receiving side
//! what: Transport and RpcHandler traits

use async_trait::async_trait;
use raft_core::{NodeId, RaftRequest, RaftResponse};

use crate::error::TransportError;

/// Outbound side of the cluster network.
///
/// Any reliable request/response channel works; delivery may fail or be
/// delayed, and the caller applies its own deadline.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        from: &NodeId,
        to: &NodeId,
        request: RaftRequest,
    ) -> Result<RaftResponse, TransportError>;
}

/// Inbound side: a node that answers RequestVote and AppendEntries
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle_rpc(&self, request: RaftRequest) -> raft_core::Result<RaftResponse>;
}
