//! # network
//!
//! why: run a whole cluster in one process with controllable failures
//! relations: implements transport.rs; nodes register themselves as RpcHandlers
//! what: LocalNetwork router with crash, partition and latency controls
//!
//! Every request and response crosses the router as encoded bytes, so the
//! decode-and-validate step at the receiving node is exercised exactly as it
//! would be over a real socket.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use raft_core::{NodeId, RaftRequest, RaftResponse};

use crate::error::TransportError;
use crate::transport::{RpcHandler, Transport};

#[derive(Default)]
struct Routes {
    nodes: HashMap<NodeId, Arc<dyn RpcHandler>>,
    down: HashSet<NodeId>,
    // directed links that drop traffic
    cut: HashSet<(NodeId, NodeId)>,
    latency: Duration,
}

impl Routes {
    fn link_up(&self, from: &NodeId, to: &NodeId) -> bool {
        !self.down.contains(from)
            && !self.down.contains(to)
            && !self.cut.contains(&(from.clone(), to.clone()))
    }
}

/// In-process router shared by every node of a simulated cluster
#[derive(Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<NodeId>, handler: Arc<dyn RpcHandler>) {
        let id = id.into();
        let mut routes = self.lock();
        routes.down.remove(&id);
        routes.nodes.insert(id, handler);
    }

    /// Remove a node entirely, as if its process died
    pub fn unregister(&self, id: &NodeId) {
        self.lock().nodes.remove(id);
    }

    /// Drop all traffic to and from `id` while keeping it registered
    pub fn take_down(&self, id: &NodeId) {
        self.lock().down.insert(id.clone());
    }

    pub fn bring_up(&self, id: &NodeId) {
        self.lock().down.remove(id);
    }

    /// Cut every link between the two groups, in both directions
    pub fn partition(&self, group_a: &[NodeId], group_b: &[NodeId]) {
        let mut routes = self.lock();
        for a in group_a {
            for b in group_b {
                routes.cut.insert((a.clone(), b.clone()));
                routes.cut.insert((b.clone(), a.clone()));
            }
        }
        tracing::info!(?group_a, ?group_b, "Network partitioned");
    }

    /// Cut `id` off from everyone else
    pub fn isolate(&self, id: &NodeId) {
        let others: Vec<NodeId> = self
            .lock()
            .nodes
            .keys()
            .filter(|n| *n != id)
            .cloned()
            .collect();
        self.partition(std::slice::from_ref(id), &others);
    }

    /// Restore every cut link (crashed nodes stay down)
    pub fn heal(&self) {
        self.lock().cut.clear();
        tracing::info!("Network healed");
    }

    /// One-way delay applied to every request and every response
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Deliver an already-encoded request and return the encoded response
    pub async fn send_raw(
        &self,
        from: &NodeId,
        to: &NodeId,
        bytes: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        let (handler, latency) = self.route(from, to)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let request = RaftRequest::decode(&bytes).map_err(|e| {
            tracing::warn!(peer = %from, node_id = %to, error = %e, "Dropping malformed request");
            TransportError::Codec(e.to_string())
        })?;
        let response = handler
            .handle_rpc(request)
            .await
            .map_err(|e| TransportError::remote(to, &e))?;
        let encoded = response
            .encode()
            .map_err(|e| TransportError::Codec(e.to_string()))?;

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        // a link cut while the request was in flight loses the reply
        self.route(to, from)?;
        Ok(encoded)
    }

    fn route(
        &self,
        from: &NodeId,
        to: &NodeId,
    ) -> Result<(Arc<dyn RpcHandler>, Duration), TransportError> {
        let routes = self.lock();
        if !routes.link_up(from, to) {
            return Err(TransportError::Unreachable(to.clone()));
        }
        let handler = routes
            .nodes
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;
        Ok((handler, routes.latency))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(
        &self,
        from: &NodeId,
        to: &NodeId,
        request: RaftRequest,
    ) -> Result<RaftResponse, TransportError> {
        let bytes = request
            .encode()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        let reply = self.send_raw(from, to, bytes).await?;
        RaftResponse::decode(&reply).map_err(|e| TransportError::Codec(e.to_string()))
    }
}
