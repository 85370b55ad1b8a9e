//! # raft
//!
//! why: give the synchronous protocol core a clock, a network and clients
//! relations: owns a raft_core::RaftNode and Applier behind one lock; uses timer.rs,
//!            transport.rs and event_bus.rs
//! what: Raft handle (submit, rpc handling, recover, shutdown) and its timer/rpc plumbing
//!
//! All node state lives in one `Core` behind a std mutex. Timer callbacks,
//! inbound rpcs, rpc replies and client submissions each take the lock, do
//! their synchronous work (including durable writes) and release it before
//! any `.await`. Outbound rpcs are spawned tasks.
//!
//! Timer callbacks carry the epoch they were armed in. The epoch moves on
//! every role or term change and every election timer re-arm, so a callback
//! that fires late finds a different epoch and does nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use raft_core::timer::election_timeout;
use raft_core::{
    AppendEntriesRequest, Applier, ClientResponse, ClusterConfig, Command, LogEntry, NodeId,
    NodeState, NodeStatus, RaftConfig, RaftError, RaftEvent, RaftNode, RaftRequest, RaftResponse,
    RequestVoteRequest, Result, StateMachine, Storage,
};
use tokio::sync::{broadcast, oneshot};

use crate::error::TransportError;
use crate::event_bus::EventBus;
use crate::timer::{Scheduler, TimerHandle};
use crate::transport::{RpcHandler, Transport};

/// A client waiting for the entry it proposed at some index
struct Waiter {
    term: u64,
    tx: oneshot::Sender<Result<Vec<u8>>>,
}

enum Outgoing {
    Vote(NodeId, RequestVoteRequest),
    Append(NodeId, AppendEntriesRequest),
}

struct Core<S: Storage, M: StateMachine> {
    node: RaftNode<S>,
    applier: Applier<M>,
    epoch: u64,
    election_timer: Option<TimerHandle>,
    heartbeat_timer: Option<TimerHandle>,
    waiters: BTreeMap<u64, Waiter>,
    reachable: HashMap<NodeId, bool>,
    stopped: bool,
}

impl<S: Storage, M: StateMachine> Core<S, M> {
    fn position(&self) -> (NodeState, u64) {
        (self.node.state(), self.node.current_term())
    }

    fn fail_waiters(&mut self, error: impl Fn() -> RaftError) {
        for (_, waiter) in std::mem::take(&mut self.waiters) {
            let _ = waiter.tx.send(Err(error()));
        }
    }
}

struct Shared<S: Storage, M: StateMachine> {
    id: NodeId,
    config: RaftConfig,
    core: Mutex<Core<S, M>>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    events: EventBus,
}

/// Handle to one running raft node. Clones share the same node.
pub struct Raft<S: Storage + 'static, M: StateMachine + 'static> {
    shared: Arc<Shared<S, M>>,
}

impl<S: Storage + 'static, M: StateMachine + 'static> Clone for Raft<S, M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: Storage + 'static, M: StateMachine + 'static> Raft<S, M> {
    /// Build a node from whatever `storage` holds. Timers stay idle until `start`.
    pub fn new(
        cluster: ClusterConfig,
        storage: S,
        state_machine: M,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self> {
        let node = RaftNode::new(cluster, storage)?;
        let id = node.id().clone();
        let config = node.config().clone();
        let core = Core {
            node,
            applier: Applier::new(state_machine),
            epoch: 0,
            election_timer: None,
            heartbeat_timer: None,
            waiters: BTreeMap::new(),
            reachable: HashMap::new(),
            stopped: false,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                id,
                config,
                core: Mutex::new(core),
                transport,
                scheduler,
                events: EventBus::default(),
            }),
        })
    }

    /// Arm the election timer. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut core = self.lock();
        if core.stopped || core.node.is_halted() {
            return;
        }
        tracing::info!(
            node_id = %self.shared.id,
            term = core.node.current_term(),
            "Starting raft node"
        );
        self.reset_election_timer(&mut core);
    }

    // -- observation --

    pub fn id(&self) -> &NodeId {
        &self.shared.id
    }

    pub fn status(&self) -> NodeStatus {
        self.lock().node.status()
    }

    pub fn is_leader(&self) -> bool {
        self.lock().node.is_leader()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.lock().node.leader_id().cloned()
    }

    pub fn current_term(&self) -> u64 {
        self.lock().node.current_term()
    }

    pub fn commit_index(&self) -> u64 {
        self.lock().node.commit_index()
    }

    pub fn last_applied(&self) -> u64 {
        self.lock().applier.last_applied()
    }

    pub fn is_halted(&self) -> bool {
        self.lock().node.is_halted()
    }

    /// Copy of the whole log
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.lock().node.log().entries().to_vec()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RaftEvent> {
        self.shared.events.subscribe()
    }

    pub fn with_state_machine<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        f(self.lock().applier.state_machine())
    }

    /// Snapshot of the applied state, tagged with its last applied index
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        self.lock().applier.create_snapshot()
    }

    // -- clients --

    pub async fn submit(&self, command: Command) -> ClientResponse {
        self.client_write(command).await.into()
    }

    /// Replicate `command` and wait until it is applied on this node.
    ///
    /// Fails fast with `NotLeader` on a non-leader, and with
    /// `CommitTimeout` when no quorum acknowledges it in time.
    pub async fn client_write(&self, command: Command) -> Result<Vec<u8>> {
        let (index, rx, outgoing) = {
            let mut core = self.lock();
            if core.stopped {
                return Err(RaftError::Shutdown);
            }
            let before = core.position();
            let entry = match core.node.propose(command) {
                Ok(entry) => entry,
                Err(e) => {
                    self.after_step(&mut core, before, false);
                    return Err(e);
                }
            };

            let (tx, rx) = oneshot::channel();
            let previous = core.waiters.insert(
                entry.index,
                Waiter {
                    term: entry.term,
                    tx,
                },
            );
            if let Some(old) = previous {
                let _ = old.tx.send(Err(RaftError::EntrySuperseded { index: entry.index }));
            }
            let mut outgoing = self.after_step(&mut core, before, false);
            outgoing.extend(Self::replicate_all(&core));
            (entry.index, rx, outgoing)
        };
        self.dispatch(outgoing);

        match tokio::time::timeout(self.shared.config.commit_deadline(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => {
                self.lock().waiters.remove(&index);
                tracing::warn!(node_id = %self.shared.id, index, "Entry not committed before timeout");
                Err(RaftError::CommitTimeout { index })
            }
        }
    }

    // -- lifecycle --

    /// Reload persistent state after a storage fault and rejoin as Follower
    pub fn recover(&self) -> Result<()> {
        let mut core = self.lock();
        if core.stopped {
            return Err(RaftError::Shutdown);
        }
        core.node.recover()?;
        core.heartbeat_timer = None;
        self.reset_election_timer(&mut core);
        self.publish(&mut core);
        Ok(())
    }

    /// Stop all timers and fail waiting clients. Inbound rpcs are refused afterwards.
    pub fn shutdown(&self) {
        let mut core = self.lock();
        if core.stopped {
            return;
        }
        core.stopped = true;
        core.epoch += 1;
        core.election_timer = None;
        core.heartbeat_timer = None;
        core.fail_waiters(|| RaftError::Shutdown);
        tracing::info!(node_id = %self.shared.id, "Raft node shut down");
    }

    // -- inbound rpcs --

    fn handle_request(&self, request: RaftRequest) -> Result<RaftResponse> {
        let (response, outgoing) = {
            let mut core = self.lock();
            if core.stopped {
                return Err(RaftError::Shutdown);
            }
            let before = core.position();
            let result = match &request {
                RaftRequest::RequestVote(req) => core
                    .node
                    .handle_request_vote(req)
                    .map(|(resp, reset)| (RaftResponse::RequestVote(resp), reset)),
                RaftRequest::AppendEntries(req) => req
                    .validate()
                    .and_then(|_| core.node.handle_append_entries(req))
                    .map(|(resp, reset)| (RaftResponse::AppendEntries(resp), reset)),
            };
            match result {
                Ok((response, reset)) => {
                    let outgoing = self.after_step(&mut core, before, reset);
                    (response, outgoing)
                }
                Err(e) => {
                    self.after_step(&mut core, before, false);
                    return Err(e);
                }
            }
        };
        self.dispatch(outgoing);
        Ok(response)
    }

    // -- timers --

    fn on_election_timeout(&self, epoch: u64) {
        let outgoing = {
            let mut core = self.lock();
            if core.stopped || core.epoch != epoch || core.node.is_leader() {
                return;
            }
            tracing::debug!(node_id = %self.shared.id, term = core.node.current_term(), "Election timeout");
            let before = core.position();
            let request = match core.node.start_election() {
                Ok(request) => request,
                Err(e) => {
                    tracing::error!(node_id = %self.shared.id, error = %e, "Could not start election");
                    self.after_step(&mut core, before, false);
                    return;
                }
            };

            let mut outgoing = self.after_step(&mut core, before, true);
            if let Some(req) = request {
                if core.node.state() == NodeState::Candidate {
                    for peer in core.node.peers() {
                        outgoing.push(Outgoing::Vote(peer.clone(), req.clone()));
                    }
                }
            }
            outgoing
        };
        self.dispatch(outgoing);
    }

    fn on_heartbeat(&self, epoch: u64) {
        let outgoing = {
            let core = self.lock();
            if core.stopped || core.epoch != epoch || !core.node.is_leader() {
                return;
            }
            Self::replicate_all(&core)
        };
        self.dispatch(outgoing);
    }

    fn reset_election_timer(&self, core: &mut Core<S, M>) {
        core.epoch += 1;
        let epoch = core.epoch;
        let weak = Arc::downgrade(&self.shared);
        let handle = self.shared.scheduler.schedule_once(
            election_timeout(&self.shared.config),
            Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    Raft { shared }.on_election_timeout(epoch);
                }
            }),
        );
        // replacing the handle cancels the previous timer
        core.election_timer = Some(handle);
    }

    fn start_heartbeats(&self, core: &mut Core<S, M>) {
        let epoch = core.epoch;
        let weak = Arc::downgrade(&self.shared);
        let handle = self.shared.scheduler.schedule_repeating(
            self.shared.config.heartbeat(),
            Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    Raft { shared }.on_heartbeat(epoch);
                }
            }),
        );
        core.heartbeat_timer = Some(handle);
    }

    // -- bookkeeping after every core operation --

    /// Re-arm timers for the new role, apply new commits, publish events.
    /// Returns rpcs to send once the lock is released.
    fn after_step(
        &self,
        core: &mut Core<S, M>,
        before: (NodeState, u64),
        reset_election: bool,
    ) -> Vec<Outgoing> {
        let mut outgoing = Vec::new();
        if core.node.is_halted() {
            self.halt(core);
            return outgoing;
        }

        let now = core.position();
        if now != before {
            core.epoch += 1;
            if now.0 == NodeState::Leader {
                core.election_timer = None;
                self.start_heartbeats(core);
                outgoing = Self::replicate_all(core);
            } else {
                core.heartbeat_timer = None;
                self.reset_election_timer(core);
            }
        } else if reset_election && now.0 != NodeState::Leader {
            self.reset_election_timer(core);
        }

        self.drop_superseded(core);
        self.apply_committed(core);
        self.publish(core);
        outgoing
    }

    /// Fail clients whose proposed entry is no longer in the log at its index
    fn drop_superseded(&self, core: &mut Core<S, M>) {
        let log = core.node.log();
        let stale: Vec<u64> = core
            .waiters
            .iter()
            .filter(|(index, waiter)| log.term_at(**index) != Some(waiter.term))
            .map(|(index, _)| *index)
            .collect();
        for index in stale {
            if let Some(waiter) = core.waiters.remove(&index) {
                tracing::debug!(
                    node_id = %self.shared.id,
                    index,
                    "Proposed entry was truncated by another leader"
                );
                let _ = waiter.tx.send(Err(RaftError::EntrySuperseded { index }));
            }
        }
    }

    fn replicate_all(core: &Core<S, M>) -> Vec<Outgoing> {
        core.node
            .peers()
            .filter_map(|peer| {
                core.node
                    .create_append_entries(peer)
                    .map(|req| Outgoing::Append(peer.clone(), req))
            })
            .collect()
    }

    fn apply_committed(&self, core: &mut Core<S, M>) {
        let last_applied = core.applier.last_applied();
        if core.node.commit_index() <= last_applied {
            return;
        }
        let entries = core.node.committed_entries(last_applied);
        for outcome in core.applier.apply(&entries) {
            let Some(waiter) = core.waiters.remove(&outcome.index) else {
                continue;
            };
            let reply = if waiter.term == outcome.term {
                outcome.result
            } else {
                tracing::debug!(
                    node_id = %self.shared.id,
                    index = outcome.index,
                    "Proposed entry was overwritten by another leader"
                );
                Err(RaftError::EntrySuperseded {
                    index: outcome.index,
                })
            };
            let _ = waiter.tx.send(reply);
        }
    }

    fn halt(&self, core: &mut Core<S, M>) {
        core.epoch += 1;
        core.election_timer = None;
        core.heartbeat_timer = None;
        core.fail_waiters(|| RaftError::Halted);
        self.publish(core);
    }

    fn publish(&self, core: &mut Core<S, M>) {
        self.shared.events.publish_all(core.node.take_events());
    }

    // -- outbound rpcs --

    fn dispatch(&self, outgoing: Vec<Outgoing>) {
        for message in outgoing {
            let raft = self.clone();
            match message {
                Outgoing::Vote(peer, req) => {
                    tokio::spawn(raft.send_vote(peer, req));
                }
                Outgoing::Append(peer, req) => {
                    tokio::spawn(raft.send_append(peer, req));
                }
            }
        }
    }

    async fn call(
        &self,
        peer: &NodeId,
        request: RaftRequest,
    ) -> std::result::Result<RaftResponse, TransportError> {
        let send = self.shared.transport.send(&self.shared.id, peer, request);
        match tokio::time::timeout(self.shared.config.rpc_deadline(), send).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(peer.clone())),
        }
    }

    async fn send_vote(self, peer: NodeId, req: RequestVoteRequest) {
        let result = self.call(&peer, RaftRequest::RequestVote(req)).await;
        let outgoing = {
            let mut core = self.lock();
            if core.stopped {
                return;
            }
            let Some(RaftResponse::RequestVote(resp)) = self.settle_reply(&mut core, &peer, result)
            else {
                return;
            };
            if core.node.is_halted() {
                return;
            }
            let before = core.position();
            if let Err(e) = core.node.handle_vote_response(&peer, &resp) {
                tracing::debug!(node_id = %self.shared.id, peer = %peer, error = %e, "Vote response not processed");
            }
            self.after_step(&mut core, before, false)
        };
        self.dispatch(outgoing);
    }

    async fn send_append(self, peer: NodeId, req: AppendEntriesRequest) {
        let result = self
            .call(&peer, RaftRequest::AppendEntries(req.clone()))
            .await;
        let outgoing = {
            let mut core = self.lock();
            if core.stopped {
                return;
            }
            let Some(RaftResponse::AppendEntries(resp)) = self.settle_reply(&mut core, &peer, result)
            else {
                return;
            };
            if core.node.is_halted() {
                return;
            }
            let before = core.position();
            let next_before = core.node.next_index(&peer);
            if let Err(e) = core.node.handle_append_entries_response(&peer, &req, &resp) {
                tracing::debug!(node_id = %self.shared.id, peer = %peer, error = %e, "Append response not processed");
            }
            let mut outgoing = self.after_step(&mut core, before, false);

            // keep the follower moving while it is behind and the last round made progress
            let next_after = core.node.next_index(&peer);
            if core.node.is_leader() && next_after != next_before {
                if let Some(next) = next_after {
                    if next <= core.node.last_log_index() {
                        if let Some(more) = core.node.create_append_entries(&peer) {
                            outgoing.push(Outgoing::Append(peer.clone(), more));
                        }
                    }
                }
            }
            outgoing
        };
        self.dispatch(outgoing);
    }

    /// Record whether `peer` answered, announcing joins and departures
    fn settle_reply(
        &self,
        core: &mut Core<S, M>,
        peer: &NodeId,
        result: std::result::Result<RaftResponse, TransportError>,
    ) -> Option<RaftResponse> {
        let answered = result.is_ok();
        let previous = core.reachable.insert(peer.clone(), answered);
        match (previous, answered) {
            (Some(true), false) => {
                tracing::warn!(node_id = %self.shared.id, peer = %peer, "Peer stopped responding");
                self.shared.events.publish(RaftEvent::NodeLeft {
                    node_id: peer.clone(),
                });
            }
            (None | Some(false), true) => {
                tracing::info!(node_id = %self.shared.id, peer = %peer, "Peer reachable");
                self.shared.events.publish(RaftEvent::NodeJoined {
                    node_id: peer.clone(),
                });
            }
            _ => {}
        }

        match result {
            Ok(response) => Some(response),
            Err(e) => {
                tracing::debug!(node_id = %self.shared.id, peer = %peer, error = %e, "Rpc failed");
                None
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core<S, M>> {
        self.shared
            .core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<S: Storage + 'static, M: StateMachine + 'static> RpcHandler for Raft<S, M> {
    async fn handle_rpc(&self, request: RaftRequest) -> Result<RaftResponse> {
        self.handle_request(request)
    }
}
