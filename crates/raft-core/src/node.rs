//! # node
//!
//! why: the raft protocol itself, as a synchronous single-writer state machine
//! relations: uses log.rs for entries, message.rs for rpcs, storage.rs for durability;
//!            driven by raft-runtime which owns timers and the network
//! what: NodeState, RaftNode with election, replication and commit logic
//!
//! Every mutation of term, vote or log goes to storage first and only then
//! to memory. A storage failure halts the node: it stops answering rpcs and
//! accepting commands until `recover` reloads a consistent state.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::config::{ClusterConfig, RaftConfig};
use crate::error::{RaftError, Result, StorageError};
use crate::event::RaftEvent;
use crate::log::{LogEntry, RaftLog};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use crate::storage::Storage;
use crate::NodeId;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// Point-in-time view of a node for monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub halted: bool,
}

/// A single Raft node in the cluster
pub struct RaftNode<S: Storage> {
    pub(crate) id: NodeId,
    pub(crate) cluster_nodes: Vec<NodeId>,
    pub(crate) config: RaftConfig,

    pub(crate) state: NodeState,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) log: RaftLog,

    pub(crate) commit_index: u64,
    pub(crate) leader_id: Option<NodeId>,
    pub(crate) votes_received: HashSet<NodeId>,

    // leader only, rebuilt on every election win
    pub(crate) next_index: HashMap<NodeId, u64>,
    pub(crate) match_index: HashMap<NodeId, u64>,

    halted: bool,
    storage: S,
    events: Vec<RaftEvent>,
}

impl<S: Storage> fmt::Debug for RaftNode<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftNode")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("current_term", &self.current_term)
            .field("voted_for", &self.voted_for)
            .field("last_log_index", &self.log.last_index())
            .field("commit_index", &self.commit_index)
            .field("halted", &self.halted)
            .finish()
    }
}

impl<S: Storage> RaftNode<S> {
    /// Create a node in Follower state from whatever `storage` holds.
    ///
    /// A fresh storage yields term 0 and an empty log; a reused one
    /// restores term, vote and log from the previous incarnation.
    pub fn new(cluster: ClusterConfig, storage: S) -> Result<Self> {
        cluster.validate()?;
        let persisted = storage.load_state()?;
        let log = RaftLog::from_entries(persisted.log)
            .ok_or_else(|| StorageError::Corrupt("log indexes are not contiguous".to_string()))?;

        tracing::info!(
            node_id = %cluster.node_id,
            term = persisted.current_term,
            last_log_index = log.last_index(),
            "Loaded persistent state"
        );

        Ok(Self {
            id: cluster.node_id,
            cluster_nodes: cluster.members,
            config: cluster.raft,
            state: NodeState::Follower,
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            log,
            commit_index: 0,
            leader_id: None,
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            halted: false,
            storage,
            events: Vec::new(),
        })
    }

    // -- accessors --

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    /// Leader this node currently believes in (itself when leading)
    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn cluster_nodes(&self) -> &[NodeId] {
        &self.cluster_nodes
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn votes_received(&self) -> &HashSet<NodeId> {
        &self.votes_received
    }

    pub fn next_index(&self, peer: &NodeId) -> Option<u64> {
        self.next_index.get(peer).copied()
    }

    pub fn match_index(&self, peer: &NodeId) -> Option<u64> {
        self.match_index.get(peer).copied()
    }

    /// Members other than this node
    pub fn peers(&self) -> impl Iterator<Item = &NodeId> {
        self.cluster_nodes.iter().filter(move |n| **n != self.id)
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.get(index)
    }

    /// Term at `index`, 0 when there is no such entry
    pub fn get_term_at(&self, index: u64) -> u64 {
        self.log.term_at(index).unwrap_or(0)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            state: self.state,
            term: self.current_term,
            voted_for: self.voted_for.clone(),
            leader_id: self.leader_id.clone(),
            last_log_index: self.log.last_index(),
            commit_index: self.commit_index,
            halted: self.halted,
        }
    }

    /// Drain notifications queued since the last call
    pub fn take_events(&mut self) -> Vec<RaftEvent> {
        std::mem::take(&mut self.events)
    }

    // -- quorum --

    /// Strict majority of configured members, self included
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    /// Whether a candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        (last_log_term, last_log_index) >= (self.log.last_term(), self.log.last_index())
    }

    // -- role transitions --

    /// Adopt `term` (if newer) and fall back to Follower
    pub fn become_follower(&mut self, term: u64) -> Result<()> {
        self.ensure_active()?;
        if term > self.current_term {
            self.adopt_term(term)?;
        }
        self.set_state(NodeState::Follower);
        Ok(())
    }

    /// Start a new election after an election timeout.
    ///
    /// Returns the RequestVote to broadcast, or `None` when this node is
    /// leader (leaders never become candidates directly). A single-member
    /// cluster wins immediately.
    pub fn start_election(&mut self) -> Result<Option<RequestVoteRequest>> {
        self.ensure_active()?;
        if self.state == NodeState::Leader {
            return Ok(None);
        }

        let term = self.current_term + 1;
        let id = self.id.clone();
        self.persist("start election", |s| s.save_term_and_vote(term, Some(&id)))?;

        self.current_term = term;
        self.voted_for = Some(id.clone());
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(id.clone());
        self.set_state(NodeState::Candidate);

        tracing::info!(node_id = %self.id, term, "Starting election");

        if self.has_quorum() {
            self.become_leader();
        }

        Ok(Some(RequestVoteRequest {
            term,
            candidate_id: id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }))
    }

    fn become_leader(&mut self) {
        self.set_state(NodeState::Leader);
        self.leader_id = Some(self.id.clone());
        self.votes_received.clear();

        let next = self.log.last_index() + 1;
        let peers: Vec<NodeId> = self.peers().cloned().collect();
        self.next_index.clear();
        self.match_index.clear();
        for peer in peers {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer, 0);
        }

        tracing::info!(node_id = %self.id, term = self.current_term, "Became leader");
        self.events.push(RaftEvent::LeaderElected {
            leader_id: self.id.clone(),
            term: self.current_term,
        });

        // a lone leader already holds a quorum of its own log
        self.advance_commit_index();
    }

    // -- election rpcs --

    /// Answer a RequestVote. The bool asks the caller to reset its election timer.
    pub fn handle_request_vote(
        &mut self,
        req: &RequestVoteRequest,
    ) -> Result<(RequestVoteResponse, bool)> {
        self.ensure_active()?;

        if req.term < self.current_term {
            tracing::debug!(
                node_id = %self.id,
                candidate = %req.candidate_id,
                term = req.term,
                current_term = self.current_term,
                "Rejecting vote for stale term"
            );
            return Ok((self.vote_response(false), false));
        }
        if req.term > self.current_term {
            self.adopt_term(req.term)?;
        }

        let free_to_vote = match &self.voted_for {
            None => true,
            Some(v) => *v == req.candidate_id,
        };
        let granted = free_to_vote && self.is_log_up_to_date(req.last_log_index, req.last_log_term);

        if granted && self.voted_for.as_ref() != Some(&req.candidate_id) {
            let candidate = req.candidate_id.clone();
            self.persist("grant vote", |s| s.save_voted_for(Some(&candidate)))?;
            self.voted_for = Some(candidate);
        }

        tracing::debug!(
            node_id = %self.id,
            candidate = %req.candidate_id,
            term = self.current_term,
            granted,
            "Handled vote request"
        );
        Ok((self.vote_response(granted), granted))
    }

    fn vote_response(&self, vote_granted: bool) -> RequestVoteResponse {
        RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a vote. Returns true when this response made us leader.
    pub fn handle_vote_response(&mut self, from: &NodeId, resp: &RequestVoteResponse) -> Result<bool> {
        self.ensure_active()?;

        if resp.term > self.current_term {
            self.adopt_term(resp.term)?;
            return Ok(false);
        }
        if self.state != NodeState::Candidate || resp.term != self.current_term {
            return Ok(false);
        }
        if !resp.vote_granted || !self.cluster_nodes.contains(from) {
            return Ok(false);
        }

        self.votes_received.insert(from.clone());
        tracing::debug!(
            node_id = %self.id,
            peer = %from,
            votes = self.votes_received.len(),
            needed = self.quorum_size(),
            "Received vote"
        );

        if self.has_quorum() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    // -- replication, leader side --

    /// Append a client command to the leader's log.
    ///
    /// The entry is durable on return but not committed.
    pub fn propose(&mut self, command: Command) -> Result<LogEntry> {
        self.ensure_active()?;
        if self.state != NodeState::Leader {
            return Err(RaftError::NotLeader {
                leader_id: self.leader_id.clone(),
            });
        }

        let entry = LogEntry::new(self.current_term, self.log.last_index() + 1, command);
        self.persist("append client entry", |s| s.save_log_entry(&entry))?;
        self.log.push(entry.clone());

        tracing::debug!(
            node_id = %self.id,
            index = entry.index,
            term = entry.term,
            "Appended command to log"
        );

        self.advance_commit_index();
        Ok(entry)
    }

    /// AppendEntries for `peer` from its next_index, up to the batch limit
    pub fn create_append_entries(&self, peer: &NodeId) -> Option<AppendEntriesRequest> {
        let mut req = self.create_heartbeat(peer)?;
        req.entries = self
            .log
            .entries_from(req.prev_log_index + 1, self.config.max_batch_size);
        Some(req)
    }

    /// Empty AppendEntries for `peer`, anchored at its next_index
    pub fn create_heartbeat(&self, peer: &NodeId) -> Option<AppendEntriesRequest> {
        if self.state != NodeState::Leader || self.halted || *peer == self.id {
            return None;
        }
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1)
            .clamp(1, self.log.last_index() + 1);
        let prev_log_index = next - 1;

        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries: Vec::new(),
            leader_commit: self.commit_index,
        })
    }

    /// Process a follower's answer to `req`. Returns true if commit advanced.
    ///
    /// A rejection only moves next_index backwards; the leader's own log is
    /// never altered by a follower.
    pub fn handle_append_entries_response(
        &mut self,
        from: &NodeId,
        req: &AppendEntriesRequest,
        resp: &AppendEntriesResponse,
    ) -> Result<bool> {
        self.ensure_active()?;

        if resp.term > self.current_term {
            self.adopt_term(resp.term)?;
            return Ok(false);
        }
        if self.state != NodeState::Leader || req.term != self.current_term {
            return Ok(false);
        }
        let Some(current_next) = self.next_index.get(from).copied() else {
            return Ok(false);
        };
        let current_match = self.match_index.get(from).copied().unwrap_or(0);

        if resp.success {
            let matched = req.last_index().max(current_match);
            self.match_index.insert(from.clone(), matched);
            self.next_index
                .insert(from.clone(), current_next.max(matched + 1));
            tracing::debug!(
                node_id = %self.id,
                peer = %from,
                match_index = matched,
                "Replication progress"
            );
            return Ok(self.advance_commit_index());
        }

        let hinted = match (resp.conflict_term, resp.conflict_index) {
            (Some(term), conflict_index) => self
                .log
                .last_index_of_term(term)
                .map(|last| last + 1)
                .or(conflict_index),
            (None, conflict_index) => conflict_index,
        };
        let candidate = hinted
            .unwrap_or(req.prev_log_index)
            .min(req.prev_log_index)
            .max(current_match + 1)
            .max(1);

        if candidate < current_next {
            self.next_index.insert(from.clone(), candidate);
            tracing::debug!(
                node_id = %self.id,
                peer = %from,
                next_index = candidate,
                "Follower rejected entries, backing off"
            );
        }
        Ok(false)
    }

    /// Move commit_index to the highest current-term index held by a quorum
    fn advance_commit_index(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }

        let mut replicated: Vec<u64> = self
            .peers()
            .map(|p| self.match_index.get(p).copied().unwrap_or(0))
            .collect();
        replicated.push(self.log.last_index());
        replicated.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = replicated[self.quorum_size() - 1];
        // entries from earlier terms only commit underneath a current-term entry
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term) {
            self.set_commit_index(candidate);
            return true;
        }
        false
    }

    fn set_commit_index(&mut self, index: u64) {
        for i in self.commit_index + 1..=index {
            if let Some(entry) = self.log.get(i) {
                self.events.push(RaftEvent::LogCommitted {
                    index: i,
                    command: entry.command.clone(),
                });
            }
        }
        tracing::debug!(node_id = %self.id, commit_index = index, "Updated commit index");
        self.commit_index = index;
    }

    // -- replication, follower side --

    /// Answer an AppendEntries. The bool asks the caller to reset its election timer.
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
    ) -> Result<(AppendEntriesResponse, bool)> {
        self.ensure_active()?;

        if req.term < self.current_term {
            return Ok((AppendEntriesResponse::rejected(self.current_term), false));
        }
        if req.term > self.current_term {
            self.adopt_term(req.term)?;
        }
        if self.state == NodeState::Leader {
            tracing::error!(
                node_id = %self.id,
                other = %req.leader_id,
                term = req.term,
                "Second leader in the same term"
            );
        }
        self.set_state(NodeState::Follower);
        self.leader_id = Some(req.leader_id.clone());

        match self.log.term_at(req.prev_log_index) {
            None => {
                let mut resp = AppendEntriesResponse::rejected(self.current_term);
                resp.conflict_index = Some(self.log.last_index() + 1);
                return Ok((resp, true));
            }
            Some(term) if term != req.prev_log_term => {
                let mut resp = AppendEntriesResponse::rejected(self.current_term);
                resp.conflict_term = Some(term);
                resp.conflict_index = Some(self.log.first_index_of_term(term, req.prev_log_index));
                return Ok((resp, true));
            }
            Some(_) => {}
        }

        // skip entries we already hold; the first mismatch marks the cut
        let first_new = req
            .entries
            .iter()
            .position(|e| self.log.term_at(e.index) != Some(e.term));

        if let Some(pos) = first_new {
            let new_entries = &req.entries[pos..];
            let cut = new_entries[0].index;
            if cut <= self.log.last_index() {
                debug_assert!(cut > self.commit_index, "leader overwrote a committed entry");
                self.persist("truncate conflicting suffix", |s| s.truncate_log_from(cut))?;
                self.log.truncate_from(cut);
                tracing::debug!(node_id = %self.id, from_index = cut, "Truncated conflicting entries");
            }
            self.persist("append replicated entries", |s| s.append_entries(new_entries))?;
            for entry in new_entries {
                self.log.push(entry.clone());
            }
        }

        let last_new = req.last_index();
        if req.leader_commit > self.commit_index {
            let target = req.leader_commit.min(last_new);
            if target > self.commit_index {
                self.set_commit_index(target);
            }
        }

        Ok((AppendEntriesResponse::accepted(self.current_term), true))
    }

    /// Committed entries after `after`, in index order
    pub fn committed_entries(&self, after: u64) -> Vec<LogEntry> {
        self.log.range(after + 1, self.commit_index)
    }

    // -- storage failure handling --

    /// Reload from storage after a persistence failure and rejoin as Follower
    pub fn recover(&mut self) -> Result<()> {
        let persisted = self.storage.load_state()?;
        let log = RaftLog::from_entries(persisted.log)
            .ok_or_else(|| StorageError::Corrupt("log indexes are not contiguous".to_string()))?;

        self.current_term = persisted.current_term;
        self.voted_for = persisted.voted_for;
        self.commit_index = self.commit_index.min(log.last_index());
        self.log = log;
        self.leader_id = None;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.halted = false;
        self.set_state(NodeState::Follower);

        tracing::info!(node_id = %self.id, term = self.current_term, "Recovered from storage");
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.halted {
            return Err(RaftError::Halted);
        }
        Ok(())
    }

    /// Run a storage write; on failure halt the node and surface the error
    fn persist<T>(
        &mut self,
        context: &str,
        write: impl FnOnce(&mut S) -> std::result::Result<T, StorageError>,
    ) -> Result<T> {
        match write(&mut self.storage) {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::error!(node_id = %self.id, error = %e, context, "Persistence failure, halting");
                self.events.push(RaftEvent::error(&e, context));
                self.halted = true;
                self.set_state(NodeState::Follower);
                self.leader_id = None;
                Err(RaftError::Storage(e))
            }
        }
    }

    /// Durably move to a higher term with no vote, as Follower
    fn adopt_term(&mut self, term: u64) -> Result<()> {
        debug_assert!(term > self.current_term);
        self.persist("adopt higher term", |s| s.save_term_and_vote(term, None))?;
        tracing::debug!(
            node_id = %self.id,
            old_term = self.current_term,
            term,
            "Observed higher term"
        );
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
        self.votes_received.clear();
        self.set_state(NodeState::Follower);
        Ok(())
    }

    fn set_state(&mut self, new: NodeState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        if old == NodeState::Leader {
            self.next_index.clear();
            self.match_index.clear();
        }
        tracing::info!(node_id = %self.id, %old, %new, term = self.current_term, "State changed");
        self.events.push(RaftEvent::StateChanged {
            node_id: self.id.clone(),
            old,
            new,
            term: self.current_term,
        });
    }
}
