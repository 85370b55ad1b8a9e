//! # event bus
//!
//! why: fan node notifications out to any number of observers without blocking the node
//! relations: fed by raft.rs from RaftNode::take_events and peer reachability
//! what: EventBus over a tokio broadcast channel

use raft_core::RaftEvent;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Publisher half of the event stream.
///
/// Slow subscribers lag and lose the oldest events; publishing never waits.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RaftEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RaftEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: RaftEvent) {
        tracing::trace!(?event, "Publishing event");
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = RaftEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
