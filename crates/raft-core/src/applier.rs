//! # applier
//!
//! why: turn committed log entries into state machine effects, once each, in order
//! relations: fed from node.rs committed_entries, wraps a state_machine.rs implementation
//! what: Applier with last_applied tracking, Applied results, snapshot blob with embedded index

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::log::LogEntry;
use crate::state_machine::StateMachine;

/// Outcome of applying one entry
#[derive(Debug)]
pub struct Applied {
    pub index: u64,
    pub term: u64,
    pub result: Result<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    last_applied: u64,
    data: Vec<u8>,
}

pub struct Applier<M: StateMachine> {
    state_machine: M,
    last_applied: u64,
}

impl<M: StateMachine> Applier<M> {
    pub fn new(state_machine: M) -> Self {
        Self {
            state_machine,
            last_applied: 0,
        }
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn state_machine(&self) -> &M {
        &self.state_machine
    }

    /// Apply `entries` in order.
    ///
    /// Entries at or below `last_applied` are skipped; application stops at
    /// the first gap. Entries must already be committed.
    pub fn apply(&mut self, entries: &[LogEntry]) -> Vec<Applied> {
        let mut applied = Vec::new();
        for entry in entries {
            if entry.index <= self.last_applied {
                continue;
            }
            if entry.index != self.last_applied + 1 {
                tracing::warn!(
                    index = entry.index,
                    last_applied = self.last_applied,
                    "Gap in committed entries, stopping"
                );
                break;
            }
            let result = self.state_machine.apply(&entry.command);
            if let Err(e) = &result {
                tracing::warn!(index = entry.index, error = %e, "Command failed in state machine");
            }
            self.last_applied = entry.index;
            applied.push(Applied {
                index: entry.index,
                term: entry.term,
                result,
            });
        }
        applied
    }

    /// Opaque snapshot of the state machine, tagged with `last_applied`
    pub fn create_snapshot(&self) -> Result<Vec<u8>> {
        let envelope = SnapshotEnvelope {
            last_applied: self.last_applied,
            data: self.state_machine.create_snapshot()?,
        };
        serde_json::to_vec(&envelope).map_err(|e| RaftError::StateMachine(e.to_string()))
    }

    /// Replace the state machine contents; `last_applied` becomes the snapshot's index
    pub fn restore_from_snapshot(&mut self, bytes: &[u8]) -> Result<()> {
        let envelope: SnapshotEnvelope =
            serde_json::from_slice(bytes).map_err(|e| RaftError::StateMachine(e.to_string()))?;
        self.state_machine.restore_from_snapshot(&envelope.data)?;
        self.last_applied = envelope.last_applied;
        tracing::info!(last_applied = self.last_applied, "Restored state machine from snapshot");
        Ok(())
    }
}
