//! # storage
//!
//! why: the durability boundary raft writes through before answering anyone
//! relations: owned by node.rs; durable implementation lives in the raft-storage crate
//! what: Storage trait, PersistentState, InMemoryStorage

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::log::LogEntry;
use crate::NodeId;

/// Everything raft must find again after a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
}

/// trait for durable storage of raft state
///
/// every method returns only after the write is durable; the node never
/// answers an rpc or starts an election before the call has returned ok
pub trait Storage: Send {
    /// persist the current term
    fn save_term(&mut self, term: u64) -> Result<(), StorageError>;

    /// persist the vote cast in the current term
    fn save_voted_for(&mut self, voted_for: Option<&NodeId>) -> Result<(), StorageError>;

    /// persist term and vote together
    fn save_term_and_vote(
        &mut self,
        term: u64,
        voted_for: Option<&NodeId>,
    ) -> Result<(), StorageError> {
        self.save_term(term)?;
        self.save_voted_for(voted_for)
    }

    /// append a single entry to the log
    fn save_log_entry(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        self.append_entries(std::slice::from_ref(entry))
    }

    /// append entries to the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// drop the entry at `from_index` and everything after it
    fn truncate_log_from(&mut self, from_index: u64) -> Result<(), StorageError>;

    /// load everything (for crash recovery)
    fn load_state(&self) -> Result<PersistentState, StorageError>;

    /// clear all persisted state
    fn clear(&mut self) -> Result<(), StorageError>;
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        (**self).save_term(term)
    }

    fn save_voted_for(&mut self, voted_for: Option<&NodeId>) -> Result<(), StorageError> {
        (**self).save_voted_for(voted_for)
    }

    fn save_term_and_vote(
        &mut self,
        term: u64,
        voted_for: Option<&NodeId>,
    ) -> Result<(), StorageError> {
        (**self).save_term_and_vote(term, voted_for)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        (**self).append_entries(entries)
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<(), StorageError> {
        (**self).truncate_log_from(from_index)
    }

    fn load_state(&self) -> Result<PersistentState, StorageError> {
        (**self).load_state()
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        (**self).clear()
    }
}

// -- in-memory storage implementation --

/// in-memory storage
///
/// clones share the same state, so a node rebuilt from a clone sees what
/// the previous incarnation wrote; that is how tests model a restart.
/// `set_unavailable(true)` makes every call fail like a dead disk.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<PersistentState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, PersistentState>, StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("storage marked unavailable".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".to_string()))
    }
}

impl Storage for InMemoryStorage {
    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.lock()?.current_term = term;
        Ok(())
    }

    fn save_voted_for(&mut self, voted_for: Option<&NodeId>) -> Result<(), StorageError> {
        self.lock()?.voted_for = voted_for.cloned();
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.lock()?.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<(), StorageError> {
        self.lock()?.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn load_state(&self) -> Result<PersistentState, StorageError> {
        Ok(self.lock()?.clone())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        *self.lock()? = PersistentState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    #[test]
    fn clones_share_state() {
        let mut storage = InMemoryStorage::new();
        let reopened = storage.clone();

        storage.save_term_and_vote(3, Some(&"n2".to_string())).unwrap();
        storage
            .save_log_entry(&LogEntry::new(3, 1, Command::noop()))
            .unwrap();

        let state = reopened.load_state().unwrap();
        assert_eq!(state.current_term, 3);
        assert_eq!(state.voted_for.as_deref(), Some("n2"));
        assert_eq!(state.log.len(), 1);
    }

    #[test]
    fn unavailable_storage_fails_every_call() {
        let mut storage = InMemoryStorage::new();
        storage.set_unavailable(true);
        assert!(matches!(
            storage.save_term(1),
            Err(StorageError::Unavailable(_))
        ));
        assert!(storage.load_state().is_err());

        storage.set_unavailable(false);
        assert!(storage.save_term(1).is_ok());
    }
}
