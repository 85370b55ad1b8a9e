//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, mirrored into storage on every mutation
//! what: LogEntry struct, RaftLog with sentinel-aware lookups, truncation, conflict search

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::command::Command;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The term when this entry was created
    pub term: u64,
    /// The command to be applied to the state machine
    pub command: Command,
    /// Unix milliseconds at which the leader created the entry
    pub timestamp: u64,
}

impl LogEntry {
    /// Create a new log entry stamped with the current wall clock
    pub fn new(term: u64, index: u64, command: Command) -> Self {
        Self {
            index,
            term,
            command,
            timestamp: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-memory view of the replicated log.
///
/// Positions are 1-based. Index 0 is a sentinel that holds no entry and
/// reports term 0, which is what `prev_log_index`/`prev_log_term` checks
/// fall back to on an empty log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from entries loaded out of storage.
    ///
    /// Entries must start at index 1 and be contiguous.
    pub fn from_entries(entries: Vec<LogEntry>) -> Option<Self> {
        let contiguous = entries
            .iter()
            .enumerate()
            .all(|(pos, e)| e.index == pos as u64 + 1);
        contiguous.then_some(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Entry at `index`, `None` for the sentinel or past the end
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term at `index`; 0 for the sentinel, `None` past the end
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// Up to `max` entries starting at `from` (inclusive)
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].iter().take(max).cloned().collect()
    }

    /// Entries in `[from, to]`, clamped to what the log holds
    pub fn range(&self, from: u64, to: u64) -> Vec<LogEntry> {
        if from == 0 || to < from {
            return Vec::new();
        }
        let start = (from - 1) as usize;
        let end = (to as usize).min(self.entries.len());
        if start >= end {
            return Vec::new();
        }
        self.entries[start..end].to_vec()
    }

    /// Append an entry; its index must be `last_index() + 1`
    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Drop `index` and everything after it
    pub fn truncate_from(&mut self, index: u64) {
        let keep = index.max(1) as usize - 1;
        self.entries.truncate(keep);
    }

    /// First index holding `term`, scanning back from `from`
    pub fn first_index_of_term(&self, term: u64, from: u64) -> u64 {
        let mut index = from.min(self.last_index());
        while index > 1 && self.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }

    /// Last index holding `term`, if the log contains that term at all
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(term, index, Command::noop())
    }

    fn log_with_terms(terms: &[u64]) -> RaftLog {
        let mut log = RaftLog::new();
        for (pos, term) in terms.iter().enumerate() {
            log.push(entry(*term, pos as u64 + 1));
        }
        log
    }

    #[test]
    fn sentinel_has_term_zero() {
        let log = RaftLog::new();
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
        assert!(log.get(0).is_none());
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
    }

    #[test]
    fn entries_from_respects_batch_limit() {
        let log = log_with_terms(&[1, 1, 2, 2, 3]);
        let batch = log.entries_from(2, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].index, 2);
        assert_eq!(batch[1].index, 3);
        assert!(log.entries_from(6, 10).is_empty());
    }

    #[test]
    fn truncate_drops_suffix_inclusive() {
        let mut log = log_with_terms(&[1, 1, 2]);
        log.truncate_from(2);
        assert_eq!(log.last_index(), 1);
        log.truncate_from(1);
        assert!(log.is_empty());
    }

    #[test]
    fn term_boundaries() {
        let log = log_with_terms(&[1, 2, 2, 2, 4]);
        assert_eq!(log.first_index_of_term(2, 4), 2);
        assert_eq!(log.first_index_of_term(4, 5), 5);
        assert_eq!(log.last_index_of_term(2), Some(4));
        assert_eq!(log.last_index_of_term(3), None);
    }

    #[test]
    fn from_entries_rejects_gaps() {
        assert!(RaftLog::from_entries(vec![entry(1, 1), entry(1, 3)]).is_none());
        assert!(RaftLog::from_entries(vec![entry(1, 2)]).is_none());
        assert!(RaftLog::from_entries(vec![entry(1, 1), entry(2, 2)]).is_some());
    }

    #[test]
    fn range_is_clamped() {
        let log = log_with_terms(&[1, 1, 1]);
        assert_eq!(log.range(2, 10).len(), 2);
        assert!(log.range(0, 2).is_empty());
        assert!(log.range(3, 2).is_empty());
    }
}
