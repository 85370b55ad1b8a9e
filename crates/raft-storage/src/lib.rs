//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: implements raft-core's Storage trait; the runtime and raft-sim open it per node
//! what: FileStorage (json files, write-temp-then-rename), re-exported in-memory storage

use raft_core::{LogEntry, NodeId, PersistentState, StorageError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub use raft_core::{InMemoryStorage, Storage};

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term and voted_for
/// - log.json: array of log entries
///
/// every write goes to a temp file, is fsynced, then renamed over the
/// target, so a crash leaves either the old or the new file
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    /// cached copy of the log so appends do not re-read the file
    log: Vec<LogEntry>,
    meta: MetaData,
}

/// metadata structure for term and vote
#[derive(Serialize, Deserialize, Default, Clone)]
struct MetaData {
    term: u64,
    voted_for: Option<NodeId>,
}

impl FileStorage {
    /// open (or create) storage in `dir`, loading whatever is already there
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let meta = read_json(&dir.join(META_FILE))?.unwrap_or_default();
        let log = read_json(&dir.join(LOG_FILE))?.unwrap_or_default();
        Ok(Self { dir, log, meta })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// get the path to the metadata file
    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    /// get the path to the log file
    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn write_meta(&self, meta: &MetaData) -> Result<(), StorageError> {
        write_atomic(&self.dir, &self.meta_path(), meta)
    }

    fn write_log(&self, log: &[LogEntry]) -> Result<(), StorageError> {
        write_atomic(&self.dir, &self.log_path(), log)
    }
}

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

fn write_atomic<T: Serialize + ?Sized>(dir: &Path, target: &Path, value: &T) -> Result<(), StorageError> {
    let json = serde_json::to_string_pretty(value)?;
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let temp_path = dir.join(format!("{}.tmp", file_name));

    let mut file = File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    fs::rename(&temp_path, target)?;
    Ok(())
}

impl Storage for FileStorage {
    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        let meta = MetaData {
            term,
            voted_for: self.meta.voted_for.clone(),
        };
        self.write_meta(&meta)?;
        self.meta = meta;
        Ok(())
    }

    fn save_voted_for(&mut self, voted_for: Option<&NodeId>) -> Result<(), StorageError> {
        let meta = MetaData {
            term: self.meta.term,
            voted_for: voted_for.cloned(),
        };
        self.write_meta(&meta)?;
        self.meta = meta;
        Ok(())
    }

    fn save_term_and_vote(
        &mut self,
        term: u64,
        voted_for: Option<&NodeId>,
    ) -> Result<(), StorageError> {
        let meta = MetaData {
            term,
            voted_for: voted_for.cloned(),
        };
        self.write_meta(&meta)?;
        self.meta = meta;
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut log = self.log.clone();
        log.extend(entries.iter().cloned());
        self.write_log(&log)?;
        self.log = log;
        Ok(())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<(), StorageError> {
        let log: Vec<LogEntry> = self
            .log
            .iter()
            .filter(|e| e.index < from_index)
            .cloned()
            .collect();
        self.write_log(&log)?;
        self.log = log;
        Ok(())
    }

    fn load_state(&self) -> Result<PersistentState, StorageError> {
        let meta: MetaData = read_json(&self.meta_path())?.unwrap_or_default();
        let log: Vec<LogEntry> = read_json(&self.log_path())?.unwrap_or_default();
        Ok(PersistentState {
            current_term: meta.term,
            voted_for: meta.voted_for,
            log,
        })
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        let _ = fs::remove_file(self.meta_path());
        let _ = fs::remove_file(self.log_path());
        self.meta = MetaData::default();
        self.log.clear();
        Ok(())
    }
}
