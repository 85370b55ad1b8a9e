//! # state_machine
//!
//! why: the contract between raft and whatever the cluster is replicating
//! relations: driven by applier.rs; KeyValueStore backs the runtime tests and raft-sim
//! what: StateMachine trait, KeyValueStore reference implementation with request dedup

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::{RaftError, Result};

/// Deterministic state replicated by raft.
///
/// `apply` must produce the same result on every node for the same
/// sequence of commands.
pub trait StateMachine: Send {
    fn apply(&mut self, command: &Command) -> Result<Vec<u8>>;

    /// Human-readable view of the current state
    fn get_state(&self) -> serde_json::Value;

    fn create_snapshot(&self) -> Result<Vec<u8>>;

    fn restore_from_snapshot(&mut self, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvOp {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

/// In-memory string map.
///
/// Commands: `put` / `delete` / `get`, with `data` a JSON object
/// `{"key": .., "value": ..}`; `noop` does nothing. The result is the
/// previous (or, for `get`, current) value as UTF-8, empty when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueStore {
    data: BTreeMap<String, String>,
    /// last (request_id, result) answered per client
    sessions: HashMap<String, (u64, Vec<u8>)>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_command(key: &str, value: &str) -> Command {
        let op = serde_json::json!({ "key": key, "value": value });
        Command::new("put", op.to_string().into_bytes())
    }

    pub fn delete_command(key: &str) -> Command {
        let op = serde_json::json!({ "key": key });
        Command::new("delete", op.to_string().into_bytes())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn execute(&mut self, command: &Command) -> Result<Vec<u8>> {
        if command.is_noop() {
            return Ok(Vec::new());
        }
        let op: KvOp = serde_json::from_slice(&command.data)
            .map_err(|e| RaftError::StateMachine(format!("bad {} payload: {}", command.kind, e)))?;

        let previous = match command.kind.as_str() {
            "put" => {
                let value = op.value.ok_or_else(|| {
                    RaftError::StateMachine(format!("put of {} without a value", op.key))
                })?;
                self.data.insert(op.key, value)
            }
            "delete" => self.data.remove(&op.key),
            "get" => self.data.get(&op.key).cloned(),
            other => {
                return Err(RaftError::StateMachine(format!("unknown command kind {}", other)))
            }
        };
        Ok(previous.map(String::into_bytes).unwrap_or_default())
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, command: &Command) -> Result<Vec<u8>> {
        if let (Some(client), Some(request)) = (&command.client_id, command.request_id) {
            if let Some((last, result)) = self.sessions.get(client) {
                if *last == request {
                    return Ok(result.clone());
                }
            }
            let result = self.execute(command)?;
            self.sessions
                .insert(client.clone(), (request, result.clone()));
            return Ok(result);
        }
        self.execute(command)
    }

    fn get_state(&self) -> serde_json::Value {
        serde_json::to_value(&self.data).unwrap_or_default()
    }

    fn create_snapshot(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RaftError::StateMachine(e.to_string()))
    }

    fn restore_from_snapshot(&mut self, bytes: &[u8]) -> Result<()> {
        *self = serde_json::from_slice(bytes).map_err(|e| RaftError::StateMachine(e.to_string()))?;
        Ok(())
    }
}
