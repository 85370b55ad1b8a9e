//! # command
//!
//! why: describe what clients submit and what they get back
//! relations: carried inside LogEntry, consumed by the state machine, returned by the runtime
//! what: Command payload, ClientResponse envelope

use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::NodeId;

/// An opaque client command.
///
/// `kind` names the operation, `data` is interpreted only by the state
/// machine. `client_id`/`request_id` let the state machine drop
/// duplicate submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: String,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

impl Command {
    pub fn new(kind: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            data: data.into(),
            client_id: None,
            request_id: None,
        }
    }

    /// A command with no effect on the state machine
    pub fn noop() -> Self {
        Self::new("noop", Vec::new())
    }

    /// Tag the command for deduplication
    pub fn with_request(mut self, client_id: impl Into<String>, request_id: u64) -> Self {
        self.client_id = Some(client_id.into());
        self.request_id = Some(request_id);
        self
    }

    pub fn is_noop(&self) -> bool {
        self.kind == "noop"
    }
}

/// What a client sees after `submit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last known leader, set when the node refused because it is not leader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<NodeId>,
    /// Whether retrying the same request later can succeed
    #[serde(default)]
    pub retryable: bool,
}

impl ClientResponse {
    pub fn ok(result: Vec<u8>) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            leader_id: None,
            retryable: false,
        }
    }

    pub fn failed(error: &RaftError) -> Self {
        let leader_id = match error {
            RaftError::NotLeader { leader_id } => leader_id.clone(),
            _ => None,
        };
        Self {
            success: false,
            result: None,
            error: Some(error.to_string()),
            leader_id,
            retryable: error.is_retryable(),
        }
    }
}

impl From<Result<Vec<u8>, RaftError>> for ClientResponse {
    fn from(result: Result<Vec<u8>, RaftError>) -> Self {
        match result {
            Ok(bytes) => Self::ok(bytes),
            Err(e) => Self::failed(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_response_carries_redirect() {
        let err = RaftError::NotLeader {
            leader_id: Some("n2".to_string()),
        };
        let response = ClientResponse::failed(&err);
        assert!(!response.success);
        assert_eq!(response.leader_id.as_deref(), Some("n2"));
        assert!(!response.retryable);
    }

    #[test]
    fn commit_timeout_is_retryable() {
        let response = ClientResponse::failed(&RaftError::CommitTimeout { index: 4 });
        assert!(response.retryable);
        assert!(response.leader_id.is_none());
    }

    #[test]
    fn command_json_omits_missing_ids() {
        let json = serde_json::to_string(&Command::new("put", b"k=v".to_vec())).unwrap();
        assert!(!json.contains("client_id"));
        let tagged = Command::noop().with_request("c1", 9);
        let back: Command = serde_json::from_str(&serde_json::to_string(&tagged).unwrap()).unwrap();
        assert_eq!(back.request_id, Some(9));
    }
}
